//! Scheduler contact file
//!
//! A JSON file in the run directory records the running scheduler's
//! identity. Its disappearance or modification means another party took
//! over (or the run directory was damaged) and triggers shutdown.

use crate::error::SchedulerError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

/// File name of the contact file in the run directory
pub const CONTACT_FILE_NAME: &str = "contact.json";

/// Identity of a running scheduler
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactInfo {
    /// Run UUID, regenerated each start
    pub uuid: String,
    /// Host the scheduler runs on
    pub host: String,
    /// Command port, if a server front-end is attached
    pub port: Option<u16>,
    /// Scheduler process id
    pub pid: u32,
}

/// Handle to the contact file of one run directory
#[derive(Debug, Clone)]
pub struct ContactFile {
    path: PathBuf,
}

impl ContactFile {
    /// Contact file handle for a run directory
    pub fn new(run_dir: &Path) -> Self {
        Self {
            path: run_dir.join(CONTACT_FILE_NAME),
        }
    }

    /// Write the contact file for this run
    pub fn write(&self, info: &ContactInfo) -> Result<(), SchedulerError> {
        let body = serde_json::to_string_pretty(info)
            .map_err(|e| SchedulerError::Internal(format!("contact file encode: {}", e)))?;
        std::fs::write(&self.path, body)
            .map_err(|e| SchedulerError::ContactFileLost(e.to_string()))?;
        info!(path = %self.path.display(), "wrote contact file");
        Ok(())
    }

    /// Read the contact file, if present
    pub fn read(&self) -> Option<ContactInfo> {
        let body = std::fs::read_to_string(&self.path).ok()?;
        serde_json::from_str(&body).ok()
    }

    /// Verify the file still exists and still names this run
    pub fn check(&self, expected_uuid: &str) -> Result<(), SchedulerError> {
        match self.read() {
            Some(info) if info.uuid == expected_uuid => Ok(()),
            Some(info) => Err(SchedulerError::ContactFileLost(format!(
                "contact file now names run {}",
                info.uuid
            ))),
            None => Err(SchedulerError::ContactFileLost(
                "contact file missing or unreadable".to_string(),
            )),
        }
    }

    /// Remove the contact file at shutdown
    pub fn remove(&self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(uuid: &str) -> ContactInfo {
        ContactInfo {
            uuid: uuid.to_string(),
            host: "localhost".to_string(),
            port: None,
            pid: 4242,
        }
    }

    #[test]
    fn test_write_read_check() {
        let dir = tempfile::tempdir().unwrap();
        let contact = ContactFile::new(dir.path());
        contact.write(&info("run-1")).unwrap();

        assert_eq!(contact.read().unwrap().uuid, "run-1");
        assert!(contact.check("run-1").is_ok());
    }

    #[test]
    fn test_check_detects_takeover() {
        let dir = tempfile::tempdir().unwrap();
        let contact = ContactFile::new(dir.path());
        contact.write(&info("run-1")).unwrap();
        contact.write(&info("run-2")).unwrap();

        assert!(matches!(
            contact.check("run-1"),
            Err(SchedulerError::ContactFileLost(_))
        ));
    }

    #[test]
    fn test_check_detects_removal() {
        let dir = tempfile::tempdir().unwrap();
        let contact = ContactFile::new(dir.path());
        contact.write(&info("run-1")).unwrap();
        contact.remove();

        assert!(contact.check("run-1").is_err());
    }
}
