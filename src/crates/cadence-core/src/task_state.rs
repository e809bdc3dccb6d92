//! Task instance status machine
//!
//! `waiting → preparing → submitted → running` and then one of the final
//! statuses. `held` is an orthogonal flag on waiting proxies, not a
//! status.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Status of a live task instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    /// Prerequisites not yet all satisfied, or waiting on a retry timer
    Waiting,
    /// Handed to the job manager; job descriptor being built
    Preparing,
    /// Job accepted by the platform, not yet executing
    Submitted,
    /// Job executing
    Running,
    /// Job finished successfully
    Succeeded,
    /// Job finished unsuccessfully, no retries left
    Failed,
    /// Job submission failed, no submission retries left
    SubmitFailed,
    /// Clock-expired before release; will never run
    Expired,
}

impl TaskStatus {
    /// All statuses, in lifecycle order
    pub const ALL: [TaskStatus; 8] = [
        TaskStatus::Waiting,
        TaskStatus::Preparing,
        TaskStatus::Submitted,
        TaskStatus::Running,
        TaskStatus::Succeeded,
        TaskStatus::Failed,
        TaskStatus::SubmitFailed,
        TaskStatus::Expired,
    ];

    /// True for `preparing`, `submitted` and `running`
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            TaskStatus::Preparing | TaskStatus::Submitted | TaskStatus::Running
        )
    }

    /// True for the terminal statuses
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded
                | TaskStatus::Failed
                | TaskStatus::SubmitFailed
                | TaskStatus::Expired
        )
    }

    /// True before any job activity (`waiting` or `preparing`)
    ///
    /// Late detection only applies in these statuses.
    pub fn is_pre_active(&self) -> bool {
        matches!(self, TaskStatus::Waiting | TaskStatus::Preparing)
    }

    /// Whether a transition from `self` to `next` follows the lifecycle
    ///
    /// Retries legitimately move a failed attempt back to `waiting`, and
    /// polling may skip `submitted` when a job starts between polls, so
    /// the check is permissive about forward and retry edges and only
    /// rejects transitions out of a terminal status (other than back to
    /// `waiting`, which a forced rerun uses).
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        if *self == next {
            return false;
        }
        if next == TaskStatus::Waiting {
            return true;
        }
        !self.is_final()
    }
}

// Display must match the kebab-case serde form used in the database.
impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Waiting => "waiting",
            TaskStatus::Preparing => "preparing",
            TaskStatus::Submitted => "submitted",
            TaskStatus::Running => "running",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
            TaskStatus::SubmitFailed => "submit-failed",
            TaskStatus::Expired => "expired",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(TaskStatus::Waiting),
            "preparing" => Ok(TaskStatus::Preparing),
            "submitted" => Ok(TaskStatus::Submitted),
            "running" => Ok(TaskStatus::Running),
            "succeeded" => Ok(TaskStatus::Succeeded),
            "failed" => Ok(TaskStatus::Failed),
            "submit-failed" => Ok(TaskStatus::SubmitFailed),
            "expired" => Ok(TaskStatus::Expired),
            other => Err(format!("unknown task status: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_from_str_round_trip() {
        for status in TaskStatus::ALL {
            let s = status.to_string();
            assert_eq!(s.parse::<TaskStatus>().unwrap(), status);
        }
    }

    #[test]
    fn test_classification() {
        assert!(TaskStatus::Running.is_active());
        assert!(!TaskStatus::Waiting.is_active());
        assert!(TaskStatus::Expired.is_final());
        assert!(TaskStatus::Preparing.is_pre_active());
    }

    #[test]
    fn test_transitions() {
        assert!(TaskStatus::Waiting.can_transition_to(TaskStatus::Preparing));
        assert!(TaskStatus::Submitted.can_transition_to(TaskStatus::Running));
        assert!(TaskStatus::Failed.can_transition_to(TaskStatus::Waiting));
        assert!(!TaskStatus::Succeeded.can_transition_to(TaskStatus::Running));
        assert!(!TaskStatus::Running.can_transition_to(TaskStatus::Running));
    }
}
