//! Workflow database handle
//!
//! Owns the private database connection and the public replica paths.
//! The double-database strategy tolerates external readers holding locks:
//! the scheduler only ever writes to the private file and copies it to
//! the public file between commits.

use crate::connection::{DatabaseConnection, DatabasePool};
use crate::error::Result;
use crate::replica::{check_public, sync_public, PRIVATE_DB_NAME, PUBLIC_DB_NAME};
use crate::schema::create_tables;
use std::path::{Path, PathBuf};
use tracing::info;

/// The scheduler's durable store
pub struct WorkflowDatabase {
    private: DatabaseConnection,
    paths: Option<(PathBuf, PathBuf)>,
}

impl WorkflowDatabase {
    /// Open (or create) the databases in a workflow run directory
    pub async fn open(run_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(run_dir)?;
        let private_path = run_dir.join(PRIVATE_DB_NAME);
        let public_path = run_dir.join(PUBLIC_DB_NAME);

        let private = DatabaseConnection::open(&private_path).await?;
        create_tables(private.pool()).await?;
        info!(path = %private_path.display(), "opened workflow database");

        let db = Self {
            private,
            paths: Some((private_path, public_path)),
        };
        db.checkpoint_public()?;
        Ok(db)
    }

    /// Open an in-memory database with no public replica (tests)
    pub async fn open_in_memory() -> Result<Self> {
        let private = DatabaseConnection::open_in_memory().await?;
        create_tables(private.pool()).await?;
        Ok(Self {
            private,
            paths: None,
        })
    }

    /// The private (single-writer) connection pool
    pub fn pool(&self) -> &DatabasePool {
        self.private.pool()
    }

    /// Refresh the public replica from the private database
    pub fn checkpoint_public(&self) -> Result<()> {
        if let Some((private_path, public_path)) = &self.paths {
            sync_public(private_path, public_path)?;
        }
        Ok(())
    }

    /// Verify both databases; repair the public replica if missing or
    /// damaged
    pub async fn health_check(&self) -> Result<()> {
        self.private.health_check().await?;
        if let Some((private_path, public_path)) = &self.paths {
            check_public(private_path, public_path).await?;
        }
        Ok(())
    }

    /// Close the private connection
    pub async fn close(&self) {
        self.private.close().await;
    }
}
