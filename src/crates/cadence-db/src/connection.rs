//! Database connection management
//!
//! Wraps an SQLite connection pool with creation, health check and
//! close operations. The scheduler opens one pool for the private
//! (authoritative) database; the public replica is a plain file copy and
//! is never written through a pool.

use crate::error::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;

/// Type alias for the database connection pool
pub type DatabasePool = SqlitePool;

/// Single-writer database connection
#[derive(Clone)]
pub struct DatabaseConnection {
    pool: DatabasePool,
}

impl DatabaseConnection {
    /// Open (creating if necessary) a database file
    pub async fn open(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    /// Open an in-memory database (used by tests)
    ///
    /// The pool is pinned to its single connection: a new connection
    /// would be a fresh, empty in-memory database.
    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(sqlx::Error::from)?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &DatabasePool {
        &self.pool
    }

    /// Perform a health check by running a simple query
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await?;
        Ok(())
    }

    /// Close the connection pool gracefully
    pub async fn close(&self) {
        self.pool.close().await;
    }
}
