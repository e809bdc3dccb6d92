//! Error types for the persistence layer

use thiserror::Error;

/// Convenience result type using [`StoreError`]
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors raised by the scheduler's durable store
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying SQLite failure
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A stored value could not be decoded
    #[error("corrupt stored value for {context}: {error}")]
    Corrupt {
        /// What was being decoded (table/column or parameter key)
        context: String,
        /// Decode failure detail
        error: String,
    },

    /// Filesystem operation on a database file failed
    #[error("database file error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Build a [`StoreError::Corrupt`] with context
    pub fn corrupt(context: impl Into<String>, error: impl std::fmt::Display) -> Self {
        Self::Corrupt {
            context: context.into(),
            error: error.to_string(),
        }
    }
}
