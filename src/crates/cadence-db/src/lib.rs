//! SQLite persistence layer for the cadence scheduler
//!
//! Provides the single-writer private database, the reader-facing public
//! replica, row models for every persisted table, and the per-tick batched
//! write queue the main loop commits through.

pub mod connection;
pub mod database;
pub mod error;
pub mod models;
pub mod pending;
pub mod replica;
pub mod repositories;
pub mod schema;

pub use connection::{DatabaseConnection, DatabasePool};
pub use database::WorkflowDatabase;
pub use error::{Result, StoreError};
pub use pending::{DbOp, PendingOps};
