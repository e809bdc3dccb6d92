//! Workflow parameter repository

use super::SqliteExec;
use crate::error::Result;
use crate::models::WorkflowParamRow;

/// Repository for the `workflow_params` table
pub struct ParamsRepository;

impl ParamsRepository {
    /// Insert or replace a parameter
    pub async fn set<'a, E: SqliteExec<'a>>(executor: E, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO workflow_params (key, value) VALUES (?, ?)
             ON CONFLICT (key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(executor)
        .await?;
        Ok(())
    }

    /// Get a parameter value by key
    pub async fn get<'a, E: SqliteExec<'a>>(executor: E, key: &str) -> Result<Option<String>> {
        let row: Option<WorkflowParamRow> =
            sqlx::query_as("SELECT key, value FROM workflow_params WHERE key = ?")
                .bind(key)
                .fetch_optional(executor)
                .await?;
        Ok(row.map(|r| r.value))
    }

    /// Load all parameters
    pub async fn load_all<'a, E: SqliteExec<'a>>(executor: E) -> Result<Vec<WorkflowParamRow>> {
        Ok(
            sqlx::query_as("SELECT key, value FROM workflow_params ORDER BY key")
                .fetch_all(executor)
                .await?,
        )
    }

    /// Delete a parameter
    pub async fn delete<'a, E: SqliteExec<'a>>(executor: E, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM workflow_params WHERE key = ?")
            .bind(key)
            .execute(executor)
            .await?;
        Ok(())
    }
}
