//! Completed task output repository

use super::SqliteExec;
use crate::error::Result;
use crate::models::TaskOutputRow;

/// Repository for the `task_outputs` table
pub struct TaskOutputsRepository;

impl TaskOutputsRepository {
    /// Record a completed output
    pub async fn upsert<'a, E: SqliteExec<'a>>(executor: E, row: &TaskOutputRow) -> Result<()> {
        sqlx::query(
            "INSERT INTO task_outputs (cycle, name, flow_nums, output, reason)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT (cycle, name, flow_nums, output) DO UPDATE SET
                 reason = excluded.reason",
        )
        .bind(&row.cycle)
        .bind(&row.name)
        .bind(&row.flow_nums)
        .bind(&row.output)
        .bind(&row.reason)
        .execute(executor)
        .await?;
        Ok(())
    }

    /// Erase all output rows for a task instance in a given flow set
    pub async fn delete_for_flows<'a, E: SqliteExec<'a>>(
        executor: E,
        cycle: &str,
        name: &str,
        flow_nums: &str,
    ) -> Result<()> {
        sqlx::query(
            "DELETE FROM task_outputs WHERE cycle = ? AND name = ? AND flow_nums = ?",
        )
        .bind(cycle)
        .bind(name)
        .bind(flow_nums)
        .execute(executor)
        .await?;
        Ok(())
    }

    /// Load every completed output
    pub async fn load_all<'a, E: SqliteExec<'a>>(executor: E) -> Result<Vec<TaskOutputRow>> {
        Ok(sqlx::query_as(
            "SELECT cycle, name, flow_nums, output, reason
             FROM task_outputs ORDER BY cycle, name, output",
        )
        .fetch_all(executor)
        .await?)
    }
}
