//! Task state history repository

use super::SqliteExec;
use crate::error::Result;
use crate::models::TaskStateRow;

/// Repository for the `task_states` table
pub struct TaskStatesRepository;

impl TaskStatesRepository {
    /// Insert or update the state record for a task instance
    pub async fn upsert<'a, E: SqliteExec<'a>>(executor: E, row: &TaskStateRow) -> Result<()> {
        sqlx::query(
            "INSERT INTO task_states
                 (cycle, name, flow_nums, submit_num, status, time_created, time_updated)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (cycle, name, flow_nums) DO UPDATE SET
                 submit_num = excluded.submit_num,
                 status = excluded.status,
                 time_updated = excluded.time_updated",
        )
        .bind(&row.cycle)
        .bind(&row.name)
        .bind(&row.flow_nums)
        .bind(row.submit_num)
        .bind(&row.status)
        .bind(&row.time_created)
        .bind(&row.time_updated)
        .execute(executor)
        .await?;
        Ok(())
    }

    /// Load all state records for one task instance
    pub async fn load_for_task<'a, E: SqliteExec<'a>>(
        executor: E,
        cycle: &str,
        name: &str,
    ) -> Result<Vec<TaskStateRow>> {
        Ok(sqlx::query_as(
            "SELECT cycle, name, flow_nums, submit_num, status, time_created, time_updated
             FROM task_states WHERE cycle = ? AND name = ?",
        )
        .bind(cycle)
        .bind(name)
        .fetch_all(executor)
        .await?)
    }

    /// Highest submit number recorded for a task instance
    pub async fn max_submit_num<'a, E: SqliteExec<'a>>(
        executor: E,
        cycle: &str,
        name: &str,
    ) -> Result<i64> {
        let row: (Option<i64>,) = sqlx::query_as(
            "SELECT MAX(submit_num) FROM task_states WHERE cycle = ? AND name = ?",
        )
        .bind(cycle)
        .bind(name)
        .fetch_one(executor)
        .await?;
        Ok(row.0.unwrap_or(0))
    }
}
