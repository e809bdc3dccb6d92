//! Forced prerequisite satisfaction repository

use super::SqliteExec;
use crate::error::Result;
use crate::models::TaskPrereqRow;

/// Repository for the `task_prerequisites` table
///
/// Only forced satisfactions are stored; natural satisfactions are
/// reconstructed from `task_outputs` when a restarted pool re-evaluates
/// its prerequisites.
pub struct TaskPrereqsRepository;

impl TaskPrereqsRepository {
    /// Record a forced prerequisite satisfaction
    pub async fn upsert<'a, E: SqliteExec<'a>>(executor: E, row: &TaskPrereqRow) -> Result<()> {
        sqlx::query(
            "INSERT INTO task_prerequisites
                 (cycle, name, prereq_cycle, prereq_name, prereq_output, reason)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT (cycle, name, prereq_cycle, prereq_name, prereq_output)
             DO UPDATE SET reason = excluded.reason",
        )
        .bind(&row.cycle)
        .bind(&row.name)
        .bind(&row.prereq_cycle)
        .bind(&row.prereq_name)
        .bind(&row.prereq_output)
        .bind(&row.reason)
        .execute(executor)
        .await?;
        Ok(())
    }

    /// Delete all rows for a task instance
    pub async fn delete_for_task<'a, E: SqliteExec<'a>>(
        executor: E,
        cycle: &str,
        name: &str,
    ) -> Result<()> {
        sqlx::query("DELETE FROM task_prerequisites WHERE cycle = ? AND name = ?")
            .bind(cycle)
            .bind(name)
            .execute(executor)
            .await?;
        Ok(())
    }

    /// Load every stored satisfaction
    pub async fn load_all<'a, E: SqliteExec<'a>>(executor: E) -> Result<Vec<TaskPrereqRow>> {
        Ok(sqlx::query_as(
            "SELECT cycle, name, prereq_cycle, prereq_name, prereq_output, reason
             FROM task_prerequisites ORDER BY cycle, name, prereq_cycle, prereq_name",
        )
        .fetch_all(executor)
        .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::DatabaseConnection;
    use crate::schema::create_tables;

    #[tokio::test]
    async fn test_round_trip() {
        let conn = DatabaseConnection::open_in_memory().await.unwrap();
        create_tables(conn.pool()).await.unwrap();

        let row = TaskPrereqRow {
            cycle: "2".into(),
            name: "b".into(),
            prereq_cycle: "1".into(),
            prereq_name: "a".into(),
            prereq_output: "succeeded".into(),
            reason: "forced".into(),
        };
        TaskPrereqsRepository::upsert(conn.pool(), &row).await.unwrap();
        let rows = TaskPrereqsRepository::load_all(conn.pool()).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].prereq_name, "a");

        TaskPrereqsRepository::delete_for_task(conn.pool(), "2", "b").await.unwrap();
        assert!(TaskPrereqsRepository::load_all(conn.pool()).await.unwrap().is_empty());
    }
}
