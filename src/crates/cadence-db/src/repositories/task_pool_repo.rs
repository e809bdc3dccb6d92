//! Live task pool repository

use super::SqliteExec;
use crate::error::Result;
use crate::models::TaskPoolRow;

/// Repository for the `task_pool` table
///
/// The table mirrors the in-memory pool after every tick that changed it;
/// restart reconstructs the pool from these rows.
pub struct TaskPoolRepository;

impl TaskPoolRepository {
    /// Insert or replace a pool row
    pub async fn upsert<'a, E: SqliteExec<'a>>(executor: E, row: &TaskPoolRow) -> Result<()> {
        sqlx::query(
            "INSERT INTO task_pool (cycle, name, flow_nums, status, is_held, is_late)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT (cycle, name) DO UPDATE SET
                 flow_nums = excluded.flow_nums,
                 status = excluded.status,
                 is_held = excluded.is_held,
                 is_late = excluded.is_late",
        )
        .bind(&row.cycle)
        .bind(&row.name)
        .bind(&row.flow_nums)
        .bind(&row.status)
        .bind(row.is_held)
        .bind(row.is_late)
        .execute(executor)
        .await?;
        Ok(())
    }

    /// Delete a pool row
    pub async fn delete<'a, E: SqliteExec<'a>>(executor: E, cycle: &str, name: &str) -> Result<()> {
        sqlx::query("DELETE FROM task_pool WHERE cycle = ? AND name = ?")
            .bind(cycle)
            .bind(name)
            .execute(executor)
            .await?;
        Ok(())
    }

    /// Load the whole pool, ordered by cycle then name
    pub async fn load_all<'a, E: SqliteExec<'a>>(executor: E) -> Result<Vec<TaskPoolRow>> {
        Ok(sqlx::query_as(
            "SELECT cycle, name, flow_nums, status, is_held, is_late
             FROM task_pool ORDER BY cycle, name",
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

    fn row(cycle: &str, name: &str, status: &str) -> TaskPoolRow {
        TaskPoolRow {
            cycle: cycle.to_string(),
            name: name.to_string(),
            flow_nums: "[1]".to_string(),
            status: status.to_string(),
            is_held: false,
            is_late: false,
        }
    }

    #[tokio::test]
    async fn test_upsert_replaces_row() {
        let conn = DatabaseConnection::open_in_memory().await.unwrap();
        create_tables(conn.pool()).await.unwrap();

        TaskPoolRepository::upsert(conn.pool(), &row("1", "a", "waiting")).await.unwrap();
        TaskPoolRepository::upsert(conn.pool(), &row("1", "a", "running")).await.unwrap();

        let rows = TaskPoolRepository::load_all(conn.pool()).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, "running");
    }

    #[tokio::test]
    async fn test_delete() {
        let conn = DatabaseConnection::open_in_memory().await.unwrap();
        create_tables(conn.pool()).await.unwrap();

        TaskPoolRepository::upsert(conn.pool(), &row("1", "a", "waiting")).await.unwrap();
        TaskPoolRepository::delete(conn.pool(), "1", "a").await.unwrap();
        assert!(TaskPoolRepository::load_all(conn.pool()).await.unwrap().is_empty());
    }
}
