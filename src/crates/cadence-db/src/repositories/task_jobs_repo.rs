//! Job submission record repository

use super::SqliteExec;
use crate::error::Result;
use crate::models::TaskJobRow;

/// Repository for the `task_jobs` table
pub struct TaskJobsRepository;

impl TaskJobsRepository {
    /// Insert or update a job record
    pub async fn upsert<'a, E: SqliteExec<'a>>(executor: E, row: &TaskJobRow) -> Result<()> {
        sqlx::query(
            "INSERT INTO task_jobs
                 (cycle, name, submit_num, platform, submit_time, start_time, end_time, status)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (cycle, name, submit_num) DO UPDATE SET
                 platform = excluded.platform,
                 submit_time = COALESCE(excluded.submit_time, task_jobs.submit_time),
                 start_time = COALESCE(excluded.start_time, task_jobs.start_time),
                 end_time = COALESCE(excluded.end_time, task_jobs.end_time),
                 status = excluded.status",
        )
        .bind(&row.cycle)
        .bind(&row.name)
        .bind(row.submit_num)
        .bind(&row.platform)
        .bind(&row.submit_time)
        .bind(&row.start_time)
        .bind(&row.end_time)
        .bind(&row.status)
        .execute(executor)
        .await?;
        Ok(())
    }

    /// Load jobs still in a live state (`submitted` or `running`)
    ///
    /// Used at restart to re-associate in-flight jobs with their proxies.
    pub async fn load_live<'a, E: SqliteExec<'a>>(executor: E) -> Result<Vec<TaskJobRow>> {
        Ok(sqlx::query_as(
            "SELECT cycle, name, submit_num, platform, submit_time, start_time, end_time, status
             FROM task_jobs WHERE status IN ('submitted', 'running')
             ORDER BY cycle, name, submit_num",
        )
        .fetch_all(executor)
        .await?)
    }

    /// Load all job records for a task instance
    pub async fn load_for_task<'a, E: SqliteExec<'a>>(
        executor: E,
        cycle: &str,
        name: &str,
    ) -> Result<Vec<TaskJobRow>> {
        Ok(sqlx::query_as(
            "SELECT cycle, name, submit_num, platform, submit_time, start_time, end_time, status
             FROM task_jobs WHERE cycle = ? AND name = ? ORDER BY submit_num",
        )
        .bind(cycle)
        .bind(name)
        .fetch_all(executor)
        .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::DatabaseConnection;
    use crate::schema::create_tables;

    fn job(submit_num: i64, status: &str) -> TaskJobRow {
        TaskJobRow {
            cycle: "1".into(),
            name: "a".into(),
            submit_num,
            platform: "localhost".into(),
            submit_time: Some("t0".into()),
            start_time: None,
            end_time: None,
            status: status.into(),
        }
    }

    #[tokio::test]
    async fn test_upsert_preserves_earlier_times() {
        let conn = DatabaseConnection::open_in_memory().await.unwrap();
        create_tables(conn.pool()).await.unwrap();

        TaskJobsRepository::upsert(conn.pool(), &job(1, "submitted")).await.unwrap();
        let mut update = job(1, "running");
        update.submit_time = None;
        update.start_time = Some("t1".into());
        TaskJobsRepository::upsert(conn.pool(), &update).await.unwrap();

        let rows = TaskJobsRepository::load_for_task(conn.pool(), "1", "a").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, "running");
        assert_eq!(rows[0].submit_time.as_deref(), Some("t0"));
        assert_eq!(rows[0].start_time.as_deref(), Some("t1"));
    }

    #[tokio::test]
    async fn test_load_live() {
        let conn = DatabaseConnection::open_in_memory().await.unwrap();
        create_tables(conn.pool()).await.unwrap();

        TaskJobsRepository::upsert(conn.pool(), &job(1, "succeeded")).await.unwrap();
        TaskJobsRepository::upsert(conn.pool(), &job(2, "running")).await.unwrap();

        let live = TaskJobsRepository::load_live(conn.pool()).await.unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].submit_num, 2);
    }
}
