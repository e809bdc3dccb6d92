//! Database schema
//!
//! The private database is created fresh in the workflow run directory, so
//! the full statement list is applied idempotently at open instead of a
//! versioned migration history.

use crate::connection::DatabasePool;
use crate::error::Result;

/// Table creation statements, applied in order
pub const CREATE_TABLES: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS workflow_params (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS task_pool (
        cycle TEXT NOT NULL,
        name TEXT NOT NULL,
        flow_nums TEXT NOT NULL,
        status TEXT NOT NULL,
        is_held INTEGER NOT NULL DEFAULT 0,
        is_late INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (cycle, name)
    )",
    "CREATE TABLE IF NOT EXISTS task_states (
        cycle TEXT NOT NULL,
        name TEXT NOT NULL,
        flow_nums TEXT NOT NULL,
        submit_num INTEGER NOT NULL DEFAULT 0,
        status TEXT NOT NULL,
        time_created TEXT NOT NULL,
        time_updated TEXT NOT NULL,
        PRIMARY KEY (cycle, name, flow_nums)
    )",
    "CREATE TABLE IF NOT EXISTS task_outputs (
        cycle TEXT NOT NULL,
        name TEXT NOT NULL,
        flow_nums TEXT NOT NULL,
        output TEXT NOT NULL,
        reason TEXT NOT NULL,
        PRIMARY KEY (cycle, name, flow_nums, output)
    )",
    "CREATE TABLE IF NOT EXISTS task_prerequisites (
        cycle TEXT NOT NULL,
        name TEXT NOT NULL,
        prereq_cycle TEXT NOT NULL,
        prereq_name TEXT NOT NULL,
        prereq_output TEXT NOT NULL,
        reason TEXT NOT NULL,
        PRIMARY KEY (cycle, name, prereq_cycle, prereq_name, prereq_output)
    )",
    "CREATE TABLE IF NOT EXISTS task_jobs (
        cycle TEXT NOT NULL,
        name TEXT NOT NULL,
        submit_num INTEGER NOT NULL,
        platform TEXT NOT NULL,
        submit_time TEXT,
        start_time TEXT,
        end_time TEXT,
        status TEXT NOT NULL,
        PRIMARY KEY (cycle, name, submit_num)
    )",
    "CREATE TABLE IF NOT EXISTS broadcast_states (
        point TEXT NOT NULL,
        namespace TEXT NOT NULL,
        setting_path TEXT NOT NULL,
        value TEXT NOT NULL,
        PRIMARY KEY (point, namespace, setting_path)
    )",
    "CREATE TABLE IF NOT EXISTS xtriggers (
        label TEXT NOT NULL,
        args_hash TEXT NOT NULL,
        result TEXT NOT NULL,
        PRIMARY KEY (label, args_hash)
    )",
    "CREATE TABLE IF NOT EXISTS flows (
        flow_num INTEGER PRIMARY KEY,
        description TEXT NOT NULL,
        created_at TEXT NOT NULL
    )",
];

/// Apply the schema to a freshly opened database
pub async fn create_tables(pool: &DatabasePool) -> Result<()> {
    for statement in CREATE_TABLES {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::DatabaseConnection;

    #[tokio::test]
    async fn test_create_tables_idempotent() {
        let conn = DatabaseConnection::open_in_memory().await.unwrap();
        create_tables(conn.pool()).await.unwrap();
        create_tables(conn.pool()).await.unwrap();

        let tables: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name",
        )
        .fetch_all(conn.pool())
        .await
        .unwrap();
        let names: Vec<&str> = tables.iter().map(|(n,)| n.as_str()).collect();
        for expected in [
            "broadcast_states",
            "flows",
            "task_jobs",
            "task_outputs",
            "task_pool",
            "task_prerequisites",
            "task_states",
            "workflow_params",
            "xtriggers",
        ] {
            assert!(names.contains(&expected), "missing table {}", expected);
        }
    }
}
