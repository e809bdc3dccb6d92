//! Flow allocation repository

use super::SqliteExec;
use crate::error::Result;
use crate::models::FlowRow;

/// Repository for the `flows` table
///
/// Flow numbers are allocated strictly monotonically; rows are never
/// deleted, so the allocation counter survives restart even after a flow
/// has ended.
pub struct FlowsRepository;

impl FlowsRepository {
    /// Record a newly allocated flow number
    pub async fn insert<'a, E: SqliteExec<'a>>(executor: E, row: &FlowRow) -> Result<()> {
        sqlx::query("INSERT INTO flows (flow_num, description, created_at) VALUES (?, ?, ?)")
            .bind(row.flow_num)
            .bind(&row.description)
            .bind(&row.created_at)
            .execute(executor)
            .await?;
        Ok(())
    }

    /// Load every allocated flow
    pub async fn load_all<'a, E: SqliteExec<'a>>(executor: E) -> Result<Vec<FlowRow>> {
        Ok(sqlx::query_as(
            "SELECT flow_num, description, created_at FROM flows ORDER BY flow_num",
        )
        .fetch_all(executor)
        .await?)
    }

    /// Highest flow number ever allocated, 0 if none
    pub async fn max_flow_num<'a, E: SqliteExec<'a>>(executor: E) -> Result<i64> {
        let row: (Option<i64>,) = sqlx::query_as("SELECT MAX(flow_num) FROM flows")
            .fetch_one(executor)
            .await?;
        Ok(row.0.unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::DatabaseConnection;
    use crate::schema::create_tables;

    #[tokio::test]
    async fn test_insert_and_max() {
        let conn = DatabaseConnection::open_in_memory().await.unwrap();
        create_tables(conn.pool()).await.unwrap();

        assert_eq!(FlowsRepository::max_flow_num(conn.pool()).await.unwrap(), 0);
        for (num, desc) in [(1, "original flow"), (2, "rerun of 3/a")] {
            FlowsRepository::insert(
                conn.pool(),
                &FlowRow {
                    flow_num: num,
                    description: desc.into(),
                    created_at: "t0".into(),
                },
            )
            .await
            .unwrap();
        }
        assert_eq!(FlowsRepository::max_flow_num(conn.pool()).await.unwrap(), 2);
        assert_eq!(FlowsRepository::load_all(conn.pool()).await.unwrap().len(), 2);
    }
}
