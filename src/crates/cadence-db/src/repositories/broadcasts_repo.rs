//! Broadcast state repository

use super::SqliteExec;
use crate::error::Result;
use crate::models::BroadcastRow;

/// Repository for the `broadcast_states` table
pub struct BroadcastsRepository;

impl BroadcastsRepository {
    /// Record a broadcast setting
    pub async fn upsert<'a, E: SqliteExec<'a>>(executor: E, row: &BroadcastRow) -> Result<()> {
        sqlx::query(
            "INSERT INTO broadcast_states (point, namespace, setting_path, value)
             VALUES (?, ?, ?, ?)
             ON CONFLICT (point, namespace, setting_path) DO UPDATE SET
                 value = excluded.value",
        )
        .bind(&row.point)
        .bind(&row.namespace)
        .bind(&row.setting_path)
        .bind(&row.value)
        .execute(executor)
        .await?;
        Ok(())
    }

    /// Delete one broadcast setting
    pub async fn delete<'a, E: SqliteExec<'a>>(
        executor: E,
        point: &str,
        namespace: &str,
        setting_path: &str,
    ) -> Result<()> {
        sqlx::query(
            "DELETE FROM broadcast_states
             WHERE point = ? AND namespace = ? AND setting_path = ?",
        )
        .bind(point)
        .bind(namespace)
        .bind(setting_path)
        .execute(executor)
        .await?;
        Ok(())
    }

    /// Load every active broadcast
    pub async fn load_all<'a, E: SqliteExec<'a>>(executor: E) -> Result<Vec<BroadcastRow>> {
        Ok(sqlx::query_as(
            "SELECT point, namespace, setting_path, value
             FROM broadcast_states ORDER BY point, namespace, setting_path",
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

        let row = BroadcastRow {
            point: "*".into(),
            namespace: "a".into(),
            setting_path: "environment.KEY".into(),
            value: "\"value\"".into(),
        };
        BroadcastsRepository::upsert(conn.pool(), &row).await.unwrap();
        assert_eq!(BroadcastsRepository::load_all(conn.pool()).await.unwrap().len(), 1);

        BroadcastsRepository::delete(conn.pool(), "*", "a", "environment.KEY").await.unwrap();
        assert!(BroadcastsRepository::load_all(conn.pool()).await.unwrap().is_empty());
    }
}
