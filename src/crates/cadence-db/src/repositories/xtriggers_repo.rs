//! Xtrigger result repository

use super::SqliteExec;
use crate::error::Result;
use crate::models::XtriggerRow;

/// Repository for the `xtriggers` table
pub struct XtriggersRepository;

impl XtriggersRepository {
    /// Record the latest result for an xtrigger call signature
    pub async fn upsert<'a, E: SqliteExec<'a>>(executor: E, row: &XtriggerRow) -> Result<()> {
        sqlx::query(
            "INSERT INTO xtriggers (label, args_hash, result) VALUES (?, ?, ?)
             ON CONFLICT (label, args_hash) DO UPDATE SET result = excluded.result",
        )
        .bind(&row.label)
        .bind(&row.args_hash)
        .bind(&row.result)
        .execute(executor)
        .await?;
        Ok(())
    }

    /// Load every stored xtrigger result
    pub async fn load_all<'a, E: SqliteExec<'a>>(executor: E) -> Result<Vec<XtriggerRow>> {
        Ok(
            sqlx::query_as("SELECT label, args_hash, result FROM xtriggers ORDER BY label")
                .fetch_all(executor)
                .await?,
        )
    }
}
