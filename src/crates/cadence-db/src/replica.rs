//! Public database replica
//!
//! The scheduler is the single writer of the private database. External
//! readers get a separate public copy so their read locks can never block
//! a commit. The copy is refreshed after commits and repaired on health
//! check if it is missing or fails an integrity check (a crash mid-copy
//! leaves a present-but-damaged file behind).

use crate::error::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::path::Path;
use tracing::{debug, warn};

/// File name of the private (authoritative) database
pub const PRIVATE_DB_NAME: &str = "db.private";

/// File name of the public (reader-facing) replica
pub const PUBLIC_DB_NAME: &str = "db.public";

/// Copy the private database file over the public replica
///
/// Must be called between commits, when the private file is consistent on
/// disk.
pub fn sync_public(private_path: &Path, public_path: &Path) -> Result<()> {
    std::fs::copy(private_path, public_path)?;
    debug!(path = %public_path.display(), "refreshed public database replica");
    Ok(())
}

/// True if the public replica exists and passes an integrity check
///
/// Opens the file read-only and runs `PRAGMA quick_check`, so truncated
/// or garbage files read as damaged rather than present.
pub async fn verify_public(public_path: &Path) -> bool {
    if !public_path.is_file() {
        return false;
    }
    let options = SqliteConnectOptions::new()
        .filename(public_path)
        .read_only(true);
    let pool = match SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
    {
        Ok(pool) => pool,
        Err(_) => return false,
    };
    let ok = sqlx::query_scalar::<_, String>("PRAGMA quick_check")
        .fetch_one(&pool)
        .await
        .map(|result| result == "ok")
        .unwrap_or(false);
    pool.close().await;
    ok
}

/// Check the public replica and repair it from the private database if
/// missing or damaged
///
/// Returns true if a repair was performed.
pub async fn check_public(private_path: &Path, public_path: &Path) -> Result<bool> {
    if verify_public(public_path).await {
        return Ok(false);
    }
    warn!(
        path = %public_path.display(),
        "public database replica missing or damaged, repairing from private database"
    );
    sync_public(private_path, public_path)?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::DatabaseConnection;
    use crate::schema::create_tables;

    async fn make_private(path: &Path) {
        let conn = DatabaseConnection::open(path).await.unwrap();
        create_tables(conn.pool()).await.unwrap();
        conn.close().await;
    }

    #[test]
    fn test_sync_copies_file() {
        let dir = tempfile::tempdir().unwrap();
        let private = dir.path().join(PRIVATE_DB_NAME);
        let public = dir.path().join(PUBLIC_DB_NAME);
        std::fs::write(&private, b"data").unwrap();

        sync_public(&private, &public).unwrap();
        assert_eq!(std::fs::read(&public).unwrap(), b"data");
    }

    #[test]
    fn test_sync_fails_without_private() {
        let dir = tempfile::tempdir().unwrap();
        let private = dir.path().join(PRIVATE_DB_NAME);
        let public = dir.path().join(PUBLIC_DB_NAME);
        assert!(sync_public(&private, &public).is_err());
    }

    #[tokio::test]
    async fn test_check_repairs_missing_replica() {
        let dir = tempfile::tempdir().unwrap();
        let private = dir.path().join(PRIVATE_DB_NAME);
        let public = dir.path().join(PUBLIC_DB_NAME);
        make_private(&private).await;

        assert!(check_public(&private, &public).await.unwrap());
        assert!(!check_public(&private, &public).await.unwrap());
    }

    #[tokio::test]
    async fn test_check_repairs_damaged_replica() {
        let dir = tempfile::tempdir().unwrap();
        let private = dir.path().join(PRIVATE_DB_NAME);
        let public = dir.path().join(PUBLIC_DB_NAME);
        make_private(&private).await;

        // A crash mid-copy leaves a present-but-unreadable file.
        std::fs::write(&public, b"not a database").unwrap();
        assert!(!verify_public(&public).await);

        assert!(check_public(&private, &public).await.unwrap());
        assert!(verify_public(&public).await);
    }

    #[tokio::test]
    async fn test_verify_rejects_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!verify_public(&dir.path().join(PUBLIC_DB_NAME)).await);
    }
}
