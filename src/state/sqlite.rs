use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};

use crate::state::StoreError;
use crate::traits::{StateStore, VersionedCollection};

/// Set restrictive file permissions (0600) on the database and WAL files.
#[cfg(unix)]
fn set_db_file_permissions(db_path: &str) {
    use std::os::unix::fs::PermissionsExt;
    let mode = std::fs::Permissions::from_mode(0o600);
    if let Err(e) = std::fs::set_permissions(db_path, mode.clone()) {
        tracing::warn!("Failed to set permissions on {}: {}", db_path, e);
    }
    for suffix in &["-wal", "-shm"] {
        let path = format!("{}{}", db_path, suffix);
        if std::path::Path::new(&path).exists() {
            if let Err(e) = std::fs::set_permissions(&path, mode.clone()) {
                tracing::warn!("Failed to set permissions on {}: {}", path, e);
            }
        }
    }
}

/// SQLite-backed [`StateStore`]: versioned key→JSON collections plus the
/// send idempotency ledger. Single logical writer per key is enforced by
/// optimistic versioning, not by the database.
pub struct SqliteStateStore {
    pool: SqlitePool,
}

impl SqliteStateStore {
    pub async fn new(db_path: &str) -> anyhow::Result<Self> {
        let opts = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(opts)
            .await?;

        #[cfg(unix)]
        set_db_file_permissions(db_path);

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// In-memory store for tests.
    pub async fn in_memory() -> anyhow::Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS collections (
                key TEXT PRIMARY KEY,
                body TEXT NOT NULL,
                version INTEGER NOT NULL,
                updated_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS send_ledger (
                token TEXT PRIMARY KEY,
                recorded_at TEXT NOT NULL,
                delivered INTEGER NOT NULL DEFAULT 0
            )",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    fn backend(e: sqlx::Error) -> StoreError {
        StoreError::Backend(e.to_string())
    }
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn read_collection(&self, key: &str) -> Result<VersionedCollection, StoreError> {
        let row = sqlx::query("SELECT body, version FROM collections WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(Self::backend)?;

        match row {
            None => Ok(VersionedCollection {
                body: serde_json::Value::Null,
                version: 0,
            }),
            Some(row) => {
                let raw: String = row.get("body");
                let version: i64 = row.get("version");
                // Fail closed on schema drift: report, never overwrite.
                let body: serde_json::Value = serde_json::from_str(&raw).map_err(|e| {
                    StoreError::Malformed(format!("collection '{}': {}", key, e))
                })?;
                Ok(VersionedCollection { body, version })
            }
        }
    }

    async fn write_collection(
        &self,
        key: &str,
        body: &serde_json::Value,
        expected_version: i64,
    ) -> Result<i64, StoreError> {
        let raw = serde_json::to_string(body)
            .map_err(|e| StoreError::Backend(format!("encode collection '{}': {}", key, e)))?;
        let now = Utc::now().to_rfc3339();

        if expected_version == 0 {
            let result = sqlx::query(
                "INSERT INTO collections (key, body, version, updated_at)
                 VALUES (?, ?, 1, ?)
                 ON CONFLICT(key) DO NOTHING",
            )
            .bind(key)
            .bind(&raw)
            .bind(&now)
            .execute(&self.pool)
            .await
            .map_err(Self::backend)?;

            if result.rows_affected() == 0 {
                return Err(StoreError::Stale);
            }
            return Ok(1);
        }

        let result = sqlx::query(
            "UPDATE collections SET body = ?, version = version + 1, updated_at = ?
             WHERE key = ? AND version = ?",
        )
        .bind(&raw)
        .bind(&now)
        .bind(key)
        .bind(expected_version)
        .execute(&self.pool)
        .await
        .map_err(Self::backend)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Stale);
        }
        Ok(expected_version + 1)
    }

    async fn record_send_token(&self, token: &str) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO send_ledger (token, recorded_at, delivered)
             VALUES (?, ?, 0)
             ON CONFLICT(token) DO NOTHING",
        )
        .bind(token)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(Self::backend)?;
        Ok(())
    }

    async fn mark_delivered(&self, token: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE send_ledger SET delivered = 1 WHERE token = ?")
            .bind(token)
            .execute(&self.pool)
            .await
            .map_err(Self::backend)?;
        Ok(())
    }

    async fn is_delivered(&self, token: &str) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT delivered FROM send_ledger WHERE token = ?")
            .bind(token)
            .fetch_optional(&self.pool)
            .await
            .map_err(Self::backend)?;
        Ok(row.map(|r| r.get::<i64, _>("delivered") == 1).unwrap_or(false))
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(Self::backend)?;
        Ok(())
    }
}
