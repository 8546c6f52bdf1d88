use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    SqlitePool,
};
use std::str::FromStr;
use std::time::Duration;

use super::types::StorageError;

// ============================================================================
// SqliteStorage
// ============================================================================

/// SQLite-backed [`Storage`](super::Storage) implementation.
///
/// A connection pool is cheap to clone; all methods take `&self`.
#[derive(Clone)]
pub struct SqliteStorage {
    pub(crate) pool: SqlitePool,
}

impl SqliteStorage {
    /// Open a database connection and run migrations.
    ///
    /// Pass `":memory:"` for an ephemeral database (tests).
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Locked` if another process has the database
    /// locked, `StorageError::Migration` if schema setup fails.
    pub async fn open(path: &str) -> Result<Self, StorageError> {
        let url = format!("sqlite:{}?mode=rwc", path);

        // busy_timeout=5000: SQLite waits up to 5 seconds for locks to release
        // before returning SQLITE_BUSY. Handles transient contention between
        // concurrent update cycles automatically. Set via pragma() so every
        // pooled connection inherits it.
        let options = SqliteConnectOptions::from_str(&url)
            .map_err(StorageError::from_sqlx)?
            .pragma("busy_timeout", "5000");

        // SQLite is single-writer; a handful of connections covers peak
        // concurrent readers (update merges + aggregate fan-out queries).
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await
            .map_err(StorageError::from_sqlx)?;

        let storage = Self { pool };
        storage.migrate().await?;
        Ok(storage)
    }

    /// Run schema migrations atomically within a transaction.
    ///
    /// All statements use `IF NOT EXISTS`, so re-running on an existing
    /// database is a no-op. If any step fails the transaction rolls back,
    /// leaving the previous consistent schema in place.
    async fn migrate(&self) -> Result<(), StorageError> {
        // Foreign keys are a per-connection setting, outside the transaction.
        sqlx::query("PRAGMA foreign_keys = ON")
            .execute(&self.pool)
            .await?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StorageError::Migration(e.to_string()))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS feeds (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                category TEXT,
                source_url TEXT UNIQUE NOT NULL,
                link_url TEXT,
                icon_url TEXT,
                update_mode TEXT NOT NULL DEFAULT 'inherit',
                update_interval_secs INTEGER NOT NULL DEFAULT 0,
                expire_mode TEXT NOT NULL DEFAULT 'inherit',
                expire_age_secs INTEGER NOT NULL DEFAULT 0,
                last_update INTEGER
            )
        "#,
        )
        .execute(&mut *tx)
        .await
        .map_err(|e| StorageError::Migration(e.to_string()))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS articles (
                id INTEGER PRIMARY KEY,
                feed_id INTEGER NOT NULL REFERENCES feeds(id) ON DELETE CASCADE,
                local_id TEXT NOT NULL,
                title TEXT NOT NULL,
                author TEXT,
                url TEXT,
                date INTEGER NOT NULL,
                read INTEGER NOT NULL DEFAULT 0,
                starred INTEGER NOT NULL DEFAULT 0,
                content TEXT,
                UNIQUE(feed_id, local_id)
            )
        "#,
        )
        .execute(&mut *tx)
        .await
        .map_err(|e| StorageError::Migration(e.to_string()))?;

        for statement in [
            "CREATE INDEX IF NOT EXISTS idx_articles_feed ON articles(feed_id)",
            "CREATE INDEX IF NOT EXISTS idx_articles_date ON articles(date DESC)",
            "CREATE INDEX IF NOT EXISTS idx_articles_read ON articles(read)",
            "CREATE INDEX IF NOT EXISTS idx_articles_starred ON articles(starred)",
        ] {
            sqlx::query(statement)
                .execute(&mut *tx)
                .await
                .map_err(|e| StorageError::Migration(e.to_string()))?;
        }

        tx.commit()
            .await
            .map_err(|e| StorageError::Migration(e.to_string()))?;

        Ok(())
    }
}
