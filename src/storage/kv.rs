//! SQLite-backed key-value store
//!
//! This module provides:
//! - Connection pooling with WAL mode for concurrent reads/writes
//! - Automatic migrations
//! - Multi-key reads inside a single read transaction

use super::{KeyValueStore, StoreError};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::str::FromStr;
use std::time::Duration;

pub struct SqliteKvStore {
    pool: SqlitePool,
}

impl SqliteKvStore {
    /// Open (creating if missing) the store and run migrations
    ///
    /// # Arguments
    ///
    /// * `database_url` - SQLite URL (e.g., "sqlite:./data/hot.db" or "sqlite::memory:")
    ///
    /// # Example
    ///
    /// ```ignore
    /// let kv = SqliteKvStore::connect("sqlite:./data/hot.db").await?;
    /// ```
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = open_pool(database_url).await?;

        let mut migrator = sqlx::migrate!("./migrations/kv");
        migrator.set_ignore_missing(true);
        migrator.run(&pool).await?;
        tracing::info!(url = database_url, "Key-value store ready");

        Ok(Self { pool })
    }

    /// Number of stored entries
    pub async fn len(&self) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM kv")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Connection pool tuned for a single-writer SQLite file
///
/// Each in-memory connection is its own database, so `:memory:` URLs get a
/// pool pinned to one connection that is never recycled.
pub(crate) async fn open_pool(database_url: &str) -> Result<SqlitePool, StoreError> {
    let in_memory = database_url.contains(":memory:");

    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(30))
        .pragma("synchronous", "NORMAL")
        .pragma("temp_store", "memory");

    let pool_options = if in_memory {
        SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        SqlitePoolOptions::new().max_connections(5)
    };

    Ok(pool_options
        .acquire_timeout(Duration::from_secs(30))
        .connect_with(options)
        .await?)
}

#[async_trait]
impl KeyValueStore for SqliteKvStore {
    async fn set(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO kv (key, value) VALUES (?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let row = sqlx::query("SELECT value FROM kv WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| r.get::<Vec<u8>, _>("value")))
    }

    async fn get_many(&self, keys: &[Vec<u8>]) -> Result<Vec<Vec<u8>>, StoreError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut tx = self.pool.begin().await?;
        let mut values = Vec::with_capacity(keys.len());

        for key in keys {
            let row = sqlx::query("SELECT value FROM kv WHERE key = ?")
                .bind(key.as_slice())
                .fetch_optional(&mut *tx)
                .await?;

            match row {
                Some(row) => values.push(row.get::<Vec<u8>, _>("value")),
                None => {
                    return Err(StoreError::NotFound(
                        String::from_utf8_lossy(key).into_owned(),
                    ))
                }
            }
        }

        tx.commit().await?;
        Ok(values)
    }

    async fn scan(
        &self,
        after: Option<&[u8]>,
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        let limit = limit as i64;
        let rows = match after {
            Some(after) => {
                sqlx::query("SELECT key, value FROM kv WHERE key > ? ORDER BY key LIMIT ?")
                    .bind(after)
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("SELECT key, value FROM kv ORDER BY key LIMIT ?")
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        Ok(rows
            .into_iter()
            .map(|r| (r.get::<Vec<u8>, _>("key"), r.get::<Vec<u8>, _>("value")))
            .collect())
    }
}
