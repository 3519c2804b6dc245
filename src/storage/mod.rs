//! Storage contracts used by the consumers and the search service
//!
//! - `KeyValueStore`: raw records keyed by hit identifier
//! - `ObjectStore`: compressed archive objects grouped in buckets

pub mod kv;
pub mod object;

pub(crate) use kv::open_pool;
pub use kv::SqliteKvStore;
pub use object::{FsObjectStore, MemoryObjectStore};

use async_trait::async_trait;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("key not found: {0}")]
    NotFound(String),

    #[error("bucket not found: {0}")]
    BucketNotFound(String),

    #[error("invalid object key '{0}'")]
    InvalidKey(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("corrupt entry: {0}")]
    Corrupt(String),
}

/// Transactional byte-keyed store
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn set(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError>;

    /// `Ok(None)` when the key is absent
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;

    /// Fetch several keys inside one read transaction
    ///
    /// Results are in the order of `keys`. Any missing key fails the whole
    /// call with `StoreError::NotFound`.
    async fn get_many(&self, keys: &[Vec<u8>]) -> Result<Vec<Vec<u8>>, StoreError>;

    /// Up to `limit` entries with keys strictly after `after`, in key order
    async fn scan(
        &self,
        after: Option<&[u8]>,
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError>;
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Create the bucket if it does not exist
    async fn ensure_bucket(&self, bucket: &str) -> Result<(), StoreError>;

    async fn write(
        &self,
        bucket: &str,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<(), StoreError>;
}
