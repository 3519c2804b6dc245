//! Object store drivers
//!
//! `FsObjectStore` maps buckets to directories under a root and writes
//! objects atomically (temp file, then rename). `MemoryObjectStore` keeps
//! everything in a concurrent map.

use super::{ObjectStore, StoreError};
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use std::path::{Component, Path, PathBuf};

/// Reject keys that would escape the bucket directory
fn validate_key(key: &str) -> Result<(), StoreError> {
    let path = Path::new(key);
    let escapes = path
        .components()
        .any(|c| !matches!(c, Component::Normal(_)));
    if key.is_empty() || escapes {
        return Err(StoreError::InvalidKey(key.to_string()));
    }
    Ok(())
}

// ============================================================
// Filesystem
// ============================================================

pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn object_path(&self, bucket: &str, key: &str) -> PathBuf {
        self.root.join(bucket).join(key)
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn ensure_bucket(&self, bucket: &str) -> Result<(), StoreError> {
        validate_key(bucket)?;
        let dir = self.root.join(bucket);
        if tokio::fs::metadata(&dir).await.is_ok() {
            return Ok(());
        }
        tokio::fs::create_dir_all(&dir).await?;
        tracing::info!(bucket = bucket, path = %dir.display(), "Bucket created");
        Ok(())
    }

    async fn write(
        &self,
        bucket: &str,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<(), StoreError> {
        validate_key(bucket)?;
        validate_key(key)?;

        let bucket_dir = self.root.join(bucket);
        if tokio::fs::metadata(&bucket_dir).await.is_err() {
            return Err(StoreError::BucketNotFound(bucket.to_string()));
        }

        let path = bucket_dir.join(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));
        let written = match tokio::fs::write(&tmp, &bytes).await {
            Ok(()) => tokio::fs::rename(&tmp, &path).await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            // A partial temp file may exist whichever step failed
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        tracing::trace!(
            bucket = bucket,
            key = key,
            content_type = content_type,
            size = bytes.len(),
            "Object written"
        );
        Ok(())
    }
}

// ============================================================
// In-memory
// ============================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

#[derive(Default)]
pub struct MemoryObjectStore {
    buckets: DashSet<String>,
    objects: DashMap<(String, String), StoredObject>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, bucket: &str, key: &str) -> Option<StoredObject> {
        self.objects
            .get(&(bucket.to_string(), key.to_string()))
            .map(|entry| entry.value().clone())
    }

    /// Keys in a bucket, sorted
    pub fn keys(&self, bucket: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .objects
            .iter()
            .filter(|entry| entry.key().0 == bucket)
            .map(|entry| entry.key().1.clone())
            .collect();
        keys.sort();
        keys
    }

    pub fn has_bucket(&self, bucket: &str) -> bool {
        self.buckets.contains(bucket)
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn ensure_bucket(&self, bucket: &str) -> Result<(), StoreError> {
        self.buckets.insert(bucket.to_string());
        Ok(())
    }

    async fn write(
        &self,
        bucket: &str,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<(), StoreError> {
        if !self.buckets.contains(bucket) {
            return Err(StoreError::BucketNotFound(bucket.to_string()));
        }
        validate_key(key)?;

        self.objects.insert(
            (bucket.to_string(), key.to_string()),
            StoredObject {
                bytes,
                content_type: content_type.to_string(),
            },
        );
        Ok(())
    }
}
