//! The StorageBackend trait, the single interface for object reads and writes.
//!
//! Implementations include [`LocalBackend`](crate) (filesystem) and
//! [`S3Backend`](crate) (any S3-compatible endpoint). The gateway and the
//! fallback coordinator never touch the filesystem or object storage
//! directly.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::Result;

/// A listed object: its key plus the metadata needed to order listings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    /// Key relative to the backend root, always `/`-separated.
    pub key: String,
    /// Object size in bytes.
    pub size: u64,
    /// When the backend last wrote the object.
    pub last_modified: DateTime<Utc>,
}

/// The unified storage interface for memvault.
///
/// Implementations must be `Send + Sync` so one instance can be shared
/// across concurrently handled events.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Write an object. Overwrites if it already exists.
    async fn put(&self, key: &str, data: Bytes) -> Result<()>;

    /// Read an object. Returns [`MemvaultError::NotFound`](crate::MemvaultError::NotFound)
    /// if the key does not exist.
    async fn get(&self, key: &str) -> Result<Bytes>;

    /// List all objects whose key starts with `prefix`, sorted by key.
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>>;

    /// Delete an object. Does not error if the key does not exist.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Check if an object exists at the given key.
    async fn exists(&self, key: &str) -> Result<bool>;
}
