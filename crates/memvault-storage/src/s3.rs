//! S3-compatible object storage backend.
//!
//! [`S3Backend`] implements the [`StorageBackend`] trait using the
//! `object_store` crate, supporting any S3-compatible endpoint: Cloudflare
//! R2, AWS S3, MinIO, etc. Any other [`ObjectStore`] (for example
//! `object_store::memory::InMemory`) can be plugged in with
//! [`S3Backend::with_store`].
//!
//! `.json` keys are written with `Content-Type: application/json`.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::path::Path as ObjectPath;
use object_store::{Attribute, Attributes, ObjectStore, PutOptions, PutPayload};
use tracing::{debug, instrument};

use memvault_core::config::RemoteConfig;
use memvault_core::error::MemvaultError;
use memvault_core::storage::{ObjectInfo, StorageBackend};
use memvault_core::Result;

/// A [`StorageBackend`] backed by S3-compatible object storage.
///
/// The `object_store` client's own retries are disabled; retry and circuit
/// breaking are applied one level up, by the gateway.
pub struct S3Backend {
    store: Arc<dyn ObjectStore>,
    bucket: String,
}

impl S3Backend {
    /// Create a new `S3Backend` from validated remote settings.
    ///
    /// Returns [`MemvaultError::Config`] when credentials, endpoint or bucket
    /// are missing.
    pub fn new(config: &RemoteConfig) -> Result<Self> {
        config.validate()?;

        let bucket = config.bucket.clone().unwrap_or_default();
        let endpoint = config.endpoint_url().unwrap_or_default();

        let builder = AmazonS3Builder::new()
            .with_bucket_name(&bucket)
            .with_region(&config.region)
            .with_endpoint(&endpoint)
            .with_allow_http(endpoint.starts_with("http://"))
            .with_access_key_id(config.access_key_id.clone().unwrap_or_default())
            .with_secret_access_key(config.secret_access_key.clone().unwrap_or_default())
            .with_retry(object_store::RetryConfig {
                max_retries: 0,
                ..Default::default()
            });

        let store = builder.build().map_err(|e| MemvaultError::Config {
            message: format!("Failed to create S3 client for bucket {bucket}: {e}"),
        })?;

        debug!(bucket = %bucket, endpoint = %endpoint, "S3Backend initialised");

        Ok(Self {
            store: Arc::new(store),
            bucket,
        })
    }

    /// Wrap an existing object store.
    pub fn with_store(store: Arc<dyn ObjectStore>, bucket: impl Into<String>) -> Self {
        Self {
            store,
            bucket: bucket.into(),
        }
    }

    /// Name of the bucket this backend writes to.
    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

fn put_options(key: &str) -> PutOptions {
    let mut attributes = Attributes::new();
    if key.ends_with(".json") {
        attributes.insert(Attribute::ContentType, "application/json".into());
    }
    PutOptions {
        attributes,
        ..Default::default()
    }
}

#[async_trait]
impl StorageBackend for S3Backend {
    #[instrument(skip(self, data), fields(key = %key, size = data.len()))]
    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        let path = ObjectPath::from(key);
        self.store
            .put_opts(&path, PutPayload::from(data), put_options(key))
            .await
            .map_err(|e| MemvaultError::storage(format!("S3 put failed for {key}"), e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn get(&self, key: &str) -> Result<Bytes> {
        let path = ObjectPath::from(key);
        let result = self.store.get(&path).await.map_err(|e| match e {
            object_store::Error::NotFound { .. } => MemvaultError::NotFound {
                key: key.to_string(),
            },
            other => MemvaultError::storage(format!("S3 get failed for {key}"), other),
        })?;
        let bytes = result
            .bytes()
            .await
            .map_err(|e| MemvaultError::storage(format!("S3 get bytes failed for {key}"), e))?;
        Ok(bytes)
    }

    #[instrument(skip(self), fields(prefix = %prefix))]
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>> {
        // object_store prefixes match whole path segments, so list the
        // enclosing directory and filter on the raw string prefix.
        let dir = match prefix.rfind('/') {
            Some(idx) => Some(ObjectPath::from(&prefix[..idx])),
            None => None,
        };

        let mut results = Vec::new();
        let mut stream = self.store.list(dir.as_ref());

        while let Some(meta) = stream
            .try_next()
            .await
            .map_err(|e| MemvaultError::storage(format!("S3 list failed for prefix {prefix}"), e))?
        {
            let key = meta.location.to_string();
            if key.starts_with(prefix) {
                results.push(ObjectInfo {
                    key,
                    size: meta.size as u64,
                    last_modified: meta.last_modified,
                });
            }
        }

        results.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(results)
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn delete(&self, key: &str) -> Result<()> {
        let path = ObjectPath::from(key);
        match self.store.delete(&path).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(MemvaultError::storage(
                format!("S3 delete failed for {key}"),
                e,
            )),
        }
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn exists(&self, key: &str) -> Result<bool> {
        let path = ObjectPath::from(key);
        match self.store.head(&path).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(MemvaultError::storage(format!("S3 head failed for {key}"), e)),
        }
    }
}
