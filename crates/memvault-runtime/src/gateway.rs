//! Remote storage gateway.
//!
//! [`StorageGateway`] owns the remote key-space layout and every call made
//! to the remote backend. Each call runs as
//! `breaker.execute(|| retry.run(op))`, so retries of one logical operation
//! count as a single success or failure for the circuit.
//!
//! # Key layout
//!
//! Every event is written twice, under keys derived from one millisecond
//! timestamp captured by the caller:
//!
//! ```text
//! {root}/by-user/{userId}/{YYYY}/{MM}/{memoryId}-{epochMillis}.json
//! {root}/all/{YYYY-MM-DD}/{userId}-{memoryId}-{epochMillis}.json
//! ```
//!
//! The two writes are sequential and not compensated: if the daily shard
//! fails after the user shard succeeded, the user shard stays. Memory ids
//! are passed through [`MemoryId::sanitized`] before they enter a key.

use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, NaiveDate, Utc};
use futures::stream::{self, StreamExt};
use tracing::{debug, info, warn};

use memvault_core::error::MemvaultError;
use memvault_core::object::{ObjectKind, Payload, StorageResult, StoredObject};
use memvault_core::storage::{ObjectInfo, StorageBackend};
use memvault_core::types::{MemoryId, UserId};
use memvault_core::Result;

use crate::circuit_breaker::CircuitBreaker;
use crate::retry::RetryPolicy;

/// Number of object reads kept in flight while listing.
const FETCH_CONCURRENCY: usize = 8;

/// Reads and writes memory events in the remote object store.
pub struct StorageGateway {
    backend: Arc<dyn StorageBackend>,
    breaker: Arc<CircuitBreaker>,
    retry: RetryPolicy,
    root_prefix: String,
    public_base_url: Option<String>,
}

impl StorageGateway {
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        breaker: Arc<CircuitBreaker>,
        retry: RetryPolicy,
        root_prefix: impl Into<String>,
    ) -> Self {
        Self {
            backend,
            breaker,
            retry,
            root_prefix: root_prefix.into().trim_matches('/').to_string(),
            public_base_url: None,
        }
    }

    /// Report `{base}/{user_key}` as the public URL of saved events.
    pub fn with_public_base_url(mut self, base: Option<String>) -> Self {
        self.public_base_url = base;
        self
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn root_prefix(&self) -> &str {
        &self.root_prefix
    }

    /// Cheap health check: would the breaker let a call through right now?
    pub fn is_available(&self) -> bool {
        self.breaker.is_call_permitted()
    }

    fn rooted(&self, rest: String) -> String {
        if self.root_prefix.is_empty() {
            rest
        } else {
            format!("{}/{}", self.root_prefix, rest)
        }
    }

    /// Key of the per-user shard for one event.
    pub fn user_key(&self, user_id: &UserId, memory_id: &MemoryId, at: DateTime<Utc>) -> String {
        self.rooted(format!(
            "by-user/{}/{}/{}-{}.json",
            user_id,
            at.format("%Y/%m"),
            MemoryId::sanitized(memory_id.as_str()),
            at.timestamp_millis()
        ))
    }

    /// Key of the daily aggregate shard for one event.
    pub fn daily_key(&self, user_id: &UserId, memory_id: &MemoryId, at: DateTime<Utc>) -> String {
        self.rooted(format!(
            "all/{}/{}-{}-{}.json",
            at.format("%Y-%m-%d"),
            user_id,
            MemoryId::sanitized(memory_id.as_str()),
            at.timestamp_millis()
        ))
    }

    pub fn user_prefix(&self, user_id: &UserId) -> String {
        self.rooted(format!("by-user/{user_id}/"))
    }

    pub fn daily_prefix(&self, date: NaiveDate) -> String {
        self.rooted(format!("all/{}/", date.format("%Y-%m-%d")))
    }

    pub fn public_url_for(&self, key: &str) -> Option<String> {
        self.public_base_url
            .as_ref()
            .map(|base| format!("{base}/{key}"))
    }

    async fn put_object(&self, object: &StoredObject) -> Result<()> {
        let data = Bytes::from(object.to_json_bytes()?);
        let key = object.key.as_str();
        self.breaker
            .execute(|| self.retry.run(|| self.backend.put(key, data.clone())))
            .await
            .map_err(|e| MemvaultError::backend_unavailable(format!("upload of {key} failed"), e))?;
        debug!(key = %key, "Uploaded object");
        Ok(())
    }

    /// Write the per-user shard of an event. Returns its key.
    pub async fn upload_user_shard(
        &self,
        user_id: &UserId,
        memory_id: &MemoryId,
        payload: &Payload,
        at: DateTime<Utc>,
    ) -> Result<String> {
        let key = self.user_key(user_id, memory_id, at);
        let object = StoredObject::new(
            key.clone(),
            payload.clone(),
            user_id,
            memory_id,
            at,
            ObjectKind::UserShard,
        );
        self.put_object(&object).await?;
        Ok(key)
    }

    /// Write the daily aggregate shard of an event. Returns its key.
    pub async fn upload_daily_shard(
        &self,
        user_id: &UserId,
        memory_id: &MemoryId,
        payload: &Payload,
        at: DateTime<Utc>,
    ) -> Result<String> {
        let key = self.daily_key(user_id, memory_id, at);
        let object = StoredObject::new(
            key.clone(),
            payload.clone(),
            user_id,
            memory_id,
            at,
            ObjectKind::DailyShard,
        );
        self.put_object(&object).await?;
        Ok(key)
    }

    /// Dual-write an event: user shard first, then the daily shard.
    pub async fn store_event(
        &self,
        user_id: &UserId,
        memory_id: &MemoryId,
        payload: &Payload,
        at: DateTime<Utc>,
    ) -> Result<StorageResult> {
        let user_key = self
            .upload_user_shard(user_id, memory_id, payload, at)
            .await?;
        let daily_key = match self
            .upload_daily_shard(user_id, memory_id, payload, at)
            .await
        {
            Ok(key) => key,
            Err(e) => {
                warn!(
                    user_id = %user_id,
                    user_key = %user_key,
                    error = %e,
                    "Daily shard failed after user shard was written"
                );
                return Err(e);
            }
        };

        info!(user_id = %user_id, memory_id = %memory_id, "Stored event remotely");
        Ok(StorageResult::Remote {
            public_url: self.public_url_for(&user_key),
            user_key,
            daily_key,
        })
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<ObjectInfo>> {
        self.breaker
            .execute(|| self.retry.run(|| self.backend.list(prefix)))
            .await
            .map_err(|e| MemvaultError::backend_unavailable(format!("listing {prefix} failed"), e))
    }

    /// Fetch one object. `Ok(None)` when it is malformed or vanished.
    ///
    /// A vanished object is an answer from a healthy backend, so it counts
    /// as a success for the circuit.
    async fn fetch_object(&self, key: &str) -> Result<Option<StoredObject>> {
        let fetched = self
            .breaker
            .execute(|| async {
                match self.retry.run(|| self.backend.get(key)).await {
                    Ok(data) => Ok(Some(data)),
                    Err(MemvaultError::NotFound { .. }) => Ok(None),
                    Err(e) => Err(e),
                }
            })
            .await;
        let data = match fetched {
            Ok(Some(data)) => data,
            Ok(None) => {
                debug!(key = %key, "Object removed between list and get");
                return Ok(None);
            }
            Err(e) => {
                return Err(MemvaultError::backend_unavailable(
                    format!("reading {key} failed"),
                    e,
                ))
            }
        };
        match StoredObject::from_json_bytes(key, &data) {
            Ok(object) => Ok(Some(object)),
            Err(e) => {
                warn!(key = %key, error = %e, "Skipping undecodable object");
                Ok(None)
            }
        }
    }

    /// Fetch the `limit` most recently modified objects of `infos`.
    async fn fetch_recent(
        &self,
        mut infos: Vec<ObjectInfo>,
        limit: usize,
    ) -> Result<Vec<StoredObject>> {
        infos.sort_by(|a, b| {
            b.last_modified
                .cmp(&a.last_modified)
                .then_with(|| b.key.cmp(&a.key))
        });
        infos.truncate(limit);

        let fetched: Vec<Result<Option<StoredObject>>> = stream::iter(infos.iter())
            .map(|info| self.fetch_object(&info.key))
            .buffered(FETCH_CONCURRENCY)
            .collect()
            .await;

        let mut objects = Vec::with_capacity(fetched.len());
        for result in fetched {
            if let Some(object) = result? {
                objects.push(object);
            }
        }
        Ok(objects)
    }

    /// Up to `limit` of a user's objects, most recently modified first.
    pub async fn list_user_objects(
        &self,
        user_id: &UserId,
        limit: usize,
    ) -> Result<Vec<StoredObject>> {
        let infos = self.list_prefix(&self.user_prefix(user_id)).await?;
        self.fetch_recent(infos, limit).await
    }

    /// Up to `limit` objects from today's (UTC) daily shard.
    pub async fn list_daily_objects(&self, limit: usize) -> Result<Vec<StoredObject>> {
        self.list_daily_objects_for(Utc::now().date_naive(), limit)
            .await
    }

    pub async fn list_daily_objects_for(
        &self,
        date: NaiveDate,
        limit: usize,
    ) -> Result<Vec<StoredObject>> {
        let infos = self.list_prefix(&self.daily_prefix(date)).await?;
        self.fetch_recent(infos, limit).await
    }
}
