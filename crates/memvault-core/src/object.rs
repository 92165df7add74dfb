//! Stored object envelope and save outcomes.
//!
//! Every memory event is persisted as a [`StoredObject`]: the caller's JSON
//! payload plus a small metadata map, serialised as UTF-8 JSON. The same
//! envelope is used for the remote shards and for local fallback files, so
//! readers decode both the same way.

use std::path::PathBuf;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::MemvaultError;
use crate::types::{MemoryId, UserId};
use crate::Result;

/// An arbitrary JSON map supplied by the webhook layer.
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Which layout slot an object was written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ObjectKind {
    /// Per-user shard in the remote store.
    UserShard,
    /// Per-day aggregate shard in the remote store.
    DailyShard,
    /// Local fallback file.
    LocalFallback,
}

/// Metadata attached to each stored object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMetadata {
    pub user_id: UserId,
    pub memory_id: MemoryId,
    /// Event timestamp in milliseconds since the Unix epoch. Shared by every
    /// object written for the same event.
    pub timestamp: i64,
    #[serde(rename = "type")]
    pub kind: ObjectKind,
}

/// A persisted memory event. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredObject {
    pub key: String,
    pub payload: Payload,
    pub metadata: ObjectMetadata,
    pub written_at: DateTime<Utc>,
}

impl StoredObject {
    /// Build the envelope for one layout slot of an event.
    pub fn new(
        key: impl Into<String>,
        payload: Payload,
        user_id: &UserId,
        memory_id: &MemoryId,
        timestamp: DateTime<Utc>,
        kind: ObjectKind,
    ) -> Self {
        Self {
            key: key.into(),
            payload,
            metadata: ObjectMetadata {
                user_id: user_id.clone(),
                memory_id: memory_id.clone(),
                timestamp: timestamp.timestamp_millis(),
                kind,
            },
            written_at: Utc::now(),
        }
    }

    /// Serialise to the on-disk / on-wire JSON form.
    pub fn to_json_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode an object read back from storage.
    pub fn from_json_bytes(key: &str, data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(|e| MemvaultError::Decode {
            key: key.to_string(),
            message: e.to_string(),
        })
    }

    /// The event timestamp as a UTC date-time.
    pub fn event_time(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.metadata.timestamp)
            .single()
            .unwrap_or(self.written_at)
    }
}

/// Where a save ended up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageResult {
    /// Both shards were written to the remote store.
    Remote {
        user_key: String,
        daily_key: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        public_url: Option<String>,
    },
    /// The remote path was skipped or failed; the event is on local disk.
    Filesystem { path: PathBuf },
}

impl StorageResult {
    /// Whether the remote backend served the save.
    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote { .. })
    }
}
