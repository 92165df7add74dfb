//! "Try remote, else local disk" persistence.
//!
//! [`FallbackCoordinator`] is the single entry point for saving and reading
//! memory events. Saves go to the remote gateway when one is configured and
//! its circuit permits calls; any remote failure degrades to two local files:
//!
//! ```text
//! {log_root}/by-user/{userId}/memory-{memoryId}-{epochMillis}.json
//! {log_root}/all/{userId}-memory-{memoryId}-{epochMillis}.json
//! ```
//!
//! After each local write the user directory and `all/` are rotated
//! independently down to the newest `rotation_limit` files, ordered by the
//! timestamp embedded in the file name.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, NaiveDate, Utc};
use tracing::{debug, warn};

use memvault_core::error::MemvaultError;
use memvault_core::object::{ObjectKind, Payload, StorageResult, StoredObject};
use memvault_core::storage::StorageBackend;
use memvault_core::types::{MemoryId, UserId};
use memvault_core::Result;
use memvault_storage::LocalBackend;

use crate::gateway::StorageGateway;

const USER_DIR: &str = "by-user";
const ALL_DIR: &str = "all";

/// Routes saves and reads between the remote gateway and local disk.
///
/// Reads are served by one side at a time. While the circuit permits, the
/// remote store answers alone: events that went to local disk during an
/// outage are not merged back in, so after recovery they are missing from
/// `list_user_objects`, `list_daily_objects` and the statistics built on
/// them. They stay on disk under `log_root` until rotation removes them.
pub struct FallbackCoordinator {
    gateway: Option<StorageGateway>,
    local: Arc<dyn StorageBackend>,
    log_root: PathBuf,
    rotation_limit: usize,
}

impl FallbackCoordinator {
    pub fn new(gateway: Option<StorageGateway>, local: LocalBackend, rotation_limit: usize) -> Self {
        let log_root = local.base_dir().to_path_buf();
        Self::with_local_store(gateway, Arc::new(local), log_root, rotation_limit)
    }

    /// Coordinator over any local store whose keys resolve below `log_root`.
    pub fn with_local_store(
        gateway: Option<StorageGateway>,
        local: Arc<dyn StorageBackend>,
        log_root: impl Into<PathBuf>,
        rotation_limit: usize,
    ) -> Self {
        Self {
            gateway,
            local,
            log_root: log_root.into(),
            rotation_limit,
        }
    }

    pub fn gateway(&self) -> Option<&StorageGateway> {
        self.gateway.as_ref()
    }

    pub fn log_root(&self) -> &Path {
        &self.log_root
    }

    pub fn remote_configured(&self) -> bool {
        self.gateway.is_some()
    }

    /// The gateway, if it is configured and its circuit permits calls.
    fn available_gateway(&self) -> Option<&StorageGateway> {
        self.gateway.as_ref().filter(|g| g.is_available())
    }

    /// Persist one event, stamped with the current time.
    pub async fn save(
        &self,
        raw_user_id: Option<&str>,
        memory_id: &MemoryId,
        payload: Payload,
    ) -> Result<StorageResult> {
        self.save_at(raw_user_id, memory_id, payload, Utc::now())
            .await
    }

    /// Persist one event with an explicit event time.
    ///
    /// Only local-disk failures are returned as errors; remote failures
    /// are logged and served by the local fallback. The memory id is
    /// sanitized like the user id before it reaches any key.
    pub async fn save_at(
        &self,
        raw_user_id: Option<&str>,
        memory_id: &MemoryId,
        payload: Payload,
        at: DateTime<Utc>,
    ) -> Result<StorageResult> {
        let user_id = UserId::sanitized(raw_user_id);
        let memory_id = &MemoryId::sanitized(memory_id.as_str());
        let has_user = raw_user_id.is_some_and(|raw| !raw.trim().is_empty());

        match self.available_gateway() {
            Some(gateway) if has_user => {
                match gateway.store_event(&user_id, memory_id, &payload, at).await {
                    Ok(result) => return Ok(result),
                    Err(e) => warn!(
                        user_id = %user_id,
                        memory_id = %memory_id,
                        error = %e,
                        "Remote save failed, falling back to local disk"
                    ),
                }
            }
            Some(_) => debug!(memory_id = %memory_id, "No user id, saving locally"),
            None if self.gateway.is_some() => {
                warn!(user_id = %user_id, "Remote circuit open, saving locally")
            }
            None => debug!(user_id = %user_id, "No remote backend, saving locally"),
        }

        self.save_local(&user_id, memory_id, &payload, at).await
    }

    async fn save_local(
        &self,
        user_id: &UserId,
        memory_id: &MemoryId,
        payload: &Payload,
        at: DateTime<Utc>,
    ) -> Result<StorageResult> {
        let file_name = local_file_name(memory_id, at);
        let user_key = format!("{USER_DIR}/{user_id}/{file_name}");
        let all_key = format!("{ALL_DIR}/{user_id}-{file_name}");

        for key in [&user_key, &all_key] {
            let object = StoredObject::new(
                key.as_str(),
                payload.clone(),
                user_id,
                memory_id,
                at,
                ObjectKind::LocalFallback,
            );
            self.local
                .put(key, Bytes::from(object.to_json_bytes()?))
                .await?;
        }

        self.rotate(&format!("{USER_DIR}/{user_id}/")).await;
        self.rotate(&format!("{ALL_DIR}/")).await;

        let path = self.log_root.join(&user_key);
        debug!(path = %path.display(), "Saved event locally");
        Ok(StorageResult::Filesystem { path })
    }

    /// Delete all but the newest `rotation_limit` fallback files under
    /// `prefix`. Never fails; problems are logged.
    async fn rotate(&self, prefix: &str) {
        let infos = match self.local.list(prefix).await {
            Ok(infos) => infos,
            Err(e) => {
                warn!(prefix = %prefix, error = %e, "Rotation listing failed");
                return;
            }
        };

        let mut files: Vec<(i64, String)> = infos
            .into_iter()
            .filter_map(|info| embedded_timestamp(&info.key).map(|ts| (ts, info.key)))
            .collect();
        if files.len() <= self.rotation_limit {
            return;
        }

        files.sort_by(|a, b| b.cmp(a));
        for (_, key) in files.into_iter().skip(self.rotation_limit) {
            if let Err(e) = self.local.delete(&key).await {
                let err = MemvaultError::Rotation {
                    path: self.log_root.join(&key).display().to_string(),
                    message: e.to_string(),
                };
                warn!(error = %err, "Could not remove rotated file");
            }
        }
    }

    /// Up to `limit` of a user's events, newest first.
    ///
    /// Served remotely when the circuit permits, otherwise (or when the
    /// remote read fails) from the local fallback files.
    pub async fn list_user_objects(
        &self,
        user_id: &UserId,
        limit: usize,
    ) -> Result<Vec<StoredObject>> {
        if let Some(gateway) = self.available_gateway() {
            match gateway.list_user_objects(user_id, limit).await {
                Ok(objects) => return Ok(objects),
                Err(e) => warn!(
                    user_id = %user_id,
                    error = %e,
                    "Remote listing failed, reading local files"
                ),
            }
        }
        let mut objects = self
            .read_local(&format!("{USER_DIR}/{user_id}/"))
            .await?;
        objects.truncate(limit);
        Ok(objects)
    }

    /// Up to `limit` of today's (UTC) events across all users, newest first.
    pub async fn list_daily_objects(&self, limit: usize) -> Result<Vec<StoredObject>> {
        if let Some(gateway) = self.available_gateway() {
            match gateway.list_daily_objects(limit).await {
                Ok(objects) => return Ok(objects),
                Err(e) => warn!(error = %e, "Remote daily listing failed, reading local files"),
            }
        }
        self.list_local_daily(Utc::now().date_naive(), limit).await
    }

    async fn list_local_daily(&self, date: NaiveDate, limit: usize) -> Result<Vec<StoredObject>> {
        let mut objects = self.read_local(&format!("{ALL_DIR}/")).await?;
        objects.retain(|o| o.event_time().date_naive() == date);
        objects.truncate(limit);
        Ok(objects)
    }

    /// Decode every fallback file under `prefix`, newest first.
    async fn read_local(&self, prefix: &str) -> Result<Vec<StoredObject>> {
        let mut files: Vec<(i64, String)> = self
            .local
            .list(prefix)
            .await?
            .into_iter()
            .filter_map(|info| embedded_timestamp(&info.key).map(|ts| (ts, info.key)))
            .collect();
        files.sort_by(|a, b| b.cmp(a));

        let mut objects = Vec::with_capacity(files.len());
        for (_, key) in files {
            let data = match self.local.get(&key).await {
                Ok(data) => data,
                // Rotated away by a concurrent save.
                Err(MemvaultError::NotFound { .. }) => continue,
                Err(e) => return Err(e),
            };
            match StoredObject::from_json_bytes(&key, &data) {
                Ok(object) => objects.push(object),
                Err(e) => warn!(key = %key, error = %e, "Skipping undecodable local file"),
            }
        }
        Ok(objects)
    }
}

/// `memory-{memoryId}-{epochMillis}.json`, the millis zero-padded to 13 digits.
fn local_file_name(memory_id: &MemoryId, at: DateTime<Utc>) -> String {
    format!("memory-{}-{:013}.json", memory_id, at.timestamp_millis())
}

/// The epoch millis embedded in a fallback file name, if the key is one.
fn embedded_timestamp(key: &str) -> Option<i64> {
    let name = key.rsplit('/').next()?;
    let stem = name.strip_suffix(".json")?;
    if !stem.contains("memory-") {
        return None;
    }
    let (_, millis) = stem.rsplit_once('-')?;
    millis.parse().ok()
}
