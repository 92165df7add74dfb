//! Integration test: remote outages degrade to local disk.
//!
//! healthy → outage (retries, circuit opens, local fallback) → recovery.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use object_store::memory::InMemory;
use serde_json::json;

use memvault_core::config::{CircuitBreakerConfig, RetryConfig, VaultConfig};
use memvault_core::error::MemvaultError;
use memvault_core::object::{Payload, StorageResult};
use memvault_core::storage::{ObjectInfo, StorageBackend};
use memvault_core::types::{MemoryId, UserId};
use memvault_core::Result;
use memvault_runtime::{CircuitState, VaultNode};
use memvault_storage::S3Backend;

/// In-memory remote that can be switched into an outage.
struct SwitchableBackend {
    inner: S3Backend,
    failing: AtomicBool,
    /// Only keys containing this fragment fail while `failing` is set.
    fail_fragment: String,
    calls: AtomicU32,
}

impl SwitchableBackend {
    fn new(fail_fragment: &str) -> Self {
        Self {
            inner: S3Backend::with_store(Arc::new(InMemory::new()), "memories"),
            failing: AtomicBool::new(false),
            fail_fragment: fail_fragment.to_string(),
            calls: AtomicU32::new(0),
        }
    }

    fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn check(&self, key: &str) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) && key.contains(&self.fail_fragment) {
            Err(MemvaultError::storage_msg("connection refused"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl StorageBackend for SwitchableBackend {
    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        self.check(key)?;
        self.inner.put(key, data).await
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        self.check(key)?;
        self.inner.get(key).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>> {
        self.check(prefix)?;
        self.inner.list(prefix).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.check(key)?;
        self.inner.delete(key).await
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.check(key)?;
        self.inner.exists(key).await
    }
}

fn test_config(tmpdir: &std::path::Path) -> VaultConfig {
    let mut config = VaultConfig::local(tmpdir);
    config.retry = RetryConfig {
        max_retries: 2,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(4),
        backoff_multiplier: 2.0,
    };
    config.breaker = CircuitBreakerConfig {
        failure_threshold: 2,
        timeout: Duration::from_millis(400),
    };
    config
}

fn payload() -> Payload {
    match json!({ "duration": 60, "language": "de" }) {
        serde_json::Value::Object(map) => map,
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn test_outage_falls_back_then_recovers() {
    let tmp = tempfile::TempDir::new().unwrap();
    let backend = Arc::new(SwitchableBackend::new("mobil3-mentorships"));
    let node = VaultNode::with_remote_backend(test_config(tmp.path()), backend.clone())
        .await
        .unwrap();
    let user = UserId::new("erin");

    // Healthy.
    let result = node.save(Some("erin"), &MemoryId::new("m0"), payload()).await.unwrap();
    assert!(result.is_remote());
    assert_eq!(backend.calls(), 2);

    // Outage: every save still succeeds, locally.
    backend.set_failing(true);
    for i in 1..=2 {
        let result = node
            .save(Some("erin"), &MemoryId::new(format!("m{i}")), payload())
            .await
            .unwrap();
        assert!(matches!(result, StorageResult::Filesystem { .. }));
    }
    // Each failed save made max_retries + 1 put attempts on the user shard.
    assert_eq!(backend.calls(), 2 + 2 * 3);
    assert_eq!(node.breaker().state(), CircuitState::Open);
    assert!(!node.health().remote_available);

    // Circuit open: the remote is not touched at all.
    let result = node.save(Some("erin"), &MemoryId::new("m3"), payload()).await.unwrap();
    assert!(!result.is_remote());
    assert_eq!(backend.calls(), 8);

    // Reads are served from the local fallback files.
    let local = node.list_user_objects(&user, 10).await.unwrap();
    let ids: Vec<_> = local.iter().map(|o| o.metadata.memory_id.as_str()).collect();
    assert_eq!(ids, vec!["m3", "m2", "m1"]);
    assert_eq!(backend.calls(), 8);

    let stats = node.user_stats(&user).await.unwrap();
    assert_eq!(stats.total_memories, 3);
    assert_eq!(stats.average_duration_minutes, 1);

    // Recovery: after the cooldown one trial call closes the circuit.
    backend.set_failing(false);
    tokio::time::sleep(Duration::from_millis(450)).await;
    let result = node.save(Some("erin"), &MemoryId::new("m4"), payload()).await.unwrap();
    assert!(result.is_remote());
    assert_eq!(node.breaker().state(), CircuitState::Closed);
    assert_eq!(node.breaker().failure_count(), 0);

    let remote = node.list_user_objects(&user, 10).await.unwrap();
    let ids: Vec<_> = remote.iter().map(|o| o.metadata.memory_id.as_str()).collect();
    assert_eq!(ids.len(), 2);
    assert!(ids.contains(&"m0"));
    assert!(ids.contains(&"m4"));
}

#[tokio::test]
async fn test_failed_daily_shard_falls_back_and_keeps_user_shard() {
    let tmp = tempfile::TempDir::new().unwrap();
    let backend = Arc::new(SwitchableBackend::new("/all/"));
    backend.set_failing(true);
    let node = VaultNode::with_remote_backend(test_config(tmp.path()), backend.clone())
        .await
        .unwrap();

    let result = node.save(Some("finn"), &MemoryId::new("m1"), payload()).await.unwrap();
    let StorageResult::Filesystem { path } = result else {
        panic!("expected local fallback");
    };
    assert!(path.exists());
    assert!(tmp.path().join("all").is_dir());

    // The user shard written before the daily shard failed stays in place.
    let remote_user_shard = backend
        .inner
        .list("mobil3-mentorships/by-user/finn/")
        .await
        .unwrap();
    assert_eq!(remote_user_shard.len(), 1);
    assert!(backend.inner.list("mobil3-mentorships/all/").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_local_fallback_failure_propagates() {
    let tmp = tempfile::TempDir::new().unwrap();
    let node = VaultNode::start(VaultConfig::local(tmp.path())).await.unwrap();

    // Block the user directory with a plain file.
    std::fs::create_dir_all(tmp.path().join("by-user")).unwrap();
    std::fs::write(tmp.path().join("by-user/gwen"), "not a directory").unwrap();

    let result = node.save(Some("gwen"), &MemoryId::new("m1"), payload()).await;
    assert!(matches!(result, Err(MemvaultError::Storage { .. })));
}
