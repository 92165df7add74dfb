//! The memvault node, one process's view of the storage gateway.
//!
//! [`VaultNode`] is the main runtime entry point. It builds the single
//! [`CircuitBreaker`] of the process, the remote backend when credentials
//! are present, the local fallback root, and wires them into a
//! [`FallbackCoordinator`] and a [`StatsAggregator`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use memvault_core::config::{RemoteConfig, VaultConfig};
use memvault_core::error::MemvaultError;
use memvault_core::object::{Payload, StorageResult, StoredObject};
use memvault_core::storage::StorageBackend;
use memvault_core::types::{MemoryId, UserId};
use memvault_core::Result;
use memvault_storage::local::LocalBackend;
use memvault_storage::s3::S3Backend;

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerSnapshot};
use crate::fallback::FallbackCoordinator;
use crate::gateway::StorageGateway;
use crate::retry::RetryPolicy;
use crate::stats::{DailyStats, StatsAggregator, UserStats};

/// Health surface of a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    /// Whether a remote backend was configured and built.
    pub remote_configured: bool,
    /// Whether the circuit currently permits remote calls.
    pub remote_available: bool,
    pub circuit: CircuitBreakerSnapshot,
    pub log_root: PathBuf,
    pub root_prefix: String,
}

/// A memvault node.
///
/// With valid remote settings events go to the S3-compatible bucket and
/// degrade to local disk on failure. Without them (or when they are
/// incomplete) the node runs local-only.
pub struct VaultNode {
    /// Node configuration.
    pub config: VaultConfig,

    breaker: Arc<CircuitBreaker>,
    coordinator: Arc<FallbackCoordinator>,
    stats: StatsAggregator,
}

impl VaultNode {
    /// Start a node with the given configuration.
    ///
    /// Missing or invalid remote settings are logged and the node starts
    /// local-only. Fails only when the local fallback root is unusable.
    pub async fn start(config: VaultConfig) -> Result<Self> {
        let remote: Option<Arc<dyn StorageBackend>> = match &config.remote {
            Some(remote) => match S3Backend::new(remote) {
                Ok(backend) => {
                    info!(bucket = %backend.bucket(), "Remote storage enabled");
                    Some(Arc::new(backend))
                }
                Err(e) => {
                    warn!(error = %e, "Remote storage disabled, running local-only");
                    None
                }
            },
            None => {
                info!("No remote storage configured, running local-only");
                None
            }
        };
        Self::assemble(config, remote).await
    }

    /// Start a node over an already-built remote backend.
    pub async fn with_remote_backend(
        config: VaultConfig,
        backend: Arc<dyn StorageBackend>,
    ) -> Result<Self> {
        Self::assemble(config, Some(backend)).await
    }

    async fn assemble(
        mut config: VaultConfig,
        remote: Option<Arc<dyn StorageBackend>>,
    ) -> Result<Self> {
        config.log_root = expand_home(&config.log_root)?;
        let local = LocalBackend::new(&config.log_root).await?;

        let breaker = Arc::new(CircuitBreaker::new(config.breaker.clone()));
        let gateway = remote.map(|backend| {
            StorageGateway::new(
                backend,
                Arc::clone(&breaker),
                RetryPolicy::new(config.retry.clone()),
                config.root_prefix.clone(),
            )
            .with_public_base_url(config.remote.as_ref().and_then(RemoteConfig::public_base_url))
        });
        let remote_configured = gateway.is_some();

        let coordinator = Arc::new(FallbackCoordinator::new(
            gateway,
            local,
            config.rotation_limit,
        ));
        let stats = StatsAggregator::new(Arc::clone(&coordinator), config.stats_scan_limit);

        info!(
            log_root = %config.log_root.display(),
            root_prefix = %config.root_prefix,
            remote = remote_configured,
            failure_threshold = config.breaker.failure_threshold,
            max_retries = config.retry.max_retries,
            "memvault node started"
        );

        Ok(Self {
            config,
            breaker,
            coordinator,
            stats,
        })
    }

    /// Persist one event. See [`FallbackCoordinator::save`].
    pub async fn save(
        &self,
        raw_user_id: Option<&str>,
        memory_id: &MemoryId,
        payload: Payload,
    ) -> Result<StorageResult> {
        self.coordinator.save(raw_user_id, memory_id, payload).await
    }

    pub async fn list_user_objects(
        &self,
        user_id: &UserId,
        limit: usize,
    ) -> Result<Vec<StoredObject>> {
        self.coordinator.list_user_objects(user_id, limit).await
    }

    pub async fn list_daily_objects(&self, limit: usize) -> Result<Vec<StoredObject>> {
        self.coordinator.list_daily_objects(limit).await
    }

    pub async fn user_stats(&self, user_id: &UserId) -> Result<UserStats> {
        self.stats.user_stats(user_id).await
    }

    pub async fn daily_stats(&self) -> Result<DailyStats> {
        self.stats.daily_stats().await
    }

    pub fn coordinator(&self) -> &Arc<FallbackCoordinator> {
        &self.coordinator
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn health(&self) -> HealthReport {
        let remote_configured = self.coordinator.remote_configured();
        HealthReport {
            remote_configured,
            remote_available: remote_configured && self.breaker.is_call_permitted(),
            circuit: self.breaker.snapshot(),
            log_root: self.coordinator.log_root().to_path_buf(),
            root_prefix: self.config.root_prefix.clone(),
        }
    }

    /// Gracefully shut down the node.
    ///
    /// Saves are awaited by their callers, so there is nothing to drain;
    /// this logs the final circuit state.
    pub async fn shutdown(&self) {
        info!(
            circuit = self.breaker.state().as_str(),
            failure_count = self.breaker.failure_count(),
            "memvault node shutting down"
        );
    }
}

/// Expand a leading `~` to the home directory.
fn expand_home(path: &Path) -> Result<PathBuf> {
    let Some(raw) = path.to_str() else {
        return Ok(path.to_path_buf());
    };
    if raw != "~" && !raw.starts_with("~/") && !raw.starts_with("~\\") {
        return Ok(path.to_path_buf());
    }
    let home = home_dir().ok_or_else(|| MemvaultError::Config {
        message: "Cannot determine home directory".to_string(),
    })?;
    Ok(match raw.get(2..) {
        Some(rest) if !rest.is_empty() => home.join(rest),
        _ => home,
    })
}

/// Best-effort home directory detection.
fn home_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE").ok().map(PathBuf::from)
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME").ok().map(PathBuf::from)
    }
}
