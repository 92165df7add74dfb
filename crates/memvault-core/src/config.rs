//! Gateway configuration.
//!
//! [`VaultConfig`] captures the local fallback root, the remote key-space
//! root, retry and circuit breaker tuning, and the optional remote backend
//! credentials. [`VaultConfig::from_env`] reads everything from the process
//! environment; [`VaultConfig::from_lookup`] does the same from any lookup
//! function so tests never touch the real environment.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::MemvaultError;
use crate::Result;

/// Default root of the remote key space.
pub const DEFAULT_ROOT_PREFIX: &str = "mobil3-mentorships";

/// Default number of local files kept per directory by rotation.
pub const DEFAULT_ROTATION_LIMIT: usize = 100;

/// Default number of objects scanned when computing statistics.
pub const DEFAULT_STATS_SCAN_LIMIT: usize = 1000;

/// Retry tuning for remote calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt; total attempts are `max_retries + 1`.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
        }
    }
}

/// Circuit breaker tuning for the remote backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// How long the circuit stays open before a trial call is allowed.
    pub timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout: Duration::from_secs(60),
        }
    }
}

/// Credentials and location of the remote S3-compatible bucket.
///
/// Either `account_id` (Cloudflare R2 style, the endpoint is derived) or an
/// explicit `endpoint` must be set, together with both keys and the bucket.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteConfig {
    pub account_id: Option<String>,
    pub endpoint: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub bucket: Option<String>,
    /// Region passed to the S3 client. R2 accepts `auto`.
    pub region: String,
    /// Public base URL for objects, if the bucket is exposed.
    pub public_url: Option<String>,
}

impl RemoteConfig {
    /// Check that every required setting is present and non-empty.
    pub fn validate(&self) -> Result<()> {
        let mut missing = Vec::new();
        if present(&self.account_id).is_none() && present(&self.endpoint).is_none() {
            missing.push("account id or endpoint");
        }
        if present(&self.access_key_id).is_none() {
            missing.push("access key id");
        }
        if present(&self.secret_access_key).is_none() {
            missing.push("secret access key");
        }
        if present(&self.bucket).is_none() {
            missing.push("bucket name");
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(MemvaultError::Config {
                message: format!("remote storage is missing: {}", missing.join(", ")),
            })
        }
    }

    /// The HTTPS endpoint of the bucket's S3 API.
    pub fn endpoint_url(&self) -> Option<String> {
        if let Some(endpoint) = present(&self.endpoint) {
            return Some(endpoint.to_string());
        }
        present(&self.account_id).map(|id| format!("https://{id}.r2.cloudflarestorage.com"))
    }

    /// Public base URL without a trailing slash, if the bucket is exposed.
    pub fn public_base_url(&self) -> Option<String> {
        present(&self.public_url).map(|base| base.trim_end_matches('/').to_string())
    }
}

fn present(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// Top-level configuration of a memvault node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultConfig {
    /// Directory holding the local fallback files.
    pub log_root: PathBuf,

    /// Root of the remote key space, e.g. `mobil3-mentorships`.
    pub root_prefix: String,

    pub retry: RetryConfig,

    pub breaker: CircuitBreakerConfig,

    /// Files kept per local directory after rotation.
    pub rotation_limit: usize,

    /// Objects scanned per statistics request.
    pub stats_scan_limit: usize,

    /// Remote backend settings. `None` runs the node local-only.
    pub remote: Option<RemoteConfig>,
}

impl VaultConfig {
    /// A local-only configuration rooted at `log_root` with default tuning.
    pub fn local(log_root: impl Into<PathBuf>) -> Self {
        Self {
            log_root: log_root.into(),
            root_prefix: DEFAULT_ROOT_PREFIX.to_string(),
            retry: RetryConfig::default(),
            breaker: CircuitBreakerConfig::default(),
            rotation_limit: DEFAULT_ROTATION_LIMIT,
            stats_scan_limit: DEFAULT_STATS_SCAN_LIMIT,
            remote: None,
        }
    }

    /// Read configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read configuration through `lookup`.
    ///
    /// | Variable | Meaning |
    /// |----------|---------|
    /// | `MEMVAULT_LOG_ROOT` | local fallback root (default `./logs`) |
    /// | `MEMVAULT_ROOT_PREFIX` | remote key root |
    /// | `R2_ACCOUNT_ID` / `MEMVAULT_S3_ENDPOINT` | remote endpoint |
    /// | `R2_ACCESS_KEY_ID`, `R2_SECRET_ACCESS_KEY` | credentials |
    /// | `R2_BUCKET_NAME` | bucket |
    /// | `R2_PUBLIC_URL` | public base URL (optional) |
    /// | `MEMVAULT_S3_REGION` | region (default `auto`) |
    ///
    /// The remote section is only populated when at least one remote
    /// variable is set; validation happens when the backend is built.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let log_root = lookup("MEMVAULT_LOG_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("logs"));
        let mut config = Self::local(log_root);

        if let Some(prefix) = lookup("MEMVAULT_ROOT_PREFIX").filter(|p| !p.trim().is_empty()) {
            config.root_prefix = prefix.trim().trim_matches('/').to_string();
        }

        let remote = RemoteConfig {
            account_id: lookup("R2_ACCOUNT_ID"),
            endpoint: lookup("MEMVAULT_S3_ENDPOINT"),
            access_key_id: lookup("R2_ACCESS_KEY_ID"),
            secret_access_key: lookup("R2_SECRET_ACCESS_KEY"),
            bucket: lookup("R2_BUCKET_NAME"),
            region: lookup("MEMVAULT_S3_REGION").unwrap_or_else(|| "auto".to_string()),
            public_url: lookup("R2_PUBLIC_URL"),
        };
        let any_remote = [
            &remote.account_id,
            &remote.endpoint,
            &remote.access_key_id,
            &remote.secret_access_key,
            &remote.bucket,
        ]
        .iter()
        .any(|v| v.is_some());
        if any_remote {
            config.remote = Some(remote);
        }

        config
    }
}
