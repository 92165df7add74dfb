//! Retry with bounded exponential backoff.
//!
//! [`RetryPolicy::run`] invokes an async operation up to `max_retries + 1`
//! times. Between attempts it sleeps for
//!
//! ```text
//! delay(n) = min(base_delay * backoff_multiplier^n, max_delay)   // n is 0-indexed
//! ```
//!
//! using `tokio::time::sleep`, so a slow backend never blocks a worker
//! thread. Errors whose message (or any message in their source chain)
//! does not look transient are returned after the first attempt. When every
//! attempt fails, the last error is returned as-is, never wrapped.
//!
//! Storage keys embed user and memory ids, so any whitespace-separated
//! token containing a path separator is dropped before matching. A user
//! named `network_ops` cannot turn an `access denied` into a retry.

use std::error::Error as StdError;
use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, warn};

use memvault_core::config::RetryConfig;
use memvault_core::error::MemvaultError;

/// Substrings that mark an error as transient. Matched case-insensitively.
const RETRYABLE_MARKERS: &[&str] = &[
    "network",
    "timeout",
    "timed out",
    "connection",
    "reset",
    "not found",
    "notfound",
    "internal server error",
    "bad gateway",
    "service unavailable",
    "throttl",
    "slow down",
    "slowdown",
    "too many requests",
];

/// HTTP status codes treated as transient. Matched as whole tokens so keys
/// embedding timestamps such as `...-1700000500123.json` never match.
const RETRYABLE_STATUS_CODES: &[&str] = &["429", "500", "502", "503", "504"];

/// Whether `err` looks like a transient backend failure worth retrying.
///
/// Every error in the source chain is checked, because wrappers such as
/// `Storage error: S3 put failed` hide the transport message one level down.
/// A typed [`MemvaultError::NotFound`] at the top is a definite answer from
/// the backend and is never retried.
pub fn is_retryable_error(err: &(dyn StdError + 'static)) -> bool {
    if let Some(MemvaultError::NotFound { .. }) = err.downcast_ref::<MemvaultError>() {
        return false;
    }
    let mut current: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(e) = current {
        if is_retryable_message(&e.to_string()) {
            return true;
        }
        current = e.source();
    }
    false
}

/// `message` with every key-like token (one containing `/` or `\`) removed.
fn without_keys(message: &str) -> String {
    message
        .split_whitespace()
        .filter(|token| !token.contains(['/', '\\']))
        .collect::<Vec<_>>()
        .join(" ")
}

fn is_retryable_message(message: &str) -> bool {
    let lower = without_keys(message).to_lowercase();
    RETRYABLE_MARKERS.iter().any(|m| lower.contains(m))
        || lower
            .split(|c: char| !c.is_ascii_alphanumeric())
            .any(|token| RETRYABLE_STATUS_CODES.contains(&token))
}

/// Bounded exponential backoff around fallible async operations.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Delay before the retry that follows attempt `attempt` (0-indexed).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base_ms = self.config.base_delay.as_millis() as f64;
        let factor = self.config.backoff_multiplier.powi(attempt.min(i32::MAX as u32) as i32);
        let delay_ms = base_ms * factor;
        let max_ms = self.config.max_delay.as_millis() as f64;
        if !delay_ms.is_finite() || delay_ms >= max_ms {
            self.config.max_delay
        } else {
            Duration::from_millis(delay_ms as u64)
        }
    }

    /// Run `operation`, retrying transient failures.
    pub async fn run<F, Fut, T, E>(&self, mut operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: StdError + 'static,
    {
        let max_retries = self.config.max_retries;
        let mut attempt: u32 = 0;

        loop {
            match operation().await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(attempt = attempt + 1, "Operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) => {
                    if !is_retryable_error(&err) {
                        warn!(
                            attempt = attempt + 1,
                            max_attempts = max_retries + 1,
                            delay_ms = 0u64,
                            error = %err,
                            "Attempt failed with a non-retryable error, not retrying"
                        );
                        return Err(err);
                    }
                    if attempt >= max_retries {
                        warn!(
                            attempts = attempt + 1,
                            error = %err,
                            "Retries exhausted"
                        );
                        return Err(err);
                    }

                    let delay = self.delay_for(attempt);
                    warn!(
                        attempt = attempt + 1,
                        max_attempts = max_retries + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Attempt failed, retrying"
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memvault_core::MemvaultError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(RetryConfig {
            max_retries,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: 2.0,
        })
    }

    #[test]
    fn test_delay_grows_and_caps() {
        let policy = RetryPolicy::new(RetryConfig {
            max_retries: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
            backoff_multiplier: 2.0,
        });
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for(3), Duration::from_millis(800));
        assert_eq!(policy.delay_for(4), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(60), Duration::from_millis(1000));
    }

    #[test]
    fn test_retryable_classification() {
        for msg in [
            "connection reset by peer",
            "operation Timed Out",
            "HTTP 503 Service Unavailable",
            "request was throttled",
            "SlowDown: please reduce your request rate",
            "DNS network failure",
        ] {
            assert!(
                is_retryable_error(&MemvaultError::storage_msg(msg)),
                "{msg} should be retryable"
            );
        }
        for msg in ["access denied", "invalid bucket name", "403 forbidden"] {
            assert!(
                !is_retryable_error(&MemvaultError::storage_msg(msg)),
                "{msg} should not be retryable"
            );
        }
    }

    #[test]
    fn test_status_codes_match_whole_tokens_only() {
        assert!(is_retryable_message("S3 returned 502"));
        assert!(is_retryable_message("status=429"));
        assert!(!is_retryable_message(
            "access denied for root/all/2024-01-01/u-m-1700000500123.json"
        ));
    }

    #[test]
    fn test_ids_inside_keys_do_not_make_errors_retryable() {
        for user in ["network_ops", "reset-team", "connection", "timeout"] {
            let key = format!("mobil3-mentorships/by-user/{user}/2024/05/m1-1.json");
            let denied = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "access denied");
            let err = MemvaultError::storage(format!("S3 put failed for {key}"), denied);
            assert!(!is_retryable_error(&err), "{user} made a denial retryable");

            let refused = std::io::Error::new(std::io::ErrorKind::Other, "connection refused");
            let err = MemvaultError::storage(format!("S3 put failed for {key}"), refused);
            assert!(is_retryable_error(&err));
        }
        assert!(!is_retryable_message(
            "Object at location root/by-user/slowdown/m-1.json: access denied"
        ));
    }

    #[test]
    fn test_typed_not_found_is_final() {
        let err = MemvaultError::NotFound {
            key: "root/by-user/u/2024/01/m-1.json".into(),
        };
        assert!(!is_retryable_error(&err));
        assert!(is_retryable_message("upstream said: not found, try again"));
    }

    #[test]
    fn test_classification_walks_source_chain() {
        let inner = std::io::Error::new(std::io::ErrorKind::Other, "connection refused");
        let outer = MemvaultError::storage("S3 put failed for k", inner);
        assert!(is_retryable_error(&outer));
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let policy = fast_policy(5);
        let calls = AtomicU32::new(0);
        let counter = &calls;

        let result: Result<u32, MemvaultError> = policy
            .run(move || async move {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                if n < 3 {
                    Err(MemvaultError::storage_msg("timeout"))
                } else {
                    Ok(n)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_always_failing_surfaces_original_error() {
        let policy = fast_policy(3);
        let calls = AtomicU32::new(0);
        let counter = &calls;

        let result: Result<(), MemvaultError> = policy
            .run(move || async move {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                Err(MemvaultError::storage_msg(format!("connection lost #{n}")))
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        match result.unwrap_err() {
            MemvaultError::Storage { message, .. } => assert_eq!(message, "connection lost #3"),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_non_retryable_error_is_not_retried() {
        let policy = fast_policy(5);
        let calls = AtomicU32::new(0);
        let counter = &calls;

        let result: Result<(), MemvaultError> = policy
            .run(move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(MemvaultError::storage_msg("access denied"))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_not_found_is_returned_after_one_attempt() {
        let policy = fast_policy(5);
        let calls = AtomicU32::new(0);
        let counter = &calls;

        let result: Result<(), MemvaultError> = policy
            .run(move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(MemvaultError::NotFound { key: "k".into() })
            })
            .await;

        assert!(matches!(result, Err(MemvaultError::NotFound { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_zero_retries_means_single_attempt() {
        let policy = fast_policy(0);
        let calls = AtomicU32::new(0);
        let counter = &calls;

        let result: Result<(), MemvaultError> = policy
            .run(move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(MemvaultError::storage_msg("timeout"))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
