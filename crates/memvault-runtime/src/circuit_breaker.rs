//! Circuit breaker for remote storage calls.
//!
//! Stops calling a failing backend for a cooldown period so that a storage
//! outage turns into fast local fallbacks instead of a pile of slow retries.
//!
//! ## State Transitions
//!
//! ```text
//! ┌────────┐  failures >= threshold   ┌──────┐
//! │ Closed │ ───────────────────────> │ Open │ <──────┐
//! └───┬────┘                          └───┬──┘        │
//!     ▲                                   │ timeout   │ trial fails
//!     │ trial succeeds               ┌────▼─────┐     │
//!     └───────────────────────────── │ HalfOpen │ ────┘
//!                                    └──────────┘
//! ```
//!
//! - **Closed**: calls pass through; consecutive failures are counted and any
//!   success resets the count.
//! - **Open**: calls fail immediately with [`MemvaultError::CircuitOpen`]
//!   and the operation is never invoked.
//! - **HalfOpen**: entered lazily by the first call made after `timeout` has
//!   elapsed since the last failure. Exactly one trial call runs; everyone
//!   else is rejected until it finishes.
//!
//! One breaker is created per process by the node and shared by reference.
//! All transitions happen under a single mutex; the operation itself runs
//! outside the lock.

use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use memvault_core::config::CircuitBreakerConfig;
use memvault_core::error::MemvaultError;
use memvault_core::Result;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    /// Normal operation - calls pass through
    Closed,
    /// Too many failures - calls rejected without being attempted
    Open,
    /// Cooldown elapsed - a single trial call is allowed
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half-open",
        }
    }
}

/// Point-in-time view of the breaker for health reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub failure_threshold: u32,
    pub timeout_ms: u64,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
    last_failure_at: Option<DateTime<Utc>>,
    trial_in_flight: bool,
}

/// Three-state circuit breaker guarding the remote backend.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure: None,
                last_failure_at: None,
                trial_in_flight: false,
            }),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        // State is plain data; a panic elsewhere cannot leave it torn.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cooldown_elapsed(&self, inner: &BreakerInner) -> bool {
        match inner.last_failure {
            Some(at) => at.elapsed() >= self.config.timeout,
            None => true,
        }
    }

    /// Run `operation` through the breaker.
    ///
    /// Fails with [`MemvaultError::CircuitOpen`] without invoking the
    /// operation while the circuit is open (or a half-open trial is already
    /// running). Otherwise the operation's outcome updates the state.
    pub async fn execute<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut permit = self.acquire()?;
        let result = operation().await;
        match &result {
            Ok(_) => self.record_success(),
            Err(_) => self.record_failure(),
        }
        permit.finished = true;
        result
    }

    fn acquire(&self) -> Result<CallPermit<'_>> {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => Ok(CallPermit::new(self, false)),
            CircuitState::Open => {
                if self.cooldown_elapsed(&inner) {
                    inner.state = CircuitState::HalfOpen;
                    inner.trial_in_flight = true;
                    info!(
                        failure_count = inner.failure_count,
                        "Circuit half-open, allowing trial call"
                    );
                    Ok(CallPermit::new(self, true))
                } else {
                    Err(MemvaultError::CircuitOpen {
                        failures: inner.failure_count,
                    })
                }
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    Err(MemvaultError::CircuitOpen {
                        failures: inner.failure_count,
                    })
                } else {
                    inner.trial_in_flight = true;
                    Ok(CallPermit::new(self, true))
                }
            }
        }
    }

    fn record_success(&self) {
        let mut inner = self.lock();
        if inner.state != CircuitState::Closed {
            info!(previous = inner.state.as_str(), "Circuit closed");
        }
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.trial_in_flight = false;
    }

    fn record_failure(&self) {
        let mut inner = self.lock();
        inner.failure_count = inner.failure_count.saturating_add(1);
        inner.last_failure = Some(Instant::now());
        inner.last_failure_at = Some(Utc::now());
        inner.trial_in_flight = false;

        if inner.failure_count >= self.config.failure_threshold
            && inner.state != CircuitState::Open
        {
            warn!(
                failure_count = inner.failure_count,
                threshold = self.config.failure_threshold,
                timeout_ms = self.config.timeout.as_millis() as u64,
                "Circuit opened"
            );
            inner.state = CircuitState::Open;
        }
    }

    /// Whether a call made now would be let through, without changing state.
    ///
    /// Used as the cheap health probe before attempting a remote write.
    pub fn is_call_permitted(&self) -> bool {
        let inner = self.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => self.cooldown_elapsed(&inner),
            CircuitState::HalfOpen => !inner.trial_in_flight,
        }
    }

    /// Current state (for monitoring).
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Current consecutive failure count (for monitoring).
    pub fn failure_count(&self) -> u32 {
        self.lock().failure_count
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let inner = self.lock();
        CircuitBreakerSnapshot {
            state: inner.state,
            failure_count: inner.failure_count,
            last_failure_at: inner.last_failure_at,
            failure_threshold: self.config.failure_threshold,
            timeout_ms: self.config.timeout.as_millis() as u64,
        }
    }

    /// Manually close the circuit.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.trial_in_flight = false;
    }
}

/// Releases the half-open trial slot if the caller's future is dropped
/// before the operation completes.
struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    finished: bool,
}

impl<'a> CallPermit<'a> {
    fn new(breaker: &'a CircuitBreaker, trial: bool) -> Self {
        Self {
            breaker,
            trial,
            finished: false,
        }
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if self.trial && !self.finished {
            self.breaker.lock().trial_in_flight = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::sleep;

    fn breaker(threshold: u32, timeout: Duration) -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: threshold,
            timeout,
        })
    }

    async fn fail(breaker: &CircuitBreaker) -> Result<()> {
        breaker
            .execute(|| async { Err(MemvaultError::storage_msg("boom")) })
            .await
    }

    async fn succeed(breaker: &CircuitBreaker) -> Result<()> {
        breaker.execute(|| async { Ok(()) }).await
    }

    #[tokio::test]
    async fn test_circuit_starts_closed() {
        let breaker = CircuitBreaker::with_defaults();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 0);
        assert!(breaker.is_call_permitted());
    }

    #[tokio::test]
    async fn test_circuit_opens_after_threshold() {
        let breaker = breaker(3, Duration::from_secs(10));

        fail(&breaker).await.unwrap_err();
        fail(&breaker).await.unwrap_err();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 2);

        fail(&breaker).await.unwrap_err();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.failure_count(), 3);
        assert!(!breaker.is_call_permitted());
    }

    #[tokio::test]
    async fn test_open_circuit_does_not_invoke_operation() {
        let breaker = breaker(1, Duration::from_secs(10));
        fail(&breaker).await.unwrap_err();

        let calls = AtomicU32::new(0);
        for _ in 0..3 {
            let result = breaker
                .execute(|| async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .await;
            assert!(matches!(result, Err(MemvaultError::CircuitOpen { failures: 1 })));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let breaker = breaker(3, Duration::from_secs(10));
        fail(&breaker).await.unwrap_err();
        fail(&breaker).await.unwrap_err();
        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.failure_count(), 0);

        // Needs a full run of failures again.
        fail(&breaker).await.unwrap_err();
        fail(&breaker).await.unwrap_err();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_success_closes() {
        let breaker = breaker(2, Duration::from_millis(50));
        fail(&breaker).await.unwrap_err();
        fail(&breaker).await.unwrap_err();
        assert_eq!(breaker.state(), CircuitState::Open);

        sleep(Duration::from_millis(60)).await;
        assert!(breaker.is_call_permitted());
        // The probe does not transition on its own.
        assert_eq!(breaker.state(), CircuitState::Open);

        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 0);
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens() {
        let breaker = breaker(2, Duration::from_millis(50));
        fail(&breaker).await.unwrap_err();
        fail(&breaker).await.unwrap_err();

        sleep(Duration::from_millis(60)).await;
        fail(&breaker).await.unwrap_err();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.failure_count(), 3);

        // Cooldown restarted from the failed trial.
        let result = succeed(&breaker).await;
        assert!(matches!(result, Err(MemvaultError::CircuitOpen { .. })));
    }

    #[tokio::test]
    async fn test_half_open_allows_exactly_one_trial() {
        let breaker = Arc::new(breaker(1, Duration::from_millis(50)));
        fail(&breaker).await.unwrap_err();
        sleep(Duration::from_millis(60)).await;

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let (started_tx, started_rx) = tokio::sync::oneshot::channel::<()>();

        let trial = {
            let breaker = breaker.clone();
            tokio::spawn(async move {
                breaker
                    .execute(|| async move {
                        let _ = started_tx.send(());
                        let _ = release_rx.await;
                        Ok(())
                    })
                    .await
            })
        };

        started_rx.await.unwrap();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(!breaker.is_call_permitted());

        let calls = AtomicU32::new(0);
        let concurrent = breaker
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(matches!(concurrent, Err(MemvaultError::CircuitOpen { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        release_tx.send(()).unwrap();
        trial.await.unwrap().unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_dropped_trial_releases_slot() {
        let breaker = breaker(1, Duration::from_millis(50));
        fail(&breaker).await.unwrap_err();
        sleep(Duration::from_millis(60)).await;

        let pending = breaker.execute(|| std::future::pending::<Result<()>>());
        let timed_out = tokio::time::timeout(Duration::from_millis(20), pending).await;
        assert!(timed_out.is_err());

        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(breaker.is_call_permitted());
        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_snapshot_reports_state() {
        let breaker = breaker(1, Duration::from_secs(60));
        let snapshot = breaker.snapshot();
        assert_eq!(snapshot.state, CircuitState::Closed);
        assert!(snapshot.last_failure_at.is_none());

        fail(&breaker).await.unwrap_err();
        let snapshot = breaker.snapshot();
        assert_eq!(snapshot.state, CircuitState::Open);
        assert_eq!(snapshot.failure_count, 1);
        assert_eq!(snapshot.timeout_ms, 60_000);
        assert!(snapshot.last_failure_at.is_some());

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["state"], "open");
    }

    #[tokio::test]
    async fn test_manual_reset() {
        let breaker = breaker(1, Duration::from_secs(100));
        fail(&breaker).await.unwrap_err();
        breaker.reset();
        assert_eq!(breaker.state(), CircuitState::Closed);
        succeed(&breaker).await.unwrap();
    }

    #[test]
    fn test_state_names() {
        assert_eq!(CircuitState::Closed.as_str(), "closed");
        assert_eq!(CircuitState::Open.as_str(), "open");
        assert_eq!(CircuitState::HalfOpen.as_str(), "half-open");
        assert_eq!(
            serde_json::to_string(&CircuitState::HalfOpen).unwrap(),
            "\"half-open\""
        );
    }
}
