//! memvault runtime: the resilient event-storage gateway.
//!
//! This crate contains the [`VaultNode`] entry point and the layers it
//! composes: [`RetryPolicy`] and [`CircuitBreaker`] around every remote
//! call, the [`StorageGateway`] that owns the remote key layout, the
//! [`FallbackCoordinator`] that degrades to local disk, and the
//! [`StatsAggregator`] that rebuilds statistics from stored events.

pub mod circuit_breaker;
pub mod fallback;
pub mod gateway;
pub mod node;
pub mod retry;
pub mod stats;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerSnapshot, CircuitState};
pub use fallback::FallbackCoordinator;
pub use gateway::StorageGateway;
pub use node::{HealthReport, VaultNode};
pub use retry::{is_retryable_error, RetryPolicy};
pub use stats::{DailyStats, MemoryView, StatsAggregator, UserStats};
