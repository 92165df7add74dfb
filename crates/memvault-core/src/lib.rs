//! memvault core types, traits, configuration, and errors.
//!
//! This crate provides the foundational building blocks for the memvault
//! event-storage gateway: typed identifiers with user-id sanitization, the
//! [`StoredObject`] envelope, the [`StorageBackend`] trait, gateway
//! configuration, and the unified error type.

pub mod config;
pub mod error;
pub mod object;
pub mod storage;
pub mod types;

pub use config::{CircuitBreakerConfig, RemoteConfig, RetryConfig, VaultConfig};
pub use error::MemvaultError;
pub use object::{ObjectKind, ObjectMetadata, Payload, StorageResult, StoredObject};
pub use storage::{ObjectInfo, StorageBackend};
pub use types::*;

/// Convenience Result type using [`MemvaultError`].
pub type Result<T> = std::result::Result<T, MemvaultError>;
