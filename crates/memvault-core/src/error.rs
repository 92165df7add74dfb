//! Unified error types for memvault.
//!
//! All errors are represented by [`MemvaultError`], using `thiserror` for
//! ergonomic error definitions. Library code never uses `unwrap()`; every
//! fallible operation returns `Result<T, MemvaultError>`.
//!
//! The variants map onto the gateway's failure taxonomy:
//!
//! - [`Config`](MemvaultError::Config): required settings are missing (fatal
//!   for the remote subsystem only)
//! - [`BackendUnavailable`](MemvaultError::BackendUnavailable): the remote
//!   store could not serve a request; callers fall back to local disk
//! - [`Decode`](MemvaultError::Decode): one stored object is malformed
//! - [`Rotation`](MemvaultError::Rotation): an old local file could not be
//!   removed

use thiserror::Error;

/// The unified error type for all memvault operations.
#[derive(Error, Debug)]
pub enum MemvaultError {
    /// A storage operation failed.
    #[error("Storage error: {message}")]
    Storage {
        /// Human-readable description of the failure.
        message: String,
        /// The underlying error, if available.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The requested key was not found in storage.
    #[error("Not found: {key}")]
    NotFound {
        /// The storage key that was not found.
        key: String,
    },

    /// The circuit breaker rejected the call without attempting it.
    #[error("Circuit open: remote backend calls suspended after {failures} consecutive failures")]
    CircuitOpen {
        /// Failure count at the time of rejection.
        failures: u32,
    },

    /// The remote backend could not serve the request (circuit open or
    /// retries exhausted).
    #[error("Backend unavailable: {message}")]
    BackendUnavailable {
        /// What the gateway was trying to do.
        message: String,
        /// The last error observed from the backend.
        #[source]
        source: Option<Box<MemvaultError>>,
    },

    /// A stored object could not be decoded.
    #[error("Decode error for {key}: {message}")]
    Decode {
        /// The key of the malformed object.
        key: String,
        /// The parser's description of the problem.
        message: String,
    },

    /// A payload could not be serialised.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// An old local file could not be removed during rotation.
    #[error("Rotation failed for {path}: {message}")]
    Rotation {
        /// The file that could not be deleted.
        path: String,
        /// Description of the failure.
        message: String,
    },

    /// Invalid or missing configuration.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration problem.
        message: String,
    },

    /// An internal error (bug).
    #[error("Internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl MemvaultError {
    /// Create a storage error from a message and source error.
    pub fn storage(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a storage error from a message only.
    pub fn storage_msg(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Wrap a backend failure as [`MemvaultError::BackendUnavailable`].
    pub fn backend_unavailable(message: impl Into<String>, source: MemvaultError) -> Self {
        Self::BackendUnavailable {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Whether this error means the remote path failed and a fallback may
    /// take over.
    pub fn is_backend_unavailable(&self) -> bool {
        matches!(
            self,
            Self::BackendUnavailable { .. } | Self::CircuitOpen { .. }
        )
    }
}

impl From<serde_json::Error> for MemvaultError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
