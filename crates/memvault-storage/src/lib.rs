//! Storage backend implementations for memvault.
//!
//! This crate provides concrete implementations of the
//! [`StorageBackend`](memvault_core::StorageBackend) trait:
//!
//! - [`LocalBackend`]: filesystem-backed storage for the local fallback path
//! - [`S3Backend`]: S3-compatible object storage for the remote shards

pub mod local;
pub mod s3;

pub use local::LocalBackend;
pub use s3::S3Backend;
