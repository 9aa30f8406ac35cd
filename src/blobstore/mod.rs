//! Blob store capability: durable byte storage under a key, time-limited
//! retrieval URLs, deletion by key.
//!
//! The blob store is an external collaborator with its own failure domain; it
//! is never part of a metadata transaction. Callers order metadata commits
//! after the blob operations they depend on.

mod fs;
mod memory;

pub use fs::FsBlobStore;
pub use memory::MemBlobStore;

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    #[error("blob store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid blob key: {0}")]
    InvalidKey(String),

    #[error("blob store unavailable: {0}")]
    Unavailable(String),
}

/// Object store operations consumed by the content store.
///
/// Assumed at-least-once semantics: `put` of identical content under the same
/// key is harmless, and `delete` of a missing key succeeds.
#[async_trait]
pub trait BlobStore: Send + Sync + std::fmt::Debug + 'static {
    /// Durably stores `data` under `key`.
    async fn put(&self, key: &str, data: Bytes) -> Result<(), BlobError>;

    /// Retrieves the blob stored under `key`, if present.
    async fn get(&self, key: &str) -> Result<Option<Bytes>, BlobError>;

    /// Deletes the blob stored under `key`. Missing keys are not an error.
    async fn delete(&self, key: &str) -> Result<(), BlobError>;

    /// Issues a time-limited retrieval URL for `key`.
    async fn presigned_url(&self, key: &str, ttl: Duration) -> Result<String, BlobError>;
}
