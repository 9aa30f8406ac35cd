use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use super::{BlobError, BlobStore};

/// In-memory blob store.
///
/// Used by the test suite and useful for embedding. Counts `put` and `delete`
/// calls so tests can assert that deduplicated uploads never re-upload.
#[derive(Debug, Default)]
pub struct MemBlobStore {
    blobs: RwLock<HashMap<String, Bytes>>,
    puts: AtomicUsize,
    deletes: AtomicUsize,
}

impl MemBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `put` calls observed so far.
    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    /// Number of `delete` calls observed so far.
    pub fn delete_count(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    /// Whether a blob currently exists under `key`.
    pub fn contains(&self, key: &str) -> bool {
        self.blobs.read().unwrap().contains_key(key)
    }

    /// Number of stored blobs.
    pub fn len(&self) -> usize {
        self.blobs.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.read().unwrap().is_empty()
    }
}

#[async_trait]
impl BlobStore for MemBlobStore {
    async fn put(&self, key: &str, data: Bytes) -> Result<(), BlobError> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.blobs.write().unwrap().insert(key.to_string(), data);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, BlobError> {
        Ok(self.blobs.read().unwrap().get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<(), BlobError> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.blobs.write().unwrap().remove(key);
        Ok(())
    }

    async fn presigned_url(&self, key: &str, ttl: Duration) -> Result<String, BlobError> {
        Ok(format!("memory:///{}?expires_in={}", key, ttl.as_secs()))
    }
}
