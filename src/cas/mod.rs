//! Content-addressable storage layer.
//!
//! Deduplicates identical content across all users: one [`ContentEntry`] per
//! unique SHA-256 hash, reference-counted by the number of active catalog
//! bindings. Blob uploads and purges are ordered against metadata commits so
//! the object store never disagrees with a committed refcount:
//!
//! - first upload of a hash: blob put, then the entry commits with refcount 1;
//! - last release of a hash: blob delete, then the record removal commits.
//!
//! Acquire/release on the same hash are serialized through [`HashLocks`] so a
//! release cannot purge a blob that a concurrent acquire is about to
//! reference.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

use crate::blobstore::{BlobError, BlobStore};
use crate::metastore::{ContentEntry, MetaError, MetaTx};
use crate::metrics::SharedMetrics;
use crate::thumbnail::ThumbnailGenerator;

/// SHA-256 content hash, lower-case hex. Doubles as the blob key.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentHash(String);

impl ContentHash {
    pub fn of(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self(hex::encode(hasher.finalize()))
    }

    /// Parses a stored hash string. Only used for values read back from the
    /// metadata store, which are written exclusively through [`Self::of`].
    pub fn from_stored(s: String) -> Self {
        Self(s)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Object store key of the payload (= hash, by convention).
    pub fn blob_key(&self) -> &str {
        &self.0
    }

    /// Object store key of the derived thumbnail.
    pub fn thumbnail_key(&self) -> String {
        format!("thumb_{}.jpg", self.0)
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", &self.0)
    }
}

/// Per-hash async locks serializing acquire/release on the same content.
#[derive(Debug, Default)]
pub struct HashLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl HashLocks {
    pub async fn lock(&self, hash: &ContentHash) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            // Drop locks nobody currently holds to keep the map bounded.
            locks.retain(|_, l| Arc::strong_count(l) > 1);
            locks
                .entry(hash.as_str().to_string())
                .or_default()
                .clone()
        };
        lock.lock_owned().await
    }

    /// Locks two hashes in sorted order so concurrent rebinds touching the
    /// same pair cannot deadlock. Equal or absent second hash takes a single
    /// lock.
    pub async fn lock_pair(
        &self,
        a: &ContentHash,
        b: Option<&ContentHash>,
    ) -> (OwnedMutexGuard<()>, Option<OwnedMutexGuard<()>>) {
        match b {
            None => (self.lock(a).await, None),
            Some(b) if b == a => (self.lock(a).await, None),
            Some(b) => {
                if a.as_str() < b.as_str() {
                    let ga = self.lock(a).await;
                    let gb = self.lock(b).await;
                    (ga, Some(gb))
                } else {
                    let gb = self.lock(b).await;
                    let ga = self.lock(a).await;
                    (ga, Some(gb))
                }
            }
        }
    }
}

/// Blobs written ahead of a metadata transaction for a first-seen hash.
#[derive(Debug)]
pub struct StagedUpload {
    pub thumbnail_key: Option<String>,
}

/// The deduplicating content store.
///
/// Metadata-side acquire/release run inside the caller's [`MetaTx`]; the
/// blob-side staging and purging run outside it, under the caller's hash
/// lock.
pub struct ContentStore {
    blobs: Arc<dyn BlobStore>,
    thumbnails: Arc<dyn ThumbnailGenerator>,
    locks: HashLocks,
    metrics: SharedMetrics,
}

impl fmt::Debug for ContentStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContentStore").finish()
    }
}

impl ContentStore {
    pub fn new(
        blobs: Arc<dyn BlobStore>,
        thumbnails: Arc<dyn ThumbnailGenerator>,
        metrics: SharedMetrics,
    ) -> Self {
        Self {
            blobs,
            thumbnails,
            locks: HashLocks::default(),
            metrics,
        }
    }

    pub fn blob_store(&self) -> &Arc<dyn BlobStore> {
        &self.blobs
    }

    pub fn locks(&self) -> &HashLocks {
        &self.locks
    }

    /// Uploads the payload (and optional thumbnail) for a hash that has no
    /// content entry yet. Must be called under the hash lock, before the
    /// metadata transaction. A failed payload put leaves no state anywhere; a
    /// failed thumbnail put only costs the thumbnail.
    pub async fn stage(
        &self,
        hash: &ContentHash,
        data: &Bytes,
        filename: &str,
    ) -> Result<StagedUpload, BlobError> {
        self.blobs.put(hash.blob_key(), data.clone()).await?;
        debug!(hash = %hash, size = data.len(), "staged new blob");

        let thumbnail_key = match self.thumbnails.generate(data, filename) {
            Some(thumb) => {
                let key = hash.thumbnail_key();
                match self.blobs.put(&key, thumb).await {
                    Ok(()) => Some(key),
                    Err(e) => {
                        // Thumbnails are best-effort derived data; the upload
                        // proceeds without one.
                        warn!(hash = %hash, error = %e, "thumbnail upload failed");
                        None
                    }
                }
            }
            None => None,
        };

        Ok(StagedUpload { thumbnail_key })
    }

    /// Acquires a reference on the content entry for `hash` inside `tx`.
    ///
    /// Increments the refcount of an existing entry (the dedup win: no bytes
    /// are re-uploaded), or creates the entry with refcount 1 from blobs
    /// staged by [`Self::stage`]. Returns `None` when the entry is absent and
    /// nothing was staged; the caller must stage and retry.
    pub fn acquire(
        &self,
        tx: &mut MetaTx<'_>,
        hash: &ContentHash,
        size: u64,
        staged: Option<&StagedUpload>,
    ) -> Result<Option<ContentEntry>, MetaError> {
        if let Some(entry) = tx.incref_content(hash.as_str())? {
            debug!(hash = %hash, ref_count = entry.ref_count, "content reference acquired");
            self.metrics.content_deduplicated();
            return Ok(Some(entry));
        }

        let Some(staged) = staged else {
            return Ok(None);
        };

        let entry = ContentEntry::new(
            hash.as_str().to_string(),
            size,
            staged.thumbnail_key.clone(),
        );
        tx.put_content(&entry)?;
        debug!(hash = %hash, size = size, "content entry created");
        self.metrics.content_created();
        Ok(Some(entry))
    }

    /// Releases one reference inside `tx`, returning the updated entry. The
    /// caller purges the blobs and removes the record when the count reaches
    /// zero (see [`Self::purge`]).
    pub fn release(&self, tx: &mut MetaTx<'_>, hash: &ContentHash) -> Result<ContentEntry, MetaError> {
        let entry = tx.decref_content(hash.as_str())?;
        debug!(hash = %hash, ref_count = entry.ref_count, "content reference released");
        self.metrics.content_released();
        Ok(entry)
    }

    /// Deletes the payload and thumbnail blobs of an entry whose last
    /// reference is being released. Must run under the hash lock and before
    /// the transaction that removes the record, so a commit never claims a
    /// purge that did not happen.
    pub async fn purge(&self, entry: &ContentEntry) -> Result<(), BlobError> {
        self.blobs.delete(&entry.blob_key).await?;
        if let Some(ref thumb_key) = entry.thumbnail_key {
            self.blobs.delete(thumb_key).await?;
        }
        debug!(hash = %entry.hash, "content blobs purged");
        self.metrics.content_purged();
        Ok(())
    }

    /// Best-effort removal of blobs staged for a transaction that aborted
    /// before creating their content entry. Failures leave an orphan blob
    /// (no metadata references it) and are only logged.
    pub async fn discard_staged(&self, hash: &ContentHash, staged: &StagedUpload) {
        if let Err(e) = self.blobs.delete(hash.blob_key()).await {
            warn!(hash = %hash, error = %e, "failed to remove staged blob after rollback");
        }
        if let Some(ref thumb_key) = staged.thumbnail_key {
            if let Err(e) = self.blobs.delete(thumb_key).await {
                warn!(hash = %hash, error = %e, "failed to remove staged thumbnail after rollback");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_lowercase_hex_sha256() {
        let hash = ContentHash::of(b"hello world");
        assert_eq!(
            hash.as_str(),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
        assert_eq!(hash.blob_key(), hash.as_str());
        assert_eq!(
            hash.thumbnail_key(),
            format!("thumb_{}.jpg", hash.as_str())
        );
    }

    #[tokio::test]
    async fn same_hash_lock_is_exclusive() {
        let locks = HashLocks::default();
        let hash = ContentHash::of(b"data");

        let guard = locks.lock(&hash).await;
        let other = ContentHash::of(b"data");
        let contended =
            tokio::time::timeout(std::time::Duration::from_millis(50), locks.lock(&other)).await;
        assert!(contended.is_err());
        drop(guard);

        // Released lock can be taken again.
        let _guard = locks.lock(&hash).await;
    }

    #[tokio::test]
    async fn lock_pair_dedupes_equal_hashes() {
        let locks = HashLocks::default();
        let hash = ContentHash::of(b"data");
        let (_a, b) = locks.lock_pair(&hash, Some(&hash.clone())).await;
        assert!(b.is_none());
    }

    #[tokio::test]
    async fn lock_pair_orders_consistently() {
        let locks = Arc::new(HashLocks::default());
        let a = ContentHash::of(b"first");
        let b = ContentHash::of(b"second");

        // Opposite argument orders must not deadlock.
        let l1 = {
            let locks = locks.clone();
            let (a, b) = (a.clone(), b.clone());
            tokio::spawn(async move {
                for _ in 0..100 {
                    let _g = locks.lock_pair(&a, Some(&b)).await;
                }
            })
        };
        let l2 = {
            let locks = locks.clone();
            tokio::spawn(async move {
                for _ in 0..100 {
                    let _g = locks.lock_pair(&b, Some(&a)).await;
                }
            })
        };

        l1.await.unwrap();
        l2.await.unwrap();
    }
}
