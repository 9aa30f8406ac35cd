//! User file catalog: the per-user (folder, name) namespace over the content
//! store, with quota accounting folded into the same metadata transaction as
//! every binding change.
//!
//! Operation ordering against the blob store follows one rule: metadata only
//! commits after the blob operations it depends on have succeeded. A first
//! upload stages its blob before the entry commits; releasing a sole
//! reference deletes the blobs before the record removal commits. Every blob
//! failure therefore surfaces as [`CatalogError::Storage`] with zero metadata
//! mutated, never as a partially-applied state.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::blobstore::{BlobError, BlobStore};
use crate::cas::{ContentHash, ContentStore, StagedUpload};
use crate::metastore::{
    unix_now, CatalogEntry, ContentEntry, FolderNode, MetaDb, MetaError, QuotaAccount,
};
use crate::metrics::SharedMetrics;
use crate::thumbnail::ThumbnailGenerator;

/// Attempts before giving up on an upload/delete that keeps losing binding
/// revalidation races.
const MAX_BIND_ATTEMPTS: usize = 5;

const MAX_NAME_LEN: usize = 255;

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("storage quota exceeded")]
    QuotaExceeded,

    #[error("file not found")]
    NotFound,

    #[error("folder not found")]
    FolderNotFound,

    #[error("a folder with this name already exists here")]
    FolderExists,

    #[error("invalid name: {0}")]
    InvalidName(String),

    #[error("blob store operation failed during {op}: {source}")]
    Storage {
        op: &'static str,
        #[source]
        source: BlobError,
    },

    #[error("conflicting concurrent update, try again")]
    Conflict,

    #[error(transparent)]
    Meta(#[from] MetaError),
}

/// Requested ordering for folder listings. Invalid or missing values fall
/// back to ascending name order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ListOrdering {
    #[default]
    NameAsc,
    NameDesc,
    CreatedAsc,
    CreatedDesc,
    SizeAsc,
    SizeDesc,
}

impl ListOrdering {
    pub fn parse(s: Option<&str>) -> Self {
        match s {
            Some("name") => Self::NameAsc,
            Some("-name") => Self::NameDesc,
            Some("created_at") => Self::CreatedAsc,
            Some("-created_at") => Self::CreatedDesc,
            Some("size") => Self::SizeAsc,
            Some("-size") => Self::SizeDesc,
            _ => Self::NameAsc,
        }
    }
}

/// Listing filters: optional case-insensitive name substring and ordering.
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub name: Option<String>,
    pub ordering: ListOrdering,
}

/// A catalog entry joined with the size of its bound content.
#[derive(Debug, Clone)]
pub struct FileItem {
    pub file: CatalogEntry,
    pub size: u64,
}

#[derive(Debug)]
pub struct FolderListing {
    pub files: Vec<FileItem>,
    pub folders: Vec<FolderNode>,
    pub storage_used: u64,
    pub storage_limit: u64,
}

#[derive(Debug, Clone)]
pub struct DownloadInfo {
    pub download_url: String,
    pub filename: String,
    pub size: u64,
}

/// The user file catalog.
pub struct FileCatalog {
    db: Arc<MetaDb>,
    content: ContentStore,
    metrics: SharedMetrics,
    url_ttl: Duration,
}

impl std::fmt::Debug for FileCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileCatalog").field("db", &self.db).finish()
    }
}

impl FileCatalog {
    pub fn new(
        db: Arc<MetaDb>,
        blobs: Arc<dyn BlobStore>,
        thumbnails: Arc<dyn ThumbnailGenerator>,
        metrics: SharedMetrics,
        url_ttl: Duration,
    ) -> Self {
        Self {
            content: ContentStore::new(blobs, thumbnails, metrics.clone()),
            db,
            metrics,
            url_ttl,
        }
    }

    pub fn db(&self) -> &Arc<MetaDb> {
        &self.db
    }

    /// Stores an upload under (user, folder, name).
    ///
    /// Binds a new catalog entry, or rebinds the active entry already holding
    /// that name. Identical content is deduplicated: the payload is only
    /// uploaded when its hash has no content entry yet.
    pub async fn upload(
        &self,
        user_id: &str,
        folder_id: Option<&str>,
        name: &str,
        data: Bytes,
    ) -> Result<FileItem, CatalogError> {
        validate_name(name)?;
        let size = data.len() as u64;
        let hash = ContentHash::of(&data);
        self.metrics.bytes_received(data.len());

        if let Some(fid) = folder_id {
            match self.db.get_folder(fid)? {
                Some(f) if f.user_id == user_id => {}
                _ => return Err(CatalogError::FolderNotFound),
            }
        }

        // Quota pre-check, before any content store mutation. The requested
        // size counts in full against the remaining limit even when a rebind
        // would free the old content.
        let quota = self.quota_account(user_id)?;
        if quota.used_bytes + size > quota.limit_bytes {
            debug!(
                user_id = %user_id,
                used = quota.used_bytes,
                limit = quota.limit_bytes,
                size = size,
                "upload rejected: quota exceeded"
            );
            return Err(CatalogError::QuotaExceeded);
        }

        for _attempt in 0..MAX_BIND_ATTEMPTS {
            // Candidate current binding; revalidated once the hash locks are
            // held, since only those locks pin it down.
            let old_hash = match self.active_file(user_id, folder_id, name)? {
                Some(file) => Some(ContentHash::from_stored(file.content_hash)),
                None => None,
            };

            let _guards = self.content.locks().lock_pair(&hash, old_hash.as_ref()).await;

            // Revalidate: any mutation of this binding must hold the lock of
            // the content it currently points at, so a match means the
            // binding is stable until we commit.
            let old_file = self.active_file(user_id, folder_id, name)?;
            let current_hash = old_file
                .as_ref()
                .map(|f| ContentHash::from_stored(f.content_hash.clone()));
            if current_hash != old_hash {
                continue;
            }

            match (old_file, old_hash) {
                (Some(file), Some(old)) if old == hash => return self.touch_same_content(file),
                (Some(file), Some(old)) => {
                    return self.rebind(user_id, file, &old, &hash, size, &data, name).await
                }
                (None, None) => {
                    match self.bind_fresh(user_id, folder_id, name, &hash, size, &data).await? {
                        Some(item) => return Ok(item),
                        // A concurrent first upload bound this path under a
                        // different hash lock; retry against the new binding.
                        None => continue,
                    }
                }
                // active_file and old_hash are derived from the same read.
                _ => unreachable!("binding and hash candidate diverged"),
            }
        }

        warn!(user_id = %user_id, name = %name, "upload exceeded bind retry budget");
        Err(CatalogError::Conflict)
    }

    /// Re-upload of identical content under an existing name: the acquire on
    /// the new entry and the release of the old one cancel out, so neither
    /// refcount nor quota moves. Only the entry's timestamp is touched.
    fn touch_same_content(&self, file: CatalogEntry) -> Result<FileItem, CatalogError> {
        let size = self
            .db
            .get_content(&file.content_hash)?
            .map(|c| c.size)
            .unwrap_or(0);

        let mut tx = self.db.begin();
        let mut entry = tx
            .get_file(&file.id)?
            .ok_or_else(|| MetaError::MissingRecord(format!("catalog entry {}", file.id)))?;
        entry.updated_at = unix_now();
        tx.put_file(&entry)?;
        tx.commit()?;

        debug!(file_id = %entry.id, "same-content re-upload, nothing to do");
        Ok(FileItem { file: entry, size })
    }

    /// First binding of (user, folder, name). Caller holds the hash lock.
    /// Returns `None` when a concurrent upload claimed the path first; the
    /// caller retries against the new binding.
    async fn bind_fresh(
        &self,
        user_id: &str,
        folder_id: Option<&str>,
        name: &str,
        hash: &ContentHash,
        size: u64,
        data: &Bytes,
    ) -> Result<Option<FileItem>, CatalogError> {
        let staged = self.stage_if_new(hash, data, name).await?;

        match self.bind_fresh_tx(user_id, folder_id, name, hash, size, staged.as_ref()) {
            Ok(Some(entry)) => Ok(Some(FileItem { file: entry, size })),
            Ok(None) => {
                if let Some(ref staged) = staged {
                    self.content.discard_staged(hash, staged).await;
                }
                Ok(None)
            }
            Err(e) => {
                if let Some(ref staged) = staged {
                    self.content.discard_staged(hash, staged).await;
                }
                Err(e)
            }
        }
    }

    /// Transaction section of a fresh bind. Sync so the single-writer
    /// transaction is never held across an await point.
    fn bind_fresh_tx(
        &self,
        user_id: &str,
        folder_id: Option<&str>,
        name: &str,
        hash: &ContentHash,
        size: u64,
        staged: Option<&StagedUpload>,
    ) -> Result<Option<CatalogEntry>, CatalogError> {
        let mut tx = self.db.begin();

        // The hash locks only pin down bindings pointing at locked content.
        // Two first uploads of different content to the same path hold
        // disjoint locks, so the path must be re-checked here.
        if tx.active_binding(user_id, folder_id, name)?.is_some() {
            tx.rollback();
            debug!(user_id = %user_id, name = %name, "path bound concurrently, retrying");
            return Ok(None);
        }

        let Some(content) = self.content.acquire(&mut tx, hash, size, staged)? else {
            // Cannot happen under the hash lock; bail out cleanly anyway.
            tx.rollback();
            return Err(CatalogError::Conflict);
        };

        // Authoritative quota reservation; the pre-check ran outside the
        // transaction and may have raced another reservation.
        if !tx.quota_reserve(user_id, size)? {
            tx.rollback();
            self.metrics.operation_rolled_back();
            return Err(CatalogError::QuotaExceeded);
        }

        let entry = CatalogEntry::new(
            user_id.to_string(),
            folder_id.map(String::from),
            name.to_string(),
            hash.as_str().to_string(),
        );
        tx.put_file(&entry)?;
        tx.bind_path(&entry);
        tx.commit()?;

        info!(
            user_id = %user_id,
            file_id = %entry.id,
            hash = %hash,
            size = size,
            ref_count = content.ref_count,
            "file bound"
        );
        Ok(Some(entry))
    }

    /// Rebinds an active entry to different content. Caller holds both hash
    /// locks. The old reference is released symmetrically with the new
    /// acquire, in the same transaction; if the old entry loses its last
    /// reference its blobs are deleted before that transaction commits.
    async fn rebind(
        &self,
        user_id: &str,
        file: CatalogEntry,
        old_hash: &ContentHash,
        hash: &ContentHash,
        size: u64,
        data: &Bytes,
        name: &str,
    ) -> Result<FileItem, CatalogError> {
        let old_content = self
            .db
            .get_content(old_hash.as_str())?
            .ok_or_else(|| MetaError::MissingRecord(format!("content entry {}", old_hash)))?;

        let staged = self.stage_if_new(hash, data, name).await?;

        // Net growth is reserved up front in its own transaction: once the
        // old blobs are purged the rebind can no longer be rejected, so the
        // limit check has to settle before anything irreversible happens.
        let growth = size.saturating_sub(old_content.size);
        if growth > 0 {
            match self.reserve_quota(user_id, growth) {
                Ok(true) => {}
                Ok(false) => {
                    self.metrics.operation_rolled_back();
                    if let Some(ref staged) = staged {
                        self.content.discard_staged(hash, staged).await;
                    }
                    return Err(CatalogError::QuotaExceeded);
                }
                Err(e) => {
                    if let Some(ref staged) = staged {
                        self.content.discard_staged(hash, staged).await;
                    }
                    return Err(e);
                }
            }
        }

        // Sole reference: the old blobs must be gone before the commit that
        // drops the record. A failed delete rejects the whole rebind with
        // nothing mutated; the previous binding, refcount and quota all
        // still stand.
        if old_content.ref_count == 1 {
            if let Err(e) = self.content.purge(&old_content).await {
                warn!(
                    user_id = %user_id,
                    file_id = %file.id,
                    old_hash = %old_hash,
                    error = %e,
                    "rebind rejected: purging previous content failed"
                );
                self.metrics.operation_rolled_back();
                if growth > 0 {
                    self.release_quota(user_id, growth);
                }
                if let Some(ref staged) = staged {
                    self.content.discard_staged(hash, staged).await;
                }
                return Err(CatalogError::Storage {
                    op: "delete blob",
                    source: e,
                });
            }
        }

        match self.rebind_tx(user_id, &file.id, &old_content, hash, size, staged.as_ref()) {
            Ok(entry) => {
                info!(
                    user_id = %user_id,
                    file_id = %entry.id,
                    old_hash = %old_hash,
                    new_hash = %hash,
                    "file rebound"
                );
                Ok(FileItem { file: entry, size })
            }
            Err(e) => {
                if growth > 0 {
                    self.release_quota(user_id, growth);
                }
                if let Some(ref staged) = staged {
                    self.content.discard_staged(hash, staged).await;
                }
                Err(e)
            }
        }
    }

    /// Transaction section of a rebind. Sync so the single-writer transaction
    /// is never held across an await point. Growth was already reserved;
    /// shrinking rebinds return the size difference here.
    fn rebind_tx(
        &self,
        user_id: &str,
        file_id: &str,
        old_content: &ContentEntry,
        hash: &ContentHash,
        size: u64,
        staged: Option<&StagedUpload>,
    ) -> Result<CatalogEntry, CatalogError> {
        let mut tx = self.db.begin();
        if self.content.acquire(&mut tx, hash, size, staged)?.is_none() {
            tx.rollback();
            return Err(CatalogError::Conflict);
        }

        let mut entry = tx
            .get_file(file_id)?
            .ok_or_else(|| MetaError::MissingRecord(format!("catalog entry {}", file_id)))?;
        entry.content_hash = hash.as_str().to_string();
        entry.updated_at = unix_now();
        tx.put_file(&entry)?;

        if old_content.ref_count == 1 {
            tx.delete_content(&old_content.hash);
            self.metrics.content_released();
        } else {
            let old = ContentHash::from_stored(old_content.hash.clone());
            self.content.release(&mut tx, &old)?;
        }

        if size < old_content.size {
            tx.quota_release(user_id, old_content.size - size)?;
        }

        tx.commit()?;
        Ok(entry)
    }

    /// Reserves `delta` bytes in a dedicated transaction. Returns `false`
    /// when the reservation would exceed the user's limit.
    fn reserve_quota(&self, user_id: &str, delta: u64) -> Result<bool, CatalogError> {
        let mut tx = self.db.begin();
        if !tx.quota_reserve(user_id, delta)? {
            tx.rollback();
            return Ok(false);
        }
        tx.commit()?;
        Ok(true)
    }

    /// Compensating release of a prior reservation. A failure leaves the
    /// account over-counted and is logged.
    fn release_quota(&self, user_id: &str, delta: u64) {
        let mut tx = self.db.begin();
        match tx.quota_release(user_id, delta) {
            Ok(()) => {
                if let Err(e) = tx.commit() {
                    warn!(user_id = %user_id, delta = delta, error = %e, "failed to return reserved quota");
                }
            }
            Err(e) => {
                tx.rollback();
                warn!(user_id = %user_id, delta = delta, error = %e, "failed to return reserved quota");
            }
        }
    }

    /// Stages the payload when its hash has no content entry yet. A put
    /// failure surfaces as a storage error with no state mutated anywhere.
    async fn stage_if_new(
        &self,
        hash: &ContentHash,
        data: &Bytes,
        name: &str,
    ) -> Result<Option<StagedUpload>, CatalogError> {
        if self.db.get_content(hash.as_str())?.is_some() {
            return Ok(None);
        }
        match self.content.stage(hash, data, name).await {
            Ok(staged) => Ok(Some(staged)),
            Err(e) => {
                warn!(hash = %hash, error = %e, "blob upload failed");
                Err(CatalogError::Storage {
                    op: "upload blob",
                    source: e,
                })
            }
        }
    }

    /// Logical delete: soft-deletes the catalog entry and releases its
    /// content reference. When the release would purge the content, the
    /// blobs are deleted before any metadata commits; a failed delete leaves
    /// the file active and downloadable, refcount and quota untouched.
    pub async fn delete(&self, user_id: &str, file_id: &str) -> Result<(), CatalogError> {
        for _attempt in 0..MAX_BIND_ATTEMPTS {
            let file = match self.db.get_file(file_id)? {
                Some(f) if f.user_id == user_id && !f.is_deleted => f,
                _ => return Err(CatalogError::NotFound),
            };
            let hash = ContentHash::from_stored(file.content_hash.clone());

            let _guard = self.content.locks().lock(&hash).await;

            // A concurrent rebind may have switched the content under us
            // before the lock was taken; retry against the new hash.
            let current = match self.db.get_file(file_id)? {
                Some(f) if f.user_id == user_id && !f.is_deleted => f,
                _ => return Err(CatalogError::NotFound),
            };
            if current.content_hash != hash.as_str() {
                continue;
            }

            let content = self
                .db
                .get_content(hash.as_str())?
                .ok_or_else(|| MetaError::MissingRecord(format!("content entry {}", hash)))?;

            let purge = content.ref_count == 1;
            if purge {
                if let Err(e) = self.content.purge(&content).await {
                    warn!(
                        user_id = %user_id,
                        file_id = %file_id,
                        hash = %hash,
                        error = %e,
                        "delete rejected: purging content failed, file stays active"
                    );
                    self.metrics.operation_rolled_back();
                    return Err(CatalogError::Storage {
                        op: "delete blob",
                        source: e,
                    });
                }
            }

            self.delete_tx(user_id, file_id, &content, purge)?;

            info!(
                user_id = %user_id,
                file_id = %file_id,
                hash = %hash,
                purged = purge,
                "file deleted"
            );
            return Ok(());
        }

        warn!(user_id = %user_id, file_id = %file_id, "delete exceeded retry budget");
        Err(CatalogError::Conflict)
    }

    /// Transaction section of a delete. Sync so the single-writer transaction
    /// is never held across an await point.
    fn delete_tx(
        &self,
        user_id: &str,
        file_id: &str,
        content: &ContentEntry,
        purge: bool,
    ) -> Result<(), CatalogError> {
        let mut tx = self.db.begin();
        let mut entry = tx
            .get_file(file_id)?
            .ok_or_else(|| MetaError::MissingRecord(format!("catalog entry {}", file_id)))?;
        entry.is_deleted = true;
        entry.updated_at = unix_now();
        tx.put_file(&entry)?;
        tx.unbind_path(&entry);
        tx.quota_release(user_id, content.size)?;

        if purge {
            tx.delete_content(&content.hash);
            self.metrics.content_released();
        } else {
            let hash = ContentHash::from_stored(content.hash.clone());
            self.content.release(&mut tx, &hash)?;
        }

        tx.commit()?;
        Ok(())
    }

    /// Issues a time-limited download URL for an active file.
    pub async fn download_url(
        &self,
        user_id: &str,
        file_id: &str,
    ) -> Result<DownloadInfo, CatalogError> {
        let file = match self.db.get_file(file_id)? {
            Some(f) if f.user_id == user_id && !f.is_deleted => f,
            _ => return Err(CatalogError::NotFound),
        };
        let content = self
            .db
            .get_content(&file.content_hash)?
            .ok_or_else(|| MetaError::MissingRecord(format!("content entry {}", file.content_hash)))?;

        let url = self
            .content
            .blob_store()
            .presigned_url(&content.blob_key, self.url_ttl)
            .await
            .map_err(|e| CatalogError::Storage {
                op: "presign URL",
                source: e,
            })?;

        debug!(user_id = %user_id, file_id = %file_id, "download URL issued");
        Ok(DownloadInfo {
            download_url: url,
            filename: file.name,
            size: content.size,
        })
    }

    /// Lists the active files and subfolders of a folder (`None` = root).
    pub fn list(
        &self,
        user_id: &str,
        folder_id: Option<&str>,
        filter: &ListFilter,
    ) -> Result<FolderListing, CatalogError> {
        if let Some(fid) = folder_id {
            match self.db.get_folder(fid)? {
                Some(f) if f.user_id == user_id => {}
                _ => return Err(CatalogError::FolderNotFound),
            }
        }

        let mut files = Vec::new();
        for entry in self.db.list_files(user_id, folder_id)? {
            let size = match self.db.get_content(&entry.content_hash)? {
                Some(content) => content.size,
                None => {
                    warn!(file_id = %entry.id, "active file without content entry");
                    0
                }
            };
            files.push(FileItem { file: entry, size });
        }
        let mut folders = self.db.list_folders(user_id, folder_id)?;

        if let Some(ref needle) = filter.name {
            let needle = needle.to_lowercase();
            files.retain(|f| f.file.name.to_lowercase().contains(&needle));
            folders.retain(|f| f.name.to_lowercase().contains(&needle));
        }

        // Path-index iteration already yields name order; the other orderings
        // sort in memory. Folders have no size, so size orderings keep them
        // name-sorted.
        match filter.ordering {
            ListOrdering::NameAsc => {}
            ListOrdering::NameDesc => {
                files.reverse();
                folders.reverse();
            }
            ListOrdering::CreatedAsc => {
                files.sort_by_key(|f| f.file.created_at);
                folders.sort_by_key(|f| f.created_at);
            }
            ListOrdering::CreatedDesc => {
                files.sort_by_key(|f| std::cmp::Reverse(f.file.created_at));
                folders.sort_by_key(|f| std::cmp::Reverse(f.created_at));
            }
            ListOrdering::SizeAsc => files.sort_by_key(|f| f.size),
            ListOrdering::SizeDesc => files.sort_by_key(|f| std::cmp::Reverse(f.size)),
        }

        let quota = self.quota_account(user_id)?;
        Ok(FolderListing {
            files,
            folders,
            storage_used: quota.used_bytes,
            storage_limit: quota.limit_bytes,
        })
    }

    /// Creates a folder under `parent_id` (`None` = root).
    pub fn create_folder(
        &self,
        user_id: &str,
        name: &str,
        parent_id: Option<&str>,
    ) -> Result<FolderNode, CatalogError> {
        validate_name(name)?;

        if let Some(pid) = parent_id {
            match self.db.get_folder(pid)? {
                Some(f) if f.user_id == user_id => {}
                _ => return Err(CatalogError::FolderNotFound),
            }
        }

        let folder = FolderNode::new(
            user_id.to_string(),
            name.to_string(),
            parent_id.map(String::from),
        );

        let mut tx = self.db.begin();
        if tx.folder_path_taken(user_id, parent_id, name)? {
            tx.rollback();
            return Err(CatalogError::FolderExists);
        }
        tx.put_folder(&folder)?;
        tx.commit()?;

        info!(user_id = %user_id, folder_id = %folder.id, name = %name, "folder created");
        Ok(folder)
    }

    fn quota_account(&self, user_id: &str) -> Result<QuotaAccount, CatalogError> {
        self.db
            .get_quota(user_id)?
            .ok_or_else(|| {
                CatalogError::Meta(MetaError::MissingRecord(format!(
                    "quota account for {}",
                    user_id
                )))
            })
    }

    /// The active catalog entry currently bound at (user, folder, name).
    fn active_file(
        &self,
        user_id: &str,
        folder_id: Option<&str>,
        name: &str,
    ) -> Result<Option<CatalogEntry>, CatalogError> {
        let Some(file_id) = self.db.active_binding(user_id, folder_id, name)? else {
            return Ok(None);
        };
        match self.db.get_file(&file_id)? {
            Some(f) if !f.is_deleted => Ok(Some(f)),
            _ => {
                warn!(file_id = %file_id, "path index points at inactive entry");
                Ok(None)
            }
        }
    }
}

fn validate_name(name: &str) -> Result<(), CatalogError> {
    if name.is_empty() {
        return Err(CatalogError::InvalidName("name must not be empty".into()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(CatalogError::InvalidName(format!(
            "name longer than {} bytes",
            MAX_NAME_LEN
        )));
    }
    if name.contains('\0') {
        return Err(CatalogError::InvalidName(
            "name must not contain NUL".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests;
