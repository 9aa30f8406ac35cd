use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use super::*;
use crate::blobstore::{BlobError, BlobStore, MemBlobStore};
use crate::metastore::{Durability, MetaDb, QuotaAccount};
use crate::metrics::{MetricsCollector, SharedMetrics};
use crate::thumbnail::{NoThumbnails, ThumbnailGenerator};

/// Blob store wrapper with switchable failure injection.
#[derive(Debug, Default)]
struct FlakyBlobStore {
    inner: MemBlobStore,
    fail_puts: AtomicBool,
    fail_deletes: AtomicBool,
    fail_delete_key: Mutex<Option<String>>,
}

impl FlakyBlobStore {
    fn fail_puts(&self, on: bool) {
        self.fail_puts.store(on, Ordering::SeqCst);
    }

    fn fail_deletes(&self, on: bool) {
        self.fail_deletes.store(on, Ordering::SeqCst);
    }

    /// Fails deletes of one specific key only.
    fn fail_delete_of(&self, key: &str) {
        *self.fail_delete_key.lock().unwrap() = Some(key.to_string());
    }
}

#[async_trait]
impl BlobStore for FlakyBlobStore {
    async fn put(&self, key: &str, data: Bytes) -> Result<(), BlobError> {
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(BlobError::Unavailable("injected put failure".into()));
        }
        self.inner.put(key, data).await
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, BlobError> {
        self.inner.get(key).await
    }

    async fn delete(&self, key: &str) -> Result<(), BlobError> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(BlobError::Unavailable("injected delete failure".into()));
        }
        if self.fail_delete_key.lock().unwrap().as_deref() == Some(key) {
            return Err(BlobError::Unavailable("injected delete failure".into()));
        }
        self.inner.delete(key).await
    }

    async fn presigned_url(&self, key: &str, ttl: Duration) -> Result<String, BlobError> {
        self.inner.presigned_url(key, ttl).await
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    db: Arc<MetaDb>,
    blobs: Arc<FlakyBlobStore>,
    catalog: FileCatalog,
}

fn setup() -> Harness {
    setup_with(Arc::new(NoThumbnails))
}

fn setup_with(thumbnails: Arc<dyn ThumbnailGenerator>) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let db = Arc::new(MetaDb::open(dir.path().join("meta"), Durability::Buffer).unwrap());
    let blobs = Arc::new(FlakyBlobStore::default());
    let catalog = FileCatalog::new(
        db.clone(),
        blobs.clone(),
        thumbnails,
        SharedMetrics::default(),
        Duration::from_secs(3600),
    );
    Harness {
        _dir: dir,
        db,
        blobs,
        catalog,
    }
}

impl Harness {
    fn add_user(&self, user_id: &str, limit: u64) {
        let mut tx = self.db.begin();
        tx.put_quota(&QuotaAccount::new(user_id.to_string(), limit))
            .unwrap();
        tx.commit().unwrap();
    }

    fn used(&self, user_id: &str) -> u64 {
        self.db.get_quota(user_id).unwrap().unwrap().used_bytes
    }

    fn refcount(&self, data: &[u8]) -> Option<u64> {
        self.db
            .get_content(ContentHash::of(data).as_str())
            .unwrap()
            .map(|c| c.ref_count)
    }
}

#[tokio::test]
async fn upload_stores_blob_and_reserves_quota() {
    let h = setup();
    h.add_user("alice", 1000);

    let item = h
        .catalog
        .upload("alice", None, "a.txt", Bytes::from_static(b"hello"))
        .await
        .unwrap();
    assert_eq!(item.size, 5);
    assert_eq!(item.file.name, "a.txt");
    assert_eq!(h.used("alice"), 5);
    assert_eq!(h.refcount(b"hello"), Some(1));
    assert!(h.blobs.inner.contains(ContentHash::of(b"hello").as_str()));

    let info = h.catalog.download_url("alice", &item.file.id).await.unwrap();
    assert_eq!(info.filename, "a.txt");
    assert_eq!(info.size, 5);
    assert!(info.download_url.contains(ContentHash::of(b"hello").as_str()));
}

#[tokio::test]
async fn identical_content_is_stored_once() {
    let h = setup();
    h.add_user("alice", 1000);

    h.catalog
        .upload("alice", None, "a.txt", Bytes::from_static(b"same"))
        .await
        .unwrap();
    h.catalog
        .upload("alice", None, "b.txt", Bytes::from_static(b"same"))
        .await
        .unwrap();

    // One blob upload, two references.
    assert_eq!(h.blobs.inner.put_count(), 1);
    assert_eq!(h.refcount(b"same"), Some(2));
    // Both names count against the quota in full.
    assert_eq!(h.used("alice"), 8);
}

#[tokio::test]
async fn dedup_spans_users_quota_does_not() {
    let h = setup();
    h.add_user("alice", 1000);
    h.add_user("bob", 1000);

    h.catalog
        .upload("alice", None, "a.txt", Bytes::from_static(b"shared"))
        .await
        .unwrap();
    h.catalog
        .upload("bob", None, "mine.txt", Bytes::from_static(b"shared"))
        .await
        .unwrap();

    assert_eq!(h.blobs.inner.put_count(), 1);
    assert_eq!(h.refcount(b"shared"), Some(2));
    assert_eq!(h.used("alice"), 6);
    assert_eq!(h.used("bob"), 6);
}

#[tokio::test]
async fn quota_rejects_upload_exceeding_limit() {
    let h = setup();
    h.add_user("alice", 100);

    let first = h
        .catalog
        .upload("alice", None, "a.bin", Bytes::from(vec![1u8; 60]))
        .await
        .unwrap();
    assert_eq!(h.used("alice"), 60);

    let err = h
        .catalog
        .upload("alice", None, "b.bin", Bytes::from(vec![2u8; 60]))
        .await
        .unwrap_err();
    assert!(matches!(err, CatalogError::QuotaExceeded));

    // Deduplicated content is no exception: the full size is checked before
    // the content store is consulted.
    let err = h
        .catalog
        .upload("alice", None, "c.bin", Bytes::from(vec![1u8; 60]))
        .await
        .unwrap_err();
    assert!(matches!(err, CatalogError::QuotaExceeded));
    assert_eq!(h.refcount(&vec![1u8; 60]), Some(1));
    assert_eq!(h.used("alice"), 60);

    // Deleting the first file frees the bytes and the upload fits.
    h.catalog.delete("alice", &first.file.id).await.unwrap();
    assert_eq!(h.used("alice"), 0);
    h.catalog
        .upload("alice", None, "b.bin", Bytes::from(vec![2u8; 60]))
        .await
        .unwrap();
    assert_eq!(h.used("alice"), 60);
}

#[tokio::test]
async fn delete_purges_sole_reference() {
    let h = setup();
    h.add_user("alice", 1000);

    let item = h
        .catalog
        .upload("alice", None, "a.txt", Bytes::from_static(b"bytes"))
        .await
        .unwrap();
    h.catalog.delete("alice", &item.file.id).await.unwrap();

    assert_eq!(h.refcount(b"bytes"), None);
    assert!(h.blobs.inner.is_empty());
    assert_eq!(h.used("alice"), 0);
    assert!(h.catalog.list("alice", None, &ListFilter::default()).unwrap().files.is_empty());

    // Soft-deleted: a second delete does not find the file.
    let err = h.catalog.delete("alice", &item.file.id).await.unwrap_err();
    assert!(matches!(err, CatalogError::NotFound));
}

#[tokio::test]
async fn delete_keeps_shared_content() {
    let h = setup();
    h.add_user("alice", 1000);

    let a = h
        .catalog
        .upload("alice", None, "a.txt", Bytes::from_static(b"shared"))
        .await
        .unwrap();
    let b = h
        .catalog
        .upload("alice", None, "b.txt", Bytes::from_static(b"shared"))
        .await
        .unwrap();

    h.catalog.delete("alice", &a.file.id).await.unwrap();
    assert_eq!(h.refcount(b"shared"), Some(1));
    assert!(h.blobs.inner.contains(ContentHash::of(b"shared").as_str()));
    assert_eq!(h.used("alice"), 6);

    h.catalog.delete("alice", &b.file.id).await.unwrap();
    assert_eq!(h.refcount(b"shared"), None);
    assert!(h.blobs.inner.is_empty());
    assert_eq!(h.used("alice"), 0);
}

#[tokio::test]
async fn failed_blob_delete_keeps_file_active() {
    let h = setup();
    h.add_user("alice", 1000);

    let item = h
        .catalog
        .upload("alice", None, "a.txt", Bytes::from_static(b"keep"))
        .await
        .unwrap();

    h.blobs.fail_deletes(true);
    let err = h.catalog.delete("alice", &item.file.id).await.unwrap_err();
    assert!(matches!(err, CatalogError::Storage { .. }));

    // Nothing moved: the file stays active and downloadable.
    assert_eq!(h.refcount(b"keep"), Some(1));
    assert_eq!(h.used("alice"), 4);
    assert!(h.blobs.inner.contains(ContentHash::of(b"keep").as_str()));
    h.catalog.download_url("alice", &item.file.id).await.unwrap();

    h.blobs.fail_deletes(false);
    h.catalog.delete("alice", &item.file.id).await.unwrap();
    assert_eq!(h.refcount(b"keep"), None);
    assert_eq!(h.used("alice"), 0);
}

#[tokio::test]
async fn failed_blob_put_leaves_no_metadata() {
    let h = setup();
    h.add_user("alice", 1000);

    h.blobs.fail_puts(true);
    let err = h
        .catalog
        .upload("alice", None, "a.txt", Bytes::from_static(b"lost"))
        .await
        .unwrap_err();
    assert!(matches!(err, CatalogError::Storage { .. }));

    assert_eq!(h.refcount(b"lost"), None);
    assert_eq!(h.used("alice"), 0);
    assert!(h
        .db
        .active_binding("alice", None, "a.txt")
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn reupload_same_name_rebinds_content() {
    let h = setup();
    h.add_user("alice", 1000);

    let first = h
        .catalog
        .upload("alice", None, "a.txt", Bytes::from_static(b"version one"))
        .await
        .unwrap();
    let second = h
        .catalog
        .upload("alice", None, "a.txt", Bytes::from_static(b"v2"))
        .await
        .unwrap();

    // Same catalog entry, new content; the orphaned old content is purged.
    assert_eq!(second.file.id, first.file.id);
    assert_eq!(h.refcount(b"version one"), None);
    assert!(!h.blobs.inner.contains(ContentHash::of(b"version one").as_str()));
    assert_eq!(h.refcount(b"v2"), Some(1));
    assert_eq!(h.used("alice"), 2);

    let listing = h.catalog.list("alice", None, &ListFilter::default()).unwrap();
    assert_eq!(listing.files.len(), 1);
    assert_eq!(listing.files[0].size, 2);
}

#[tokio::test]
async fn rebind_keeps_shared_old_content() {
    let h = setup();
    h.add_user("alice", 1000);

    h.catalog
        .upload("alice", None, "a.txt", Bytes::from_static(b"shared"))
        .await
        .unwrap();
    h.catalog
        .upload("alice", None, "b.txt", Bytes::from_static(b"shared"))
        .await
        .unwrap();

    h.catalog
        .upload("alice", None, "a.txt", Bytes::from_static(b"solo"))
        .await
        .unwrap();

    assert_eq!(h.refcount(b"shared"), Some(1));
    assert!(h.blobs.inner.contains(ContentHash::of(b"shared").as_str()));
    assert_eq!(h.refcount(b"solo"), Some(1));
    assert_eq!(h.used("alice"), 10);
}

#[tokio::test]
async fn same_content_reupload_is_noop() {
    let h = setup();
    h.add_user("alice", 1000);

    let first = h
        .catalog
        .upload("alice", None, "a.txt", Bytes::from_static(b"stable"))
        .await
        .unwrap();
    let second = h
        .catalog
        .upload("alice", None, "a.txt", Bytes::from_static(b"stable"))
        .await
        .unwrap();

    assert_eq!(second.file.id, first.file.id);
    assert_eq!(h.blobs.inner.put_count(), 1);
    assert_eq!(h.refcount(b"stable"), Some(1));
    assert_eq!(h.used("alice"), 6);
}

#[tokio::test]
async fn rebind_fails_when_old_purge_fails() {
    let h = setup();
    h.add_user("alice", 1000);

    let item = h
        .catalog
        .upload("alice", None, "a.txt", Bytes::from_static(b"pinned"))
        .await
        .unwrap();

    h.blobs
        .fail_delete_of(ContentHash::of(b"pinned").as_str());
    let err = h
        .catalog
        .upload("alice", None, "a.txt", Bytes::from_static(b"replacement"))
        .await
        .unwrap_err();
    assert!(matches!(err, CatalogError::Storage { .. }));

    // The old binding stands untouched.
    let file = h.db.get_file(&item.file.id).unwrap().unwrap();
    assert!(!file.is_deleted);
    assert_eq!(file.content_hash, ContentHash::of(b"pinned").as_str());
    assert_eq!(h.refcount(b"pinned"), Some(1));
    assert_eq!(h.refcount(b"replacement"), None);
    assert_eq!(h.used("alice"), 6);
}

#[derive(Debug)]
struct FixedThumbs;

impl ThumbnailGenerator for FixedThumbs {
    fn generate(&self, _data: &[u8], _filename: &str) -> Option<Bytes> {
        Some(Bytes::from_static(b"thumb"))
    }
}

#[tokio::test]
async fn purge_removes_thumbnail_blob() {
    let h = setup_with(Arc::new(FixedThumbs));
    h.add_user("alice", 1000);

    let item = h
        .catalog
        .upload("alice", None, "pic.jpg", Bytes::from_static(b"image"))
        .await
        .unwrap();

    let hash = ContentHash::of(b"image");
    assert!(h.blobs.inner.contains(hash.as_str()));
    assert!(h.blobs.inner.contains(&hash.thumbnail_key()));
    let content = h.db.get_content(hash.as_str()).unwrap().unwrap();
    assert_eq!(content.thumbnail_key.as_deref(), Some(hash.thumbnail_key().as_str()));

    h.catalog.delete("alice", &item.file.id).await.unwrap();
    assert!(h.blobs.inner.is_empty());
}

#[tokio::test]
async fn failed_thumbnail_delete_keeps_metadata_intact() {
    let h = setup_with(Arc::new(FixedThumbs));
    h.add_user("alice", 1000);

    let item = h
        .catalog
        .upload("alice", None, "pic.jpg", Bytes::from_static(b"image"))
        .await
        .unwrap();

    h.blobs
        .fail_delete_of(&ContentHash::of(b"image").thumbnail_key());
    let err = h.catalog.delete("alice", &item.file.id).await.unwrap_err();
    assert!(matches!(err, CatalogError::Storage { .. }));

    // The content record, refcount and quota are all unchanged.
    assert_eq!(h.refcount(b"image"), Some(1));
    assert_eq!(h.used("alice"), 5);
    let file = h.db.get_file(&item.file.id).unwrap().unwrap();
    assert!(!file.is_deleted);
}

#[tokio::test]
async fn list_filters_and_orders() {
    let h = setup();
    h.add_user("alice", 1000);

    h.catalog
        .upload("alice", None, "notes.txt", Bytes::from_static(b"abc"))
        .await
        .unwrap();
    h.catalog
        .upload("alice", None, "big.bin", Bytes::from_static(b"abcdefgh"))
        .await
        .unwrap();
    h.catalog
        .upload("alice", None, "tiny", Bytes::from_static(b"a"))
        .await
        .unwrap();
    h.catalog.create_folder("alice", "docs", None).unwrap();

    let listing = h.catalog.list("alice", None, &ListFilter::default()).unwrap();
    let names: Vec<_> = listing.files.iter().map(|f| f.file.name.as_str()).collect();
    assert_eq!(names, ["big.bin", "notes.txt", "tiny"]);
    assert_eq!(listing.folders.len(), 1);
    assert_eq!(listing.storage_used, 12);
    assert_eq!(listing.storage_limit, 1000);

    let filter = ListFilter {
        name: Some("NOTES".to_string()),
        ordering: ListOrdering::NameAsc,
    };
    let listing = h.catalog.list("alice", None, &filter).unwrap();
    assert_eq!(listing.files.len(), 1);
    assert_eq!(listing.files[0].file.name, "notes.txt");
    assert!(listing.folders.is_empty());

    let filter = ListFilter {
        name: None,
        ordering: ListOrdering::SizeDesc,
    };
    let listing = h.catalog.list("alice", None, &filter).unwrap();
    let sizes: Vec<_> = listing.files.iter().map(|f| f.size).collect();
    assert_eq!(sizes, [8, 3, 1]);

    let filter = ListFilter {
        name: None,
        ordering: ListOrdering::NameDesc,
    };
    let listing = h.catalog.list("alice", None, &filter).unwrap();
    let names: Vec<_> = listing.files.iter().map(|f| f.file.name.as_str()).collect();
    assert_eq!(names, ["tiny", "notes.txt", "big.bin"]);
}

#[tokio::test]
async fn listing_folder_scopes_entries() {
    let h = setup();
    h.add_user("alice", 1000);
    h.add_user("bob", 1000);

    let docs = h.catalog.create_folder("alice", "docs", None).unwrap();
    h.catalog
        .upload("alice", None, "root.txt", Bytes::from_static(b"r"))
        .await
        .unwrap();
    h.catalog
        .upload("alice", Some(&docs.id), "nested.txt", Bytes::from_static(b"n"))
        .await
        .unwrap();

    let root = h.catalog.list("alice", None, &ListFilter::default()).unwrap();
    assert_eq!(root.files.len(), 1);
    assert_eq!(root.files[0].file.name, "root.txt");
    assert_eq!(root.folders.len(), 1);

    let nested = h
        .catalog
        .list("alice", Some(&docs.id), &ListFilter::default())
        .unwrap();
    assert_eq!(nested.files.len(), 1);
    assert_eq!(nested.files[0].file.name, "nested.txt");
    assert!(nested.folders.is_empty());

    // The same name is free in a different folder.
    h.catalog
        .upload("alice", Some(&docs.id), "root.txt", Bytes::from_static(b"x"))
        .await
        .unwrap();

    let err = h
        .catalog
        .list("alice", Some("no-such-folder"), &ListFilter::default())
        .unwrap_err();
    assert!(matches!(err, CatalogError::FolderNotFound));

    // Folders are not visible across users.
    let err = h
        .catalog
        .list("bob", Some(&docs.id), &ListFilter::default())
        .unwrap_err();
    assert!(matches!(err, CatalogError::FolderNotFound));
}

#[tokio::test]
async fn folder_name_conflicts_rejected() {
    let h = setup();
    h.add_user("alice", 1000);

    let docs = h.catalog.create_folder("alice", "docs", None).unwrap();
    let err = h.catalog.create_folder("alice", "docs", None).unwrap_err();
    assert!(matches!(err, CatalogError::FolderExists));

    // Same name nested under another folder is fine.
    h.catalog
        .create_folder("alice", "docs", Some(&docs.id))
        .unwrap();

    let err = h
        .catalog
        .create_folder("alice", "sub", Some("no-such-folder"))
        .unwrap_err();
    assert!(matches!(err, CatalogError::FolderNotFound));
}

#[tokio::test]
async fn upload_into_missing_folder_fails() {
    let h = setup();
    h.add_user("alice", 1000);

    let err = h
        .catalog
        .upload("alice", Some("nope"), "a.txt", Bytes::from_static(b"x"))
        .await
        .unwrap_err();
    assert!(matches!(err, CatalogError::FolderNotFound));
    assert_eq!(h.used("alice"), 0);
}

#[tokio::test]
async fn invalid_names_rejected() {
    let h = setup();
    h.add_user("alice", 1000);

    for name in ["", "bad\0name", &"x".repeat(256)] {
        let err = h
            .catalog
            .upload("alice", None, name, Bytes::from_static(b"x"))
            .await
            .unwrap_err();
        assert!(matches!(err, CatalogError::InvalidName(_)), "{:?}", name);
    }
    let err = h.catalog.create_folder("alice", "", None).unwrap_err();
    assert!(matches!(err, CatalogError::InvalidName(_)));
}

#[tokio::test]
async fn files_are_scoped_to_their_owner() {
    let h = setup();
    h.add_user("alice", 1000);
    h.add_user("bob", 1000);

    let item = h
        .catalog
        .upload("alice", None, "a.txt", Bytes::from_static(b"private"))
        .await
        .unwrap();

    let err = h.catalog.delete("bob", &item.file.id).await.unwrap_err();
    assert!(matches!(err, CatalogError::NotFound));
    let err = h
        .catalog
        .download_url("bob", &item.file.id)
        .await
        .unwrap_err();
    assert!(matches!(err, CatalogError::NotFound));
}

#[tokio::test]
async fn concurrent_same_content_uploads_count_references() {
    let dir = tempfile::tempdir().unwrap();
    let db = Arc::new(MetaDb::open(dir.path().join("meta"), Durability::Buffer).unwrap());
    let blobs = Arc::new(MemBlobStore::new());
    let catalog = Arc::new(FileCatalog::new(
        db.clone(),
        blobs.clone(),
        Arc::new(NoThumbnails),
        SharedMetrics::default(),
        Duration::from_secs(3600),
    ));

    let users: Vec<String> = (0..8).map(|i| format!("user{}", i)).collect();
    for user in &users {
        let mut tx = db.begin();
        tx.put_quota(&QuotaAccount::new(user.clone(), 1000)).unwrap();
        tx.commit().unwrap();
    }

    let mut tasks = Vec::new();
    for user in users {
        let catalog = catalog.clone();
        tasks.push(tokio::spawn(async move {
            catalog
                .upload(&user, None, "same.bin", Bytes::from_static(b"popular"))
                .await
                .unwrap();
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    // Every upload after the first deduplicated against the staged blob.
    assert_eq!(blobs.put_count(), 1);
    let content = db
        .get_content(ContentHash::of(b"popular").as_str())
        .unwrap()
        .unwrap();
    assert_eq!(content.ref_count, 8);
}

/// Blob store that parks puts of one specific key until released, to pin
/// down interleavings between concurrent uploads.
#[derive(Debug)]
struct StallingBlobStore {
    inner: MemBlobStore,
    stall_key: Mutex<Option<String>>,
    released: tokio::sync::Notify,
}

impl StallingBlobStore {
    fn stalling(key: &str) -> Self {
        Self {
            inner: MemBlobStore::new(),
            stall_key: Mutex::new(Some(key.to_string())),
            released: tokio::sync::Notify::new(),
        }
    }

    fn release(&self) {
        *self.stall_key.lock().unwrap() = None;
        self.released.notify_waiters();
    }
}

#[async_trait]
impl BlobStore for StallingBlobStore {
    async fn put(&self, key: &str, data: Bytes) -> Result<(), BlobError> {
        loop {
            let wait = self.released.notified();
            if self.stall_key.lock().unwrap().as_deref() != Some(key) {
                break;
            }
            wait.await;
        }
        self.inner.put(key, data).await
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, BlobError> {
        self.inner.get(key).await
    }

    async fn delete(&self, key: &str) -> Result<(), BlobError> {
        self.inner.delete(key).await
    }

    async fn presigned_url(&self, key: &str, ttl: Duration) -> Result<String, BlobError> {
        self.inner.presigned_url(key, ttl).await
    }
}

#[tokio::test]
async fn concurrent_fresh_uploads_same_name_keep_one_binding() {
    let dir = tempfile::tempdir().unwrap();
    let db = Arc::new(MetaDb::open(dir.path().join("meta"), Durability::Buffer).unwrap());
    let blobs = Arc::new(StallingBlobStore::stalling(
        ContentHash::of(b"first writer").as_str(),
    ));
    let catalog = Arc::new(FileCatalog::new(
        db.clone(),
        blobs.clone(),
        Arc::new(NoThumbnails),
        SharedMetrics::default(),
        Duration::from_secs(3600),
    ));
    let mut tx = db.begin();
    tx.put_quota(&QuotaAccount::new("alice".to_string(), 1000))
        .unwrap();
    tx.commit().unwrap();

    // Writer A parks while staging its blob; writer B takes the same name
    // with different content in the meantime. Their content hashes differ,
    // so nothing but the path itself orders them.
    let a = {
        let catalog = catalog.clone();
        tokio::spawn(async move {
            catalog
                .upload("alice", None, "doc.txt", Bytes::from_static(b"first writer"))
                .await
                .unwrap()
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    let b = catalog
        .upload("alice", None, "doc.txt", Bytes::from_static(b"second"))
        .await
        .unwrap();

    blobs.release();
    let a = a.await.unwrap();

    // One active entry at the path: A saw B's binding and rebound it
    // instead of committing a duplicate.
    let listing = catalog.list("alice", None, &ListFilter::default()).unwrap();
    assert_eq!(listing.files.len(), 1);
    assert_eq!(a.file.id, b.file.id);

    let file = db.get_file(&a.file.id).unwrap().unwrap();
    assert_eq!(file.content_hash, ContentHash::of(b"first writer").as_str());
    assert_eq!(db.get_quota("alice").unwrap().unwrap().used_bytes, 12);

    // B's content lost its last reference and is fully gone.
    assert!(db
        .get_content(ContentHash::of(b"second").as_str())
        .unwrap()
        .is_none());
    assert!(!blobs.inner.contains(ContentHash::of(b"second").as_str()));
    assert!(blobs.inner.contains(ContentHash::of(b"first writer").as_str()));
}

#[tokio::test]
async fn growing_rebind_reserves_net_delta() {
    let h = setup();
    h.add_user("alice", 100);

    h.catalog
        .upload("alice", None, "a.bin", Bytes::from(vec![1u8; 40]))
        .await
        .unwrap();

    // 40 used + 60 requested fits the limit; the growth of 20 is reserved
    // before the old blob is purged, landing at 60 used.
    h.catalog
        .upload("alice", None, "a.bin", Bytes::from(vec![2u8; 60]))
        .await
        .unwrap();
    assert_eq!(h.used("alice"), 60);
    assert_eq!(h.refcount(&vec![1u8; 40]), None);
    assert_eq!(h.refcount(&vec![2u8; 60]), Some(1));

    // 60 used + 60 requested exceeds the limit: rejected, nothing moves.
    let err = h
        .catalog
        .upload("alice", None, "a.bin", Bytes::from(vec![3u8; 60]))
        .await
        .unwrap_err();
    assert!(matches!(err, CatalogError::QuotaExceeded));
    assert_eq!(h.used("alice"), 60);
    assert_eq!(h.refcount(&vec![2u8; 60]), Some(1));
}

#[derive(Debug, Default)]
struct CountingMetrics {
    bytes_received: AtomicUsize,
}

impl MetricsCollector for CountingMetrics {
    fn content_created(&self) {}
    fn content_deduplicated(&self) {}
    fn content_released(&self) {}
    fn content_purged(&self) {}
    fn operation_rolled_back(&self) {}
    fn bytes_received(&self, amount: usize) {
        self.bytes_received.fetch_add(amount, Ordering::SeqCst);
    }
    fn bytes_sent(&self, _amount: usize) {}
}

#[tokio::test]
async fn upload_counts_received_bytes_once() {
    let dir = tempfile::tempdir().unwrap();
    let db = Arc::new(MetaDb::open(dir.path().join("meta"), Durability::Buffer).unwrap());
    let counting = Arc::new(CountingMetrics::default());
    let catalog = FileCatalog::new(
        db.clone(),
        Arc::new(MemBlobStore::new()),
        Arc::new(NoThumbnails),
        SharedMetrics::new(counting.clone()),
        Duration::from_secs(3600),
    );
    let mut tx = db.begin();
    tx.put_quota(&QuotaAccount::new("alice".to_string(), 1000))
        .unwrap();
    tx.commit().unwrap();

    catalog
        .upload("alice", None, "a.txt", Bytes::from_static(b"12345"))
        .await
        .unwrap();
    assert_eq!(counting.bytes_received.load(Ordering::SeqCst), 5);
}

#[tokio::test]
async fn quota_tracks_sum_of_active_sizes() {
    let h = setup();
    h.add_user("alice", 10_000);

    let a = h
        .catalog
        .upload("alice", None, "a", Bytes::from(vec![0u8; 100]))
        .await
        .unwrap();
    h.catalog
        .upload("alice", None, "b", Bytes::from(vec![1u8; 200]))
        .await
        .unwrap();
    h.catalog
        .upload("alice", None, "c", Bytes::from(vec![1u8; 200]))
        .await
        .unwrap();
    h.catalog
        .upload("alice", None, "b", Bytes::from(vec![2u8; 50]))
        .await
        .unwrap();
    h.catalog.delete("alice", &a.file.id).await.unwrap();

    let listing = h.catalog.list("alice", None, &ListFilter::default()).unwrap();
    let sum: u64 = listing.files.iter().map(|f| f.size).sum();
    assert_eq!(sum, 250);
    assert_eq!(h.used("alice"), sum);
    assert_eq!(listing.storage_used, sum);
}
