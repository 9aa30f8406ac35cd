use std::path::PathBuf;

use fjall::{PartitionCreateOptions, TxKeyspace, TxPartitionHandle, WriteTransaction};
use tracing::warn;

use super::records::{CatalogEntry, ContentEntry, FolderNode, QuotaAccount};
use super::{Durability, MetaError};

const CONTENT_TREE: &str = "_CONTENT";
const FILES_TREE: &str = "_FILES";
const FILE_PATHS_TREE: &str = "_FILE_PATHS";
const FOLDERS_TREE: &str = "_FOLDERS";
const FOLDER_PATHS_TREE: &str = "_FOLDER_PATHS";
const QUOTA_TREE: &str = "_QUOTA";
const USERS_TREE: &str = "_USERS";
const USERS_BY_KEY_TREE: &str = "_USERS_BY_KEY";

/// Separator for composite path-index keys. Names are validated at the
/// catalog layer to never contain NUL.
const SEP: u8 = 0;

/// Key of a file binding in the path index: `user \0 folder \0 name`.
/// The root folder is encoded as the empty string.
fn file_path_key(user_id: &str, folder_id: Option<&str>, name: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(user_id.len() + name.len() + 40);
    key.extend_from_slice(user_id.as_bytes());
    key.push(SEP);
    key.extend_from_slice(folder_id.unwrap_or("").as_bytes());
    key.push(SEP);
    key.extend_from_slice(name.as_bytes());
    key
}

fn file_path_prefix(user_id: &str, folder_id: Option<&str>) -> Vec<u8> {
    let mut key = Vec::with_capacity(user_id.len() + 40);
    key.extend_from_slice(user_id.as_bytes());
    key.push(SEP);
    key.extend_from_slice(folder_id.unwrap_or("").as_bytes());
    key.push(SEP);
    key
}

fn folder_path_key(user_id: &str, parent_id: Option<&str>, name: &str) -> Vec<u8> {
    // Same layout as file path keys, in a separate tree.
    file_path_key(user_id, parent_id, name)
}

fn folder_path_prefix(user_id: &str, parent_id: Option<&str>) -> Vec<u8> {
    file_path_prefix(user_id, parent_id)
}

/// Metadata database holding all trees of the storage backend.
///
/// All reads go through snapshot read transactions; all mutations go through
/// [`MetaTx`], a single-writer transaction, so concurrent refcount updates on
/// the same content entry cannot be lost.
pub struct MetaDb {
    keyspace: TxKeyspace,
    durability: Durability,
    content: TxPartitionHandle,
    files: TxPartitionHandle,
    file_paths: TxPartitionHandle,
    folders: TxPartitionHandle,
    folder_paths: TxPartitionHandle,
    quota: TxPartitionHandle,
    users: TxPartitionHandle,
    users_by_key: TxPartitionHandle,
}

impl std::fmt::Debug for MetaDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetaDb")
            .field("durability", &self.durability)
            .finish()
    }
}

impl MetaDb {
    pub fn open(path: impl Into<PathBuf>, durability: Durability) -> Result<Self, MetaError> {
        let keyspace = fjall::Config::new(path.into()).open_transactional()?;

        let open = |name: &str| -> Result<TxPartitionHandle, MetaError> {
            Ok(keyspace.open_partition(name, PartitionCreateOptions::default())?)
        };

        Ok(Self {
            content: open(CONTENT_TREE)?,
            files: open(FILES_TREE)?,
            file_paths: open(FILE_PATHS_TREE)?,
            folders: open(FOLDERS_TREE)?,
            folder_paths: open(FOLDER_PATHS_TREE)?,
            quota: open(QUOTA_TREE)?,
            users: open(USERS_TREE)?,
            users_by_key: open(USERS_BY_KEY_TREE)?,
            keyspace,
            durability,
        })
    }

    /// Begins a write transaction. fjall serializes writers, so at most one
    /// transaction mutates the trees at a time.
    pub fn begin(&self) -> MetaTx<'_> {
        MetaTx {
            db: self,
            tx: self.keyspace.write_tx(),
        }
    }

    pub fn get_content(&self, hash: &str) -> Result<Option<ContentEntry>, MetaError> {
        let rtx = self.keyspace.read_tx();
        match rtx.get(&self.content, hash.as_bytes())? {
            Some(raw) => Ok(Some(ContentEntry::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn get_file(&self, file_id: &str) -> Result<Option<CatalogEntry>, MetaError> {
        let rtx = self.keyspace.read_tx();
        match rtx.get(&self.files, file_id.as_bytes())? {
            Some(raw) => Ok(Some(CatalogEntry::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    /// Id of the active catalog entry at (user, folder, name), if any.
    pub fn active_binding(
        &self,
        user_id: &str,
        folder_id: Option<&str>,
        name: &str,
    ) -> Result<Option<String>, MetaError> {
        let rtx = self.keyspace.read_tx();
        match rtx.get(&self.file_paths, file_path_key(user_id, folder_id, name))? {
            Some(raw) => Ok(Some(String::from_utf8_lossy(&raw).into_owned())),
            None => Ok(None),
        }
    }

    pub fn get_quota(&self, user_id: &str) -> Result<Option<QuotaAccount>, MetaError> {
        let rtx = self.keyspace.read_tx();
        match rtx.get(&self.quota, user_id.as_bytes())? {
            Some(raw) => Ok(Some(QuotaAccount::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn get_folder(&self, folder_id: &str) -> Result<Option<FolderNode>, MetaError> {
        let rtx = self.keyspace.read_tx();
        match rtx.get(&self.folders, folder_id.as_bytes())? {
            Some(raw) => Ok(Some(FolderNode::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn get_user_raw(&self, user_id: &str) -> Result<Option<Vec<u8>>, MetaError> {
        let rtx = self.keyspace.read_tx();
        Ok(rtx.get(&self.users, user_id.as_bytes())?.map(|s| s.to_vec()))
    }

    pub fn get_user_id_by_key(&self, access_key: &str) -> Result<Option<String>, MetaError> {
        let rtx = self.keyspace.read_tx();
        match rtx.get(&self.users_by_key, access_key.as_bytes())? {
            Some(raw) => Ok(Some(String::from_utf8_lossy(&raw).into_owned())),
            None => Ok(None),
        }
    }

    /// All active catalog entries of a user in a folder, ordered by name
    /// (path-index keys sort lexicographically).
    pub fn list_files(
        &self,
        user_id: &str,
        folder_id: Option<&str>,
    ) -> Result<Vec<CatalogEntry>, MetaError> {
        let rtx = self.keyspace.read_tx();
        let mut entries = Vec::new();
        for kv in rtx.prefix(&self.file_paths, file_path_prefix(user_id, folder_id)) {
            let (_key, file_id) = kv?;
            match rtx.get(&self.files, &file_id)? {
                Some(raw) => entries.push(CatalogEntry::from_slice(&raw)?),
                None => {
                    warn!(
                        file_id = %String::from_utf8_lossy(&file_id),
                        "path index points at missing catalog entry"
                    );
                }
            }
        }
        Ok(entries)
    }

    /// All folders of a user under a parent, ordered by name.
    pub fn list_folders(
        &self,
        user_id: &str,
        parent_id: Option<&str>,
    ) -> Result<Vec<FolderNode>, MetaError> {
        let rtx = self.keyspace.read_tx();
        let mut folders = Vec::new();
        for kv in rtx.prefix(&self.folder_paths, folder_path_prefix(user_id, parent_id)) {
            let (_key, folder_id) = kv?;
            match rtx.get(&self.folders, &folder_id)? {
                Some(raw) => folders.push(FolderNode::from_slice(&raw)?),
                None => {
                    warn!(
                        folder_id = %String::from_utf8_lossy(&folder_id),
                        "folder path index points at missing folder"
                    );
                }
            }
        }
        Ok(folders)
    }

    /// Key counts of the (content, files, quota) trees.
    pub fn num_keys(&self) -> (usize, usize, usize) {
        let rtx = self.keyspace.read_tx();
        let count = |part: &TxPartitionHandle| rtx.iter(part).filter(|kv| kv.is_ok()).count();
        (
            count(&self.content),
            count(&self.files),
            count(&self.quota),
        )
    }

    /// Disk space used by the metadata store.
    pub fn disk_space(&self) -> u64 {
        self.keyspace.disk_space()
    }
}

/// Typed wrapper around a fjall write transaction.
///
/// Dropping the transaction without calling [`MetaTx::commit`] discards every
/// buffered mutation, which is how all rollback paths are implemented.
pub struct MetaTx<'a> {
    db: &'a MetaDb,
    tx: WriteTransaction<'a>,
}

impl<'a> MetaTx<'a> {
    pub fn commit(self) -> Result<(), MetaError> {
        self.tx.commit()?;
        if let Some(mode) = self.db.durability.persist_mode() {
            self.db.keyspace.persist(mode)?;
        }
        Ok(())
    }

    pub fn rollback(self) {
        self.tx.rollback();
    }

    // --- content entries ---

    pub fn get_content(&self, hash: &str) -> Result<Option<ContentEntry>, MetaError> {
        match self.tx.get(&self.db.content, hash.as_bytes())? {
            Some(raw) => Ok(Some(ContentEntry::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn put_content(&mut self, entry: &ContentEntry) -> Result<(), MetaError> {
        self.tx
            .insert(&self.db.content, entry.hash.as_bytes(), entry.to_vec()?);
        Ok(())
    }

    pub fn delete_content(&mut self, hash: &str) {
        self.tx.remove(&self.db.content, hash.as_bytes());
    }

    /// Increments the refcount of an existing entry, returning the updated
    /// record, or `None` when no entry exists for the hash.
    pub fn incref_content(&mut self, hash: &str) -> Result<Option<ContentEntry>, MetaError> {
        match self.get_content(hash)? {
            Some(mut entry) => {
                entry.ref_count += 1;
                self.put_content(&entry)?;
                Ok(Some(entry))
            }
            None => Ok(None),
        }
    }

    /// Decrements the refcount of an entry, returning the updated record.
    /// The count saturates at zero; a decrement of an already-zero count
    /// indicates a bookkeeping bug and is logged.
    pub fn decref_content(&mut self, hash: &str) -> Result<ContentEntry, MetaError> {
        let mut entry = self
            .get_content(hash)?
            .ok_or_else(|| MetaError::MissingRecord(format!("content entry {}", hash)))?;
        if entry.ref_count == 0 {
            warn!(hash = %hash, "decref on content entry with zero refcount");
        }
        entry.ref_count = entry.ref_count.saturating_sub(1);
        self.put_content(&entry)?;
        Ok(entry)
    }

    // --- catalog entries and their path index ---

    pub fn get_file(&self, file_id: &str) -> Result<Option<CatalogEntry>, MetaError> {
        match self.tx.get(&self.db.files, file_id.as_bytes())? {
            Some(raw) => Ok(Some(CatalogEntry::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn put_file(&mut self, entry: &CatalogEntry) -> Result<(), MetaError> {
        self.tx
            .insert(&self.db.files, entry.id.as_bytes(), entry.to_vec()?);
        Ok(())
    }

    pub fn active_binding(
        &self,
        user_id: &str,
        folder_id: Option<&str>,
        name: &str,
    ) -> Result<Option<String>, MetaError> {
        match self
            .tx
            .get(&self.db.file_paths, file_path_key(user_id, folder_id, name))?
        {
            Some(raw) => Ok(Some(String::from_utf8_lossy(&raw).into_owned())),
            None => Ok(None),
        }
    }

    pub fn bind_path(&mut self, entry: &CatalogEntry) {
        self.tx.insert(
            &self.db.file_paths,
            file_path_key(&entry.user_id, entry.folder_id.as_deref(), &entry.name),
            entry.id.as_bytes(),
        );
    }

    pub fn unbind_path(&mut self, entry: &CatalogEntry) {
        self.tx.remove(
            &self.db.file_paths,
            file_path_key(&entry.user_id, entry.folder_id.as_deref(), &entry.name),
        );
    }

    // --- quota ledger ---

    pub fn get_quota(&self, user_id: &str) -> Result<QuotaAccount, MetaError> {
        match self.tx.get(&self.db.quota, user_id.as_bytes())? {
            Some(raw) => QuotaAccount::from_slice(&raw),
            None => Err(MetaError::MissingRecord(format!(
                "quota account for {}",
                user_id
            ))),
        }
    }

    pub fn put_quota(&mut self, account: &QuotaAccount) -> Result<(), MetaError> {
        self.tx
            .insert(&self.db.quota, account.user_id.as_bytes(), account.to_vec()?);
        Ok(())
    }

    /// Reserves `delta` bytes against the user's limit. Returns `false`
    /// without mutating anything when the reservation would exceed it.
    pub fn quota_reserve(&mut self, user_id: &str, delta: u64) -> Result<bool, MetaError> {
        let mut account = self.get_quota(user_id)?;
        if account.used_bytes + delta > account.limit_bytes {
            return Ok(false);
        }
        account.used_bytes += delta;
        self.put_quota(&account)?;
        Ok(true)
    }

    /// Returns `delta` bytes to the user's account, flooring at zero. A
    /// negative balance indicates a bookkeeping bug and is logged.
    pub fn quota_release(&mut self, user_id: &str, delta: u64) -> Result<(), MetaError> {
        let mut account = self.get_quota(user_id)?;
        if delta > account.used_bytes {
            warn!(
                user_id = %user_id,
                used = account.used_bytes,
                delta = delta,
                "quota release below zero, flooring"
            );
        }
        account.used_bytes = account.used_bytes.saturating_sub(delta);
        self.put_quota(&account)
    }

    // --- folders ---

    pub fn put_folder(&mut self, folder: &FolderNode) -> Result<(), MetaError> {
        self.tx
            .insert(&self.db.folders, folder.id.as_bytes(), folder.to_vec()?);
        self.tx.insert(
            &self.db.folder_paths,
            folder_path_key(&folder.user_id, folder.parent_id.as_deref(), &folder.name),
            folder.id.as_bytes(),
        );
        Ok(())
    }

    pub fn folder_path_taken(
        &self,
        user_id: &str,
        parent_id: Option<&str>,
        name: &str,
    ) -> Result<bool, MetaError> {
        Ok(self
            .tx
            .get(&self.db.folder_paths, folder_path_key(user_id, parent_id, name))?
            .is_some())
    }

    // --- users ---

    pub fn get_user_raw(&self, user_id: &str) -> Result<Option<Vec<u8>>, MetaError> {
        Ok(self
            .tx
            .get(&self.db.users, user_id.as_bytes())?
            .map(|s| s.to_vec()))
    }

    pub fn put_user_raw(&mut self, user_id: &str, raw: Vec<u8>) {
        self.tx.insert(&self.db.users, user_id.as_bytes(), raw);
    }

    pub fn bind_user_key(&mut self, access_key: &str, user_id: &str) {
        self.tx.insert(
            &self.db.users_by_key,
            access_key.as_bytes(),
            user_id.as_bytes(),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_db() -> (tempfile::TempDir, MetaDb) {
        let dir = tempfile::tempdir().unwrap();
        let db = MetaDb::open(dir.path().join("meta"), Durability::Buffer).unwrap();
        (dir, db)
    }

    #[test]
    fn content_incref_decref() {
        let (_dir, db) = open_db();
        let hash = "aa".repeat(32);

        let mut tx = db.begin();
        tx.put_content(&ContentEntry::new(hash.clone(), 10, None))
            .unwrap();
        tx.commit().unwrap();

        let mut tx = db.begin();
        let entry = tx.incref_content(&hash).unwrap().unwrap();
        assert_eq!(entry.ref_count, 2);
        tx.commit().unwrap();

        let mut tx = db.begin();
        let entry = tx.decref_content(&hash).unwrap();
        assert_eq!(entry.ref_count, 1);
        tx.commit().unwrap();

        assert_eq!(db.get_content(&hash).unwrap().unwrap().ref_count, 1);
    }

    #[test]
    fn incref_missing_entry_is_none() {
        let (_dir, db) = open_db();
        let mut tx = db.begin();
        assert!(tx.incref_content(&"bb".repeat(32)).unwrap().is_none());
        tx.rollback();
    }

    #[test]
    fn rollback_discards_mutations() {
        let (_dir, db) = open_db();
        let hash = "cc".repeat(32);

        let mut tx = db.begin();
        tx.put_content(&ContentEntry::new(hash.clone(), 10, None))
            .unwrap();
        tx.rollback();

        assert!(db.get_content(&hash).unwrap().is_none());
    }

    #[test]
    fn quota_reserve_and_release() {
        let (_dir, db) = open_db();

        let mut tx = db.begin();
        tx.put_quota(&QuotaAccount::new("alice".to_string(), 100))
            .unwrap();
        assert!(tx.quota_reserve("alice", 60).unwrap());
        assert!(!tx.quota_reserve("alice", 60).unwrap());
        tx.quota_release("alice", 60).unwrap();
        // Flooring: releasing more than reserved does not underflow.
        tx.quota_release("alice", 1).unwrap();
        let account = tx.get_quota("alice").unwrap();
        assert_eq!(account.used_bytes, 0);
        tx.commit().unwrap();
    }

    #[test]
    fn path_index_binds_and_lists_in_name_order() {
        let (_dir, db) = open_db();

        let mut tx = db.begin();
        for name in ["b.txt", "a.txt", "c.txt"] {
            let entry = CatalogEntry::new(
                "alice".to_string(),
                None,
                name.to_string(),
                "dd".repeat(32),
            );
            tx.put_file(&entry).unwrap();
            tx.bind_path(&entry);
        }
        tx.commit().unwrap();

        let files = db.list_files("alice", None).unwrap();
        let names: Vec<_> = files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, ["a.txt", "b.txt", "c.txt"]);

        assert!(db.active_binding("alice", None, "a.txt").unwrap().is_some());
        assert!(db.active_binding("bob", None, "a.txt").unwrap().is_none());
    }
}
