//! Offline inspection of the metadata database.

use std::path::PathBuf;

use crate::metastore::{Durability, MetaDb, MetaError};

/// Key counts per tree.
#[derive(Debug, Clone, Copy)]
pub struct KeyCounts {
    pub content_entries: usize,
    pub catalog_entries: usize,
    pub quota_accounts: usize,
}

pub fn num_keys(meta_root: PathBuf) -> Result<KeyCounts, MetaError> {
    let db = MetaDb::open(meta_root.join("meta"), Durability::Buffer)?;
    let (content_entries, catalog_entries, quota_accounts) = db.num_keys();
    Ok(KeyCounts {
        content_entries,
        catalog_entries,
        quota_accounts,
    })
}

pub fn disk_space(meta_root: PathBuf) -> Result<u64, MetaError> {
    let db = MetaDb::open(meta_root.join("meta"), Durability::Buffer)?;
    Ok(db.disk_space())
}
