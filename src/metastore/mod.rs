//! Transactional metadata store backed by fjall.
//!
//! Owns the record types for content entries, catalog entries, quota accounts
//! and folders, and exposes a single-writer transaction wrapper so that every
//! refcount, binding and quota mutation belonging to one user-facing
//! operation commits (or rolls back) as a unit.

mod db;
mod records;

pub use db::{MetaDb, MetaTx};
pub use records::{
    unix_now, CatalogEntry, ContentEntry, FolderNode, QuotaAccount, DEFAULT_QUOTA_LIMIT,
};

use std::str::FromStr;

/// Errors surfaced by the metadata store.
#[derive(Debug, thiserror::Error)]
pub enum MetaError {
    #[error("metadata backend error: {0}")]
    Backend(#[from] fjall::Error),

    #[error("failed to encode record: {0}")]
    Encode(String),

    #[error("failed to decode record: {0}")]
    Decode(String),

    #[error("missing record: {0}")]
    MissingRecord(String),
}

/// Durability level applied after each committed transaction.
#[derive(Debug, Clone, Copy)]
pub enum Durability {
    Buffer,
    Fsync,
    Fdatasync,
}

impl Durability {
    /// Maps to the fjall persist mode, `None` meaning "let the journal
    /// buffer" (no explicit persist call).
    pub(crate) fn persist_mode(self) -> Option<fjall::PersistMode> {
        match self {
            Durability::Buffer => None,
            Durability::Fsync => Some(fjall::PersistMode::SyncAll),
            Durability::Fdatasync => Some(fjall::PersistMode::SyncData),
        }
    }
}

impl FromStr for Durability {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "buffer" => Ok(Durability::Buffer),
            "fsync" => Ok(Durability::Fsync),
            "fdatasync" => Ok(Durability::Fdatasync),
            _ => Err(format!("Unknown durability option: {}", s)),
        }
    }
}
