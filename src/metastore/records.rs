use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use super::MetaError;

/// Default storage quota for new accounts: 15 GiB.
pub const DEFAULT_QUOTA_LIMIT: u64 = 15 * 1024 * 1024 * 1024;

/// Returns the current time as seconds since the UNIX epoch.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// One record per unique content hash, shared by every catalog entry bound
/// to that content.
///
/// The blob key equals the content hash by convention. `ref_count` tracks the
/// number of active catalog bindings; the record and its backing blob(s) are
/// purged together when it reaches zero.
#[derive(Debug, Clone, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct ContentEntry {
    /// SHA-256 of the content, lower-case hex. Primary key.
    pub hash: String,
    /// Object store key for the payload (= hash).
    pub blob_key: String,
    /// Object store key for the derived thumbnail, if one was generated.
    pub thumbnail_key: Option<String>,
    /// Payload size in bytes.
    pub size: u64,
    /// Number of active catalog bindings pointing at this entry.
    pub ref_count: u64,
    /// Creation timestamp (seconds since UNIX epoch).
    pub created_at: u64,
}

impl ContentEntry {
    pub fn new(hash: String, size: u64, thumbnail_key: Option<String>) -> Self {
        let blob_key = hash.clone();
        Self {
            hash,
            blob_key,
            thumbnail_key,
            size,
            ref_count: 1,
            created_at: unix_now(),
        }
    }

    pub fn to_vec(&self) -> Result<Vec<u8>, MetaError> {
        encode(self)
    }

    pub fn from_slice(data: &[u8]) -> Result<Self, MetaError> {
        decode(data)
    }
}

/// The per-user naming layer: one record per (user, folder, name) binding.
///
/// Soft-deleted rows are retained; only active rows hold a slot in the path
/// index and count against the bound content entry's refcount.
#[derive(Debug, Clone, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct CatalogEntry {
    /// UUIDv4, primary key.
    pub id: String,
    pub user_id: String,
    /// Parent folder, `None` for the root of the user's tree.
    pub folder_id: Option<String>,
    /// Display name, unique among the user's active entries in the folder.
    pub name: String,
    /// Hash of the bound content entry.
    pub content_hash: String,
    pub is_deleted: bool,
    pub created_at: u64,
    pub updated_at: u64,
}

impl CatalogEntry {
    pub fn new(
        user_id: String,
        folder_id: Option<String>,
        name: String,
        content_hash: String,
    ) -> Self {
        let now = unix_now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id,
            folder_id,
            name,
            content_hash,
            is_deleted: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn to_vec(&self) -> Result<Vec<u8>, MetaError> {
        encode(self)
    }

    pub fn from_slice(data: &[u8]) -> Result<Self, MetaError> {
        decode(data)
    }
}

/// Per-user storage accounting. `used_bytes` reflects the sum of the sizes of
/// the user's active catalog entries; dedup across users does not discount it.
#[derive(Debug, Clone, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct QuotaAccount {
    pub user_id: String,
    pub limit_bytes: u64,
    pub used_bytes: u64,
}

impl QuotaAccount {
    pub fn new(user_id: String, limit_bytes: u64) -> Self {
        Self {
            user_id,
            limit_bytes,
            used_bytes: 0,
        }
    }

    pub fn to_vec(&self) -> Result<Vec<u8>, MetaError> {
        encode(self)
    }

    pub fn from_slice(data: &[u8]) -> Result<Self, MetaError> {
        decode(data)
    }
}

/// A node in a user's folder tree. `parent_id == None` means the folder hangs
/// off the root.
#[derive(Debug, Clone, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct FolderNode {
    /// UUIDv4, primary key.
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub parent_id: Option<String>,
    pub created_at: u64,
}

impl FolderNode {
    pub fn new(user_id: String, name: String, parent_id: Option<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id,
            name,
            parent_id,
            created_at: unix_now(),
        }
    }

    pub fn to_vec(&self) -> Result<Vec<u8>, MetaError> {
        encode(self)
    }

    pub fn from_slice(data: &[u8]) -> Result<Self, MetaError> {
        decode(data)
    }
}

fn encode<T: bincode::Encode>(value: &T) -> Result<Vec<u8>, MetaError> {
    bincode::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| MetaError::Encode(e.to_string()))
}

fn decode<T: bincode::Decode<()>>(data: &[u8]) -> Result<T, MetaError> {
    let (value, _len) = bincode::decode_from_slice(data, bincode::config::standard())
        .map_err(|e| MetaError::Decode(e.to_string()))?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_entry_roundtrip() {
        let entry = ContentEntry::new("ab".repeat(32), 1024, Some("thumb_x.jpg".to_string()));
        assert_eq!(entry.ref_count, 1);
        assert_eq!(entry.blob_key, entry.hash);

        let decoded = ContentEntry::from_slice(&entry.to_vec().unwrap()).unwrap();
        assert_eq!(decoded.hash, entry.hash);
        assert_eq!(decoded.size, 1024);
        assert_eq!(decoded.thumbnail_key.as_deref(), Some("thumb_x.jpg"));
    }

    #[test]
    fn catalog_entry_starts_active() {
        let entry = CatalogEntry::new(
            "alice".to_string(),
            None,
            "a.txt".to_string(),
            "cd".repeat(32),
        );
        assert!(!entry.is_deleted);
        assert_eq!(entry.created_at, entry.updated_at);

        let decoded = CatalogEntry::from_slice(&entry.to_vec().unwrap()).unwrap();
        assert_eq!(decoded.id, entry.id);
        assert_eq!(decoded.folder_id, None);
    }
}
