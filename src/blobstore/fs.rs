use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;
use tracing::debug;

use super::{BlobError, BlobStore};

/// Download token length in bytes (32 bytes = 64 hex chars).
const TOKEN_BYTES: usize = 32;

#[derive(Debug, Clone)]
struct TokenData {
    blob_key: String,
    expires_at: Instant,
}

/// In-memory store of outstanding download tokens.
///
/// Tokens back the presigned URLs of the filesystem blob store: the HTTP
/// layer resolves a token to a blob key and streams the payload.
#[derive(Debug, Clone, Default)]
pub(crate) struct DownloadTokens {
    tokens: Arc<RwLock<HashMap<String, TokenData>>>,
}

impl DownloadTokens {
    fn generate_token() -> String {
        let mut rng = rand::thread_rng();
        let bytes: Vec<u8> = (0..TOKEN_BYTES).map(|_| rng.gen()).collect();
        hex::encode(bytes)
    }

    fn issue(&self, blob_key: String, ttl: Duration) -> String {
        let token = Self::generate_token();
        let data = TokenData {
            blob_key,
            expires_at: Instant::now() + ttl,
        };
        let mut tokens = self.tokens.write().unwrap();
        tokens.insert(token.clone(), data);
        token
    }

    fn resolve(&self, token: &str) -> Option<String> {
        let tokens = self.tokens.read().unwrap();
        match tokens.get(token) {
            Some(data) if Instant::now() < data.expires_at => Some(data.blob_key.clone()),
            Some(_) => {
                debug!("download token expired");
                None
            }
            None => None,
        }
    }

    fn cleanup_expired(&self) -> usize {
        let mut tokens = self.tokens.write().unwrap();
        let initial_count = tokens.len();
        tokens.retain(|_, data| Instant::now() < data.expires_at);
        initial_count - tokens.len()
    }
}

/// Filesystem-backed blob store.
///
/// Blobs live under `root` in a two-character shard directory derived from
/// the key. Writes go to a temp file first and are renamed into place so a
/// crash never leaves a partial blob under its final key.
#[derive(Debug)]
pub struct FsBlobStore {
    root: PathBuf,
    public_url: String,
    tokens: DownloadTokens,
}

impl FsBlobStore {
    /// `public_url` is the externally reachable base of the HTTP layer, e.g.
    /// `http://localhost:8014`; presigned URLs are issued under its
    /// `/download/` path.
    pub fn new(root: impl Into<PathBuf>, public_url: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            public_url: public_url.into().trim_end_matches('/').to_string(),
            tokens: DownloadTokens::default(),
        }
    }

    fn blob_path(&self, key: &str) -> Result<PathBuf, BlobError> {
        if key.is_empty() || key.contains('/') || key.contains("..") {
            return Err(BlobError::InvalidKey(key.to_string()));
        }
        let shard = if key.len() > 2 { &key[..2] } else { "__" };
        Ok(self.root.join(shard).join(key))
    }

    /// Resolves a download token to a blob key, if the token is valid and
    /// unexpired. Used by the HTTP download route.
    pub fn resolve_token(&self, token: &str) -> Option<String> {
        self.tokens.resolve(token)
    }

    /// Drops expired download tokens, returning how many were removed.
    pub fn cleanup_expired_tokens(&self) -> usize {
        self.tokens.cleanup_expired()
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, key: &str, data: Bytes) -> Result<(), BlobError> {
        let path = self.blob_path(key)?;
        if let Some(dir) = path.parent() {
            async_fs::create_dir_all(dir).await?;
        }
        let tmp = path.with_extension("tmp");
        async_fs::write(&tmp, &data).await?;
        async_fs::rename(&tmp, &path).await?;
        debug!(key = %key, size = data.len(), "blob written");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, BlobError> {
        let path = self.blob_path(key)?;
        match async_fs::read(&path).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), BlobError> {
        let path = self.blob_path(key)?;
        match async_fs::remove_file(&path).await {
            Ok(()) => {
                debug!(key = %key, "blob deleted");
                Ok(())
            }
            // At-least-once delete semantics: a retried delete of an
            // already-removed blob succeeds.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn presigned_url(&self, key: &str, ttl: Duration) -> Result<String, BlobError> {
        // Validate the key shape even though the token indirection never
        // touches the filesystem here.
        let _ = self.blob_path(key)?;
        let token = self.tokens.issue(key.to_string(), ttl);
        Ok(format!("{}/download/{}", self.public_url, token))
    }
}
