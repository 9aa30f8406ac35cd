use std::sync::Arc;

use bcrypt::{hash, verify, DEFAULT_COST};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tracing::{debug, error, info, warn};

use crate::metastore::{unix_now, MetaDb, MetaError, QuotaAccount, DEFAULT_QUOTA_LIMIT};

use super::AuthError;

/// User record stored in the database.
#[derive(Debug, Clone, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct UserRecord {
    /// Primary key - unique user identifier.
    pub user_id: String,
    /// Bcrypt password hash.
    pub password_hash: String,
    /// API access key, presented as a bearer token.
    pub access_key: String,
    /// Account creation timestamp (seconds since UNIX epoch).
    pub created_at: u64,
}

impl UserRecord {
    pub fn new(user_id: String, password: &str, access_key: String) -> Result<Self, AuthError> {
        let password_hash =
            hash(password, DEFAULT_COST).map_err(|e| AuthError::Hash(e.to_string()))?;
        Ok(Self {
            user_id,
            password_hash,
            access_key,
            created_at: unix_now(),
        })
    }

    /// Verifies a password against the stored hash.
    pub fn verify_password(&self, password: &str) -> bool {
        match verify(password, &self.password_hash) {
            Ok(valid) => valid,
            Err(e) => {
                error!("password verification error: {}", e);
                false
            }
        }
    }

    pub fn to_vec(&self) -> Result<Vec<u8>, MetaError> {
        bincode::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| MetaError::Encode(e.to_string()))
    }

    pub fn from_slice(data: &[u8]) -> Result<Self, MetaError> {
        let (user, _len) = bincode::decode_from_slice(data, bincode::config::standard())
            .map_err(|e| MetaError::Decode(e.to_string()))?;
        Ok(user)
    }
}

fn generate_access_key() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(32)
        .map(char::from)
        .collect();
    format!("VK{}", suffix)
}

/// User store managing registration and authentication.
#[derive(Debug)]
pub struct UserStore {
    db: Arc<MetaDb>,
}

impl UserStore {
    pub fn new(db: Arc<MetaDb>) -> Self {
        Self { db }
    }

    /// Registers a user with a generated access key and the default quota.
    pub fn register(&self, user_id: &str, password: &str) -> Result<UserRecord, AuthError> {
        self.register_with(user_id, password, None, None)
    }

    /// Registers a user, optionally with a fixed access key and quota limit.
    ///
    /// The user record, its access-key index entry and the quota account
    /// commit together.
    pub fn register_with(
        &self,
        user_id: &str,
        password: &str,
        access_key: Option<String>,
        quota_limit: Option<u64>,
    ) -> Result<UserRecord, AuthError> {
        if self.db.get_user_raw(user_id)?.is_some() {
            return Err(AuthError::UserExists);
        }
        let access_key = access_key.unwrap_or_else(generate_access_key);
        if self.db.get_user_id_by_key(&access_key)?.is_some() {
            return Err(AuthError::UserExists);
        }

        let record = UserRecord::new(user_id.to_string(), password, access_key)?;
        let raw = record.to_vec()?;

        let mut tx = self.db.begin();
        // Close the window between the check above and the commit.
        if tx.get_user_raw(user_id)?.is_some() {
            tx.rollback();
            return Err(AuthError::UserExists);
        }
        tx.put_user_raw(user_id, raw);
        tx.bind_user_key(&record.access_key, user_id);
        tx.put_quota(&QuotaAccount::new(
            user_id.to_string(),
            quota_limit.unwrap_or(DEFAULT_QUOTA_LIMIT),
        ))?;
        tx.commit()?;

        info!(user_id = %user_id, "user registered");
        Ok(record)
    }

    pub fn get(&self, user_id: &str) -> Result<Option<UserRecord>, AuthError> {
        match self.db.get_user_raw(user_id)? {
            Some(raw) => Ok(Some(UserRecord::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    /// Authenticates a bearer access key, returning the owning user.
    pub fn authenticate_key(&self, access_key: &str) -> Result<Option<UserRecord>, AuthError> {
        let Some(user_id) = self.db.get_user_id_by_key(access_key)? else {
            debug!("authentication failed: unknown access key");
            return Ok(None);
        };
        let Some(raw) = self.db.get_user_raw(&user_id)? else {
            warn!(user_id = %user_id, "access-key index points at missing user");
            return Ok(None);
        };
        let user = UserRecord::from_slice(&raw)?;
        if bool::from(user.access_key.as_bytes().ct_eq(access_key.as_bytes())) {
            Ok(Some(user))
        } else {
            warn!(user_id = %user_id, "access-key index does not match user record");
            Ok(None)
        }
    }

    /// Authenticates a user id and password.
    pub fn authenticate_password(
        &self,
        user_id: &str,
        password: &str,
    ) -> Result<Option<UserRecord>, AuthError> {
        match self.get(user_id)? {
            Some(user) if user.verify_password(password) => Ok(Some(user)),
            Some(_) => {
                debug!(user_id = %user_id, "authentication failed: invalid password");
                Ok(None)
            }
            None => {
                debug!(user_id = %user_id, "authentication failed: user not found");
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metastore::Durability;

    fn open_store() -> (tempfile::TempDir, UserStore) {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(MetaDb::open(dir.path().join("meta"), Durability::Buffer).unwrap());
        (dir, UserStore::new(db))
    }

    #[test]
    fn register_creates_user_and_quota_account() {
        let (_dir, store) = open_store();
        let user = store
            .register_with("alice", "hunter2", None, Some(500))
            .unwrap();
        assert!(user.access_key.starts_with("VK"));

        let account = store.db.get_quota("alice").unwrap().unwrap();
        assert_eq!(account.limit_bytes, 500);
        assert_eq!(account.used_bytes, 0);

        let err = store.register("alice", "other").unwrap_err();
        assert!(matches!(err, AuthError::UserExists));
    }

    #[test]
    fn authenticate_by_access_key() {
        let (_dir, store) = open_store();
        let user = store.register("alice", "hunter2").unwrap();

        let found = store.authenticate_key(&user.access_key).unwrap().unwrap();
        assert_eq!(found.user_id, "alice");
        assert!(store.authenticate_key("VKnope").unwrap().is_none());
    }

    #[test]
    fn authenticate_by_password() {
        let (_dir, store) = open_store();
        store.register("alice", "hunter2").unwrap();

        assert!(store
            .authenticate_password("alice", "hunter2")
            .unwrap()
            .is_some());
        assert!(store
            .authenticate_password("alice", "wrong")
            .unwrap()
            .is_none());
        assert!(store
            .authenticate_password("nobody", "hunter2")
            .unwrap()
            .is_none());
    }
}
