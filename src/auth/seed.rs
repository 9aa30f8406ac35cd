use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::Deserialize;
use tracing::{debug, info};

use super::{AuthError, UserStore};

/// One seeded user from `users.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct SeedUser {
    pub password: String,
    /// Fixed access key; generated when omitted.
    #[serde(default)]
    pub access_key: Option<String>,
    /// Quota limit in bytes; the default limit when omitted.
    #[serde(default)]
    pub quota_limit: Option<u64>,
}

/// Configuration file structure for users.toml.
#[derive(Debug, Clone, Deserialize)]
pub struct SeedConfig {
    pub users: HashMap<String, SeedUser>,
}

impl SeedConfig {
    /// Loads a seed configuration from a TOML file.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, AuthError> {
        let content = fs::read_to_string(path)
            .map_err(|e| AuthError::Config(format!("failed to read users file: {}", e)))?;
        toml::from_str(&content)
            .map_err(|e| AuthError::Config(format!("failed to parse users file: {}", e)))
    }
}

impl UserStore {
    /// Registers every seeded user that does not exist yet. Returns the
    /// number of users created; existing users are left untouched.
    pub fn seed(&self, config: &SeedConfig) -> Result<usize, AuthError> {
        let mut created = 0;
        for (user_id, seed) in &config.users {
            if self.get(user_id)?.is_some() {
                debug!(user_id = %user_id, "seed user already exists, skipping");
                continue;
            }
            self.register_with(
                user_id,
                &seed.password,
                seed.access_key.clone(),
                seed.quota_limit,
            )?;
            created += 1;
        }
        if created > 0 {
            info!(created = created, "seeded users from configuration");
        }
        Ok(created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metastore::{Durability, MetaDb};
    use std::sync::Arc;

    #[test]
    fn parse_seed_config() {
        let toml_content = r#"
[users.alice]
password = "hunter2"
access_key = "VKALICE"
quota_limit = 1024

[users.bob]
password = "swordfish"
"#;

        let config: SeedConfig = toml::from_str(toml_content).unwrap();
        assert_eq!(config.users.len(), 2);
        assert_eq!(config.users["alice"].access_key.as_deref(), Some("VKALICE"));
        assert_eq!(config.users["bob"].access_key, None);
    }

    #[test]
    fn seeding_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(MetaDb::open(dir.path().join("meta"), Durability::Buffer).unwrap());
        let store = UserStore::new(db);

        let config: SeedConfig = toml::from_str(
            r#"
[users.alice]
password = "hunter2"
access_key = "VKALICE"
quota_limit = 1024
"#,
        )
        .unwrap();

        assert_eq!(store.seed(&config).unwrap(), 1);
        assert_eq!(store.seed(&config).unwrap(), 0);

        let user = store.authenticate_key("VKALICE").unwrap().unwrap();
        assert_eq!(user.user_id, "alice");
    }
}
