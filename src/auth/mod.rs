//! User accounts and access-key authentication.
//!
//! Users are stored in the metadata database; registration creates the user
//! record, its access-key index entry and the quota account in one
//! transaction, so a user can never exist without a quota account.

mod seed;
mod user_store;

pub use seed::{SeedConfig, SeedUser};
pub use user_store::{UserRecord, UserStore};

use crate::metastore::MetaError;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("user already exists")]
    UserExists,

    #[error("password hashing failed: {0}")]
    Hash(String),

    #[error("invalid users file: {0}")]
    Config(String),

    #[error(transparent)]
    Meta(#[from] MetaError),
}
