//! Password hashing and verification

use crate::persistence::{AccessStore, StoreError};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{info, warn};

const BCRYPT_COST: u32 = 10;

/// Prefix of the legacy fixed-digest format
pub const LEGACY_PREFIX: &str = "sha256:";

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("password hashing failed: {0}")]
    Hash(String),

    #[error("invalid username or password")]
    InvalidCredentials,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A stored password hash, tagged by format
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoredHash<'a> {
    Bcrypt(&'a str),
    /// Lowercase hex SHA-256 digest, without the prefix
    LegacySha256(&'a str),
}

impl<'a> StoredHash<'a> {
    pub fn parse(stored: &'a str) -> Self {
        match stored.strip_prefix(LEGACY_PREFIX) {
            Some(digest) => StoredHash::LegacySha256(digest),
            None => StoredHash::Bcrypt(stored),
        }
    }

    pub fn is_legacy(&self) -> bool {
        matches!(self, StoredHash::LegacySha256(_))
    }

    /// Whether `password` matches this hash
    pub fn verify(&self, password: &str) -> bool {
        match self {
            StoredHash::Bcrypt(hash) => bcrypt::verify(password, hash).unwrap_or(false),
            StoredHash::LegacySha256(digest) => sha256_hex(password).eq_ignore_ascii_case(digest),
        }
    }
}

fn sha256_hex(password: &str) -> String {
    format!("{:x}", Sha256::digest(password.as_bytes()))
}

/// Hash a password for storage
pub fn hash_password(password: &str) -> Result<String, AuthError> {
    bcrypt::hash(password, BCRYPT_COST).map_err(|e| AuthError::Hash(e.to_string()))
}

/// Legacy digest string for `password`, as older records store it
pub fn legacy_hash(password: &str) -> String {
    format!("{}{}", LEGACY_PREFIX, sha256_hex(password))
}

pub fn is_legacy_hash(stored: &str) -> bool {
    StoredHash::parse(stored).is_legacy()
}

pub fn check_password(password: &str, stored: &str) -> bool {
    StoredHash::parse(stored).verify(password)
}

/// A user whose credentials were verified
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: i64,
    pub username: String,
}

/// Verify `username`/`password` against the store.
///
/// A record still in the legacy format is re-hashed with bcrypt after a successful
/// check. Failing to write the upgrade does not fail the login.
pub async fn authenticate<S>(store: &S, username: &str, password: &str) -> Result<Identity, AuthError>
where
    S: AccessStore + ?Sized,
{
    let user = store
        .find_user(username)
        .await?
        .ok_or(AuthError::InvalidCredentials)?;

    let stored = StoredHash::parse(&user.password_hash);
    if !stored.verify(password) {
        return Err(AuthError::InvalidCredentials);
    }

    if stored.is_legacy() {
        match hash_password(password) {
            Ok(upgraded) => match store.update_password_hash(user.id, &upgraded).await {
                Ok(()) => info!("Upgraded password hash for {}", user.username),
                Err(e) => warn!("Could not upgrade password hash for {}: {}", user.username, e),
            },
            Err(e) => warn!("Could not re-hash password for {}: {}", user.username, e),
        }
    }

    Ok(Identity {
        user_id: user.id,
        username: user.username,
    })
}
