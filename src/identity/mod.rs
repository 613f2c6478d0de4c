//! User and role records stored in the system database, plus password
//! hashing.
//!
//! Credentials are hashed with Argon2id and a per-hash random salt; only
//! the PHC-encoded hash string is ever persisted or logged.

use argon2::password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use serde::{Deserialize, Serialize};

use crate::error::{DataKeepError, DataKeepResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub username: String,
    pub password_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Role {
    pub name: String,
}

/// Membership link between a user record and a role record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInRole {
    pub user_id: String,
    pub role_id: String,
}

pub fn hash_password(password: &str) -> DataKeepResult<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| DataKeepError::Provider(format!("Password hashing failed: {}", e)))
}

pub fn verify_password(password: &str, password_hash: &str) -> DataKeepResult<bool> {
    let parsed = PasswordHash::new(password_hash)
        .map_err(|e| DataKeepError::Provider(format!("Stored hash is malformed: {}", e)))?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok())
}
