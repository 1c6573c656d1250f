//! Pluggable credential verification.

use async_trait::async_trait;
use sha2::{Digest, Sha256};

/// Verifies a username/password pair against some backend.
///
/// Login treats a rejected pair and a backend failure the same way
/// (forbidden); the distinction only shows up in the logs.
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn authorize(&self, id: &str, password: &str) -> anyhow::Result<bool>;
}

/// Authorizer backed by a single static credential pair.
///
/// Passwords are compared through their SHA-256 digests so the check
/// does not leak length or prefix information.
pub struct StaticAuthorizer {
    id: String,
    password_digest: [u8; 32],
}

impl StaticAuthorizer {
    pub fn new(id: impl Into<String>, password: &str) -> Self {
        Self {
            id: id.into(),
            password_digest: Sha256::digest(password.as_bytes()).into(),
        }
    }
}

#[async_trait]
impl Authorizer for StaticAuthorizer {
    async fn authorize(&self, id: &str, password: &str) -> anyhow::Result<bool> {
        let digest: [u8; 32] = Sha256::digest(password.as_bytes()).into();
        Ok(id == self.id && digest == self.password_digest)
    }
}
