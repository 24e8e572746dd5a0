//! Signing key lifecycle.
//!
//! 1. **Storage**: [`KeyStore`] is insert-only. Rows are never updated or
//!    deleted, so tokens signed by superseded keys stay verifiable until they
//!    expire.
//! 2. **Selection**: the active signer is the newest row by `created`, ties
//!    broken by the greater `id` ([`newest`]).
//! 3. **Rotation**: [`KeyManager::rotate`] appends a fresh RSA-2048 pair; the
//!    [`KeyRotator`] does so when the active key is older than the rotation
//!    window.
//! 4. **Publication**: [`KeyManager::public_keys`] projects every stored public
//!    key into JWK form for `GET /oauth2/jwks`.
//!
//! Private keys are encrypted at rest with [`KeyCipher`].

pub mod cipher;
pub mod jwk;
pub mod manager;
pub mod rotator;
pub mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

pub use cipher::KeyCipher;
pub use jwk::{Jwk, JwkSet};
pub use manager::{KeyManager, SigningKey, VerificationKey};
pub use rotator::KeyRotator;
pub use store::{FileKeyStore, InMemoryKeyStore, KeyStore};

/// A persisted signing key pair.
///
/// Field names match the stored row shape `{id, private_key, public_key, created}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPair {
    /// Key identifier, published as the JWT `kid`.
    pub id: String,
    /// PKCS#8 PEM of the private key, encrypted with [`KeyCipher`].
    pub private_key: String,
    /// SPKI PEM of the public key.
    pub public_key: String,
    /// Creation time; the newest key signs.
    #[serde(rename = "created")]
    pub created_at: DateTime<Utc>,
}

impl KeyPair {
    /// Ordering key for active-signer selection.
    fn recency(&self) -> (DateTime<Utc>, &str) {
        (self.created_at, self.id.as_str())
    }
}

/// The active signer among `keys`: maximum `created`, then maximum `id`.
pub fn newest<'a>(keys: impl IntoIterator<Item = &'a KeyPair>) -> Option<&'a KeyPair> {
    keys.into_iter().max_by(|a, b| a.recency().cmp(&b.recency()))
}

/// Key lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    /// The store holds no keys (bootstrap did not run or failed).
    #[error("No signing key available")]
    NoKeyAvailable,

    /// No key with this id exists.
    #[error("Unknown key id: {0}")]
    NotFound(String),

    /// Key pair generation failed.
    #[error("Key generation failed: {0}")]
    Generation(String),

    /// Encryption, decryption or PEM/DER handling failed.
    #[error("Key material error: {0}")]
    Crypto(String),

    /// The key store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}
