//! Argon2id hashing for resource-owner passwords and client secrets.

use argon2::password_hash::{PasswordHash, PasswordHasher as _, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};
use std::sync::OnceLock;
use tracing::warn;

use crate::{Error, Result};

/// Argon2id hasher.
///
/// Defaults to m=19456 KiB, t=2, p=1. Verification always uses the
/// parameters encoded in the stored PHC string, so hashes made with other
/// parameters keep verifying.
#[derive(Debug, Clone)]
pub struct PasswordHasher {
    params: Params,
}

impl Default for PasswordHasher {
    fn default() -> Self {
        Self {
            params: Params::default(),
        }
    }
}

impl PasswordHasher {
    /// Hasher with explicit cost parameters.
    pub fn with_params(memory_kib: u32, iterations: u32, parallelism: u32) -> Result<Self> {
        let params = Params::new(memory_kib, iterations, parallelism, None)
            .map_err(|e| Error::Config(format!("invalid argon2 parameters: {e}")))?;
        Ok(Self { params })
    }

    /// Hash `password` into a PHC string.
    pub fn hash(&self, password: &str) -> Result<String> {
        let salt_bytes: [u8; 16] = rand::random();
        let salt = SaltString::encode_b64(&salt_bytes)
            .map_err(|e| Error::Internal(format!("salt encoding failed: {e}")))?;
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, self.params.clone());
        let hash = argon2
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| Error::Internal(format!("password hashing failed: {e}")))?;
        Ok(hash.to_string())
    }

    /// Hash `value` unless it already is a PHC string.
    pub fn hash_if_plain(&self, value: &str) -> Result<String> {
        if is_phc_hash(value) {
            Ok(value.to_string())
        } else {
            self.hash(value)
        }
    }
}

/// Whether `value` looks like an argon2 PHC string.
#[must_use]
pub fn is_phc_hash(value: &str) -> bool {
    value.starts_with("$argon2") && PasswordHash::new(value).is_ok()
}

/// Check `password` against a PHC `hash`. Malformed hashes never match.
#[must_use]
pub fn verify_password(password: &str, hash: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

/// Default-cost hash of a random password, computed once.
///
/// Verified in place of a real hash when a login names no usable account,
/// so unknown usernames take as long as wrong passwords.
pub fn dummy_hash() -> &'static str {
    static DUMMY: OnceLock<String> = OnceLock::new();
    DUMMY.get_or_init(|| {
        let password = uuid::Uuid::new_v4().to_string();
        PasswordHasher::default().hash(&password).unwrap_or_else(|e| {
            warn!(error = %e, "Failed to prepare dummy password hash");
            String::new()
        })
    })
}
