//! At-rest encryption of private signing keys.
//!
//! The AES-256-GCM key is derived from a configured secret and salt with
//! HMAC-SHA256 in extract-then-expand form (RFC 5869 with a single output
//! block). Stored form: `base64(nonce || ciphertext)`.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use super::KeyError;

const NONCE_SIZE: usize = 12;
const KDF_INFO: &[u8] = b"token-authority/signing-key/v1";

/// Symmetric cipher for private key PEMs.
#[derive(Clone)]
pub struct KeyCipher {
    key: [u8; 32],
}

impl std::fmt::Debug for KeyCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyCipher").finish_non_exhaustive()
    }
}

impl KeyCipher {
    /// Derive a cipher from `secret` and `salt`. Both must be non-empty.
    pub fn new(secret: &str, salt: &str) -> Result<Self, KeyError> {
        if secret.is_empty() || salt.is_empty() {
            return Err(KeyError::Crypto(
                "key encryption secret and salt must be set".to_string(),
            ));
        }
        let prk = hmac_sha256(salt.as_bytes(), &[secret.as_bytes()])?;
        let okm = hmac_sha256(&prk, &[KDF_INFO, &[1]])?;
        Ok(Self { key: okm })
    }

    /// Encrypt a PEM string.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, KeyError> {
        let cipher =
            Aes256Gcm::new_from_slice(&self.key).map_err(|e| KeyError::Crypto(e.to_string()))?;
        let nonce_bytes: [u8; NONCE_SIZE] = rand::random();
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_bytes())
            .map_err(|e| KeyError::Crypto(format!("encryption failed: {e}")))?;

        let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(sealed))
    }

    /// Decrypt a value produced by [`encrypt`](Self::encrypt).
    pub fn decrypt(&self, encoded: &str) -> Result<String, KeyError> {
        let sealed = BASE64
            .decode(encoded)
            .map_err(|e| KeyError::Crypto(format!("invalid base64: {e}")))?;
        if sealed.len() <= NONCE_SIZE {
            return Err(KeyError::Crypto("ciphertext too short".to_string()));
        }

        let cipher =
            Aes256Gcm::new_from_slice(&self.key).map_err(|e| KeyError::Crypto(e.to_string()))?;
        let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| KeyError::Crypto("decryption failed (wrong secret or salt?)".to_string()))?;

        String::from_utf8(plaintext).map_err(|e| KeyError::Crypto(e.to_string()))
    }
}

fn hmac_sha256(key: &[u8], parts: &[&[u8]]) -> Result<[u8; 32], KeyError> {
    let mut mac = <Hmac<Sha256> as hmac::KeyInit>::new_from_slice(key).map_err(|e| KeyError::Crypto(e.to_string()))?;
    for part in parts {
        mac.update(part);
    }
    let digest = mac.finalize().into_bytes();
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    Ok(out)
}
