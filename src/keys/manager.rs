//! Key manager: active signer selection, verification lookup by `kid`,
//! rotation and first-start bootstrap.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use jsonwebtoken::{DecodingKey, EncodingKey};
use tracing::{debug, info};

use super::jwk::Jwk;
use super::store::KeyStore;
use super::{KeyCipher, KeyError, KeyPair, newest};
use crate::audit::{self, AuditEvent};

/// Slot used by first-start bootstrap.
pub const BOOTSTRAP_SLOT: &str = "bootstrap";

/// A decrypted private key ready to sign.
#[derive(Clone)]
pub struct SigningKey {
    /// Key id placed in the JWT header.
    pub kid: String,
    /// Creation time of the underlying row.
    pub created_at: DateTime<Utc>,
    key: EncodingKey,
}

impl SigningKey {
    /// jsonwebtoken encoding key.
    #[must_use]
    pub fn encoding_key(&self) -> &EncodingKey {
        &self.key
    }
}

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKey")
            .field("kid", &self.kid)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

/// A public key ready to verify signatures.
#[derive(Clone)]
pub struct VerificationKey {
    /// Key id.
    pub kid: String,
    key: DecodingKey,
}

impl VerificationKey {
    /// jsonwebtoken decoding key.
    #[must_use]
    pub fn decoding_key(&self) -> &DecodingKey {
        &self.key
    }
}

impl std::fmt::Debug for VerificationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerificationKey")
            .field("kid", &self.kid)
            .finish_non_exhaustive()
    }
}

/// Owns the key store and the at-rest cipher.
///
/// Rows are immutable, so decrypted and parsed keys are cached by `kid` for
/// the life of the process. The store is still consulted on every
/// [`active_signing_key`](Self::active_signing_key) call so that a rotation
/// performed by another instance is picked up.
pub struct KeyManager {
    store: Arc<dyn KeyStore>,
    cipher: KeyCipher,
    signing: DashMap<String, Arc<SigningKey>>,
    verification: DashMap<String, Arc<VerificationKey>>,
}

impl KeyManager {
    /// Create a manager over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn KeyStore>, cipher: KeyCipher) -> Self {
        Self {
            store,
            cipher,
            signing: DashMap::new(),
            verification: DashMap::new(),
        }
    }

    /// Ensure at least one key exists.
    ///
    /// Concurrent callers against an empty store race for the `bootstrap`
    /// slot; exactly one key survives and every caller returns it.
    pub async fn bootstrap(&self) -> Result<KeyPair, KeyError> {
        if let Some(existing) = self.latest_key().await? {
            debug!(kid = %existing.id, "Signing key present, skipping bootstrap");
            return Ok(existing);
        }

        let candidate = self.generate().await?;
        let kid = candidate.id.clone();
        if self.store.insert_if_absent(BOOTSTRAP_SLOT, candidate).await? {
            info!(kid = %kid, "Bootstrapped initial signing key");
            audit::emit(&AuditEvent::key_rotated(&kid, "bootstrap"));
        } else {
            debug!("Lost bootstrap race, using the stored key");
        }

        self.latest_key().await?.ok_or(KeyError::NoKeyAvailable)
    }

    /// Generate a fresh key pair and append it. The new key becomes the
    /// active signer; all previous keys stay available for verification.
    pub async fn rotate(&self) -> Result<KeyPair, KeyError> {
        let slot = format!("manual-{}", uuid::Uuid::new_v4().simple());
        self.rotate_in_slot(&slot, "manual")
            .await?
            .ok_or_else(|| KeyError::Generation(format!("slot {slot} unexpectedly taken")))
    }

    /// Generate and append a key under an idempotency slot.
    ///
    /// Returns `None` when another writer already filled the slot.
    pub async fn rotate_in_slot(
        &self,
        slot: &str,
        reason: &str,
    ) -> Result<Option<KeyPair>, KeyError> {
        let key = self.generate().await?;
        if !self.store.insert_if_absent(slot, key.clone()).await? {
            debug!(slot, "Rotation slot already filled");
            return Ok(None);
        }
        info!(kid = %key.id, slot, reason, "Rotated signing key");
        audit::emit(&AuditEvent::key_rotated(&key.id, reason));
        telemetry_metrics::counter!("authority_key_rotations_total", "reason" => reason.to_string())
            .increment(1);
        Ok(Some(key))
    }

    /// The newest stored key, if any.
    pub async fn latest_key(&self) -> Result<Option<KeyPair>, KeyError> {
        let keys = self.store.list().await?;
        Ok(newest(&keys).cloned())
    }

    /// Every stored key, newest first.
    pub async fn keys(&self) -> Result<Vec<KeyPair>, KeyError> {
        let mut keys = self.store.list().await?;
        keys.sort_by(|a, b| (b.created_at, &b.id).cmp(&(a.created_at, &a.id)));
        Ok(keys)
    }

    /// The key that signs new tokens.
    pub async fn active_signing_key(&self) -> Result<Arc<SigningKey>, KeyError> {
        let latest = self.latest_key().await?.ok_or(KeyError::NoKeyAvailable)?;
        if let Some(cached) = self.signing.get(&latest.id) {
            return Ok(Arc::clone(cached.value()));
        }

        let pem = self.cipher.decrypt(&latest.private_key)?;
        let key = EncodingKey::from_rsa_pem(pem.as_bytes())
            .map_err(|e| KeyError::Crypto(format!("invalid private key {}: {e}", latest.id)))?;
        let signing = Arc::new(SigningKey {
            kid: latest.id.clone(),
            created_at: latest.created_at,
            key,
        });
        self.signing.insert(latest.id, Arc::clone(&signing));
        Ok(signing)
    }

    /// The public key for `kid`, for verifying tokens signed by any stored
    /// key (current or superseded).
    pub async fn verification_key(&self, kid: &str) -> Result<Arc<VerificationKey>, KeyError> {
        if let Some(cached) = self.verification.get(kid) {
            return Ok(Arc::clone(cached.value()));
        }

        let row = self
            .store
            .get(kid)
            .await?
            .ok_or_else(|| KeyError::NotFound(kid.to_string()))?;
        let key = DecodingKey::from_rsa_pem(row.public_key.as_bytes())
            .map_err(|e| KeyError::Crypto(format!("invalid public key {kid}: {e}")))?;
        let verification = Arc::new(VerificationKey {
            kid: row.id.clone(),
            key,
        });
        self.verification.insert(row.id, Arc::clone(&verification));
        Ok(verification)
    }

    /// Every stored public key as a JWK, newest first.
    pub async fn public_keys(&self) -> Result<Vec<Jwk>, KeyError> {
        self.keys()
            .await?
            .iter()
            .map(|k| Jwk::from_public_pem(&k.id, &k.public_key))
            .collect()
    }

    async fn generate(&self) -> Result<KeyPair, KeyError> {
        let cipher = self.cipher.clone();
        tokio::task::spawn_blocking(move || generate_key_pair(&cipher))
            .await
            .map_err(|e| KeyError::Generation(e.to_string()))?
    }
}

/// Generate an RSA-2048 key pair with an encrypted private half.
fn generate_key_pair(cipher: &KeyCipher) -> Result<KeyPair, KeyError> {
    let pair = rcgen::KeyPair::generate_for(&rcgen::PKCS_RSA_SHA256)
        .map_err(|e| KeyError::Generation(e.to_string()))?;
    Ok(KeyPair {
        id: uuid::Uuid::new_v4().to_string(),
        private_key: cipher.encrypt(&pair.serialize_pem())?,
        public_key: pair.public_key_pem(),
        created_at: Utc::now(),
    })
}
