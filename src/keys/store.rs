//! Key store: insert-only persistence for signing key pairs.
//!
//! Every insert names an idempotency **slot** (`bootstrap`,
//! `rotation-after-<kid>`, `manual-<uuid>`). A slot can be filled once; the
//! losing writer of a race gets `Ok(false)` and re-reads. This is how two
//! instances starting against an empty store converge on one bootstrap key.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use tracing::{debug, warn};

use super::KeyPair;
use crate::error::StoreError;

/// Trait abstracting the key storage backend.
#[async_trait::async_trait]
pub trait KeyStore: Send + Sync + 'static {
    /// Insert `key` under `slot` unless the slot (or the key id) is taken.
    ///
    /// Returns `true` if this call inserted the row.
    async fn insert_if_absent(&self, slot: &str, key: KeyPair) -> Result<bool, StoreError>;

    /// Every stored key, in no particular order.
    async fn list(&self) -> Result<Vec<KeyPair>, StoreError>;

    /// Look up a key by id.
    async fn get(&self, id: &str) -> Result<Option<KeyPair>, StoreError> {
        Ok(self.list().await?.into_iter().find(|k| k.id == id))
    }
}

#[derive(Default)]
struct Rows {
    slots: HashMap<String, String>,
    keys: HashMap<String, KeyPair>,
}

/// In-memory key store. Keys do not survive a restart.
#[derive(Default)]
pub struct InMemoryKeyStore {
    rows: RwLock<Rows>,
}

impl InMemoryKeyStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl KeyStore for InMemoryKeyStore {
    async fn insert_if_absent(&self, slot: &str, key: KeyPair) -> Result<bool, StoreError> {
        let mut rows = self.rows.write();
        if rows.slots.contains_key(slot) || rows.keys.contains_key(&key.id) {
            return Ok(false);
        }
        rows.slots.insert(slot.to_string(), key.id.clone());
        rows.keys.insert(key.id.clone(), key);
        Ok(true)
    }

    async fn list(&self) -> Result<Vec<KeyPair>, StoreError> {
        Ok(self.rows.read().keys.values().cloned().collect())
    }

    async fn get(&self, id: &str) -> Result<Option<KeyPair>, StoreError> {
        Ok(self.rows.read().keys.get(id).cloned())
    }
}

/// File-backed key store: one JSON document per slot (`<dir>/<slot>.json`).
///
/// A row is written to a temporary file first and then hard-linked into
/// place. `link` fails when the target exists, which gives create-if-absent
/// semantics across processes sharing the directory, and readers never see a
/// half-written row.
pub struct FileKeyStore {
    dir: PathBuf,
}

impl FileKeyStore {
    /// Open (and create if needed) a key directory.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    /// Directory holding the key rows.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn slot_path(&self, slot: &str) -> Result<PathBuf, StoreError> {
        let valid = !slot.is_empty()
            && slot
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(StoreError::Unavailable(format!(
                "invalid key slot name '{slot}'"
            )));
        }
        Ok(self.dir.join(format!("{slot}.json")))
    }
}

#[async_trait::async_trait]
impl KeyStore for FileKeyStore {
    async fn insert_if_absent(&self, slot: &str, key: KeyPair) -> Result<bool, StoreError> {
        let target = self.slot_path(slot)?;
        if self.get(&key.id).await?.is_some() {
            return Ok(false);
        }

        let body = serde_json::to_vec_pretty(&key).map_err(|e| StoreError::Corrupt {
            id: key.id.clone(),
            reason: e.to_string(),
        })?;
        let staging = self
            .dir
            .join(format!(".{slot}.{}.tmp", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&staging, &body).await?;

        let linked = tokio::fs::hard_link(&staging, &target).await;
        if let Err(e) = tokio::fs::remove_file(&staging).await {
            warn!(path = %staging.display(), error = %e, "Failed to remove staging file");
        }

        match linked {
            Ok(()) => {
                debug!(slot, kid = %key.id, "Persisted signing key");
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                debug!(slot, "Key slot already filled by another writer");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self) -> Result<Vec<KeyPair>, StoreError> {
        let mut keys = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with('.') || !name.ends_with(".json") {
                continue;
            }
            let raw = tokio::fs::read(entry.path()).await?;
            let key = serde_json::from_slice::<KeyPair>(&raw).map_err(|e| StoreError::Corrupt {
                id: name.to_string(),
                reason: e.to_string(),
            })?;
            keys.push(key);
        }
        Ok(keys)
    }
}
