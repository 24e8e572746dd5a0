//! Authorization store: the record of every grant that produced tokens.
//!
//! An [`Authorization`] ties an access token (and optionally a refresh token)
//! to the client and principal it was issued for. It backs refresh-token
//! exchange, revocation and introspection. The token validator checks
//! signatures without it; the bearer middleware asks it about revocation.
//!
//! Records are indexed by access token value and by refresh token value.
//! [`InMemoryAuthorizationStore`] keeps them in process memory;
//! [`FileAuthorizationStore`] also writes every change to a JSON snapshot so
//! refresh tokens and revocations survive a restart.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use authority_core::{GrantType, Principal, ScopeSet};
use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, info, warn};

use crate::error::StoreError;

/// The access token half of an authorization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessTokenRecord {
    /// Compact JWS value.
    pub value: String,
    /// `jti` claim.
    pub jti: String,
    /// Issued-at.
    pub issued_at: DateTime<Utc>,
    /// Expiry.
    pub expires_at: DateTime<Utc>,
    /// Granted scopes.
    pub scopes: ScopeSet,
    /// Set by revocation.
    #[serde(default)]
    pub revoked: bool,
}

/// The refresh token half of an authorization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshTokenRecord {
    /// Opaque value (`rt_<base64url>`).
    pub value: String,
    /// Issued-at.
    pub issued_at: DateTime<Utc>,
    /// Expiry.
    pub expires_at: DateTime<Utc>,
    /// Set when exchanged or revoked.
    #[serde(default)]
    pub invalidated: bool,
}

impl RefreshTokenRecord {
    /// Generate a fresh refresh token valid for `ttl` from `now`.
    #[must_use]
    pub fn generate(now: DateTime<Utc>, ttl: Duration) -> Self {
        let random_bytes: [u8; 32] = rand::random();
        Self {
            value: format!(
                "rt_{}",
                base64::Engine::encode(
                    &base64::engine::general_purpose::URL_SAFE_NO_PAD,
                    random_bytes,
                )
            ),
            issued_at: now,
            expires_at: expiry(now, ttl),
            invalidated: false,
        }
    }

    /// Whether the token can still be exchanged at `now`.
    #[must_use]
    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        !self.invalidated && now < self.expires_at
    }
}

/// `now + ttl`, saturating at the latest representable instant.
#[must_use]
pub fn expiry(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// The refresh token a refresh exchange consumes.
///
/// Names the record the token was read from, so a save based on a stale
/// read is detected even when the token value itself is carried over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumedRefreshToken<'a> {
    /// Authorization the token was read from.
    pub authorization_id: &'a str,
    /// Refresh token value.
    pub value: &'a str,
}

/// A persisted grant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Authorization {
    /// Record id.
    pub id: String,
    /// Client the tokens were issued to.
    pub registered_client_id: String,
    /// Principal name (token subject).
    pub principal_name: String,
    /// Full principal, for re-issuing on refresh.
    pub principal: Principal,
    /// Grant that produced the record.
    pub grant_type: GrantType,
    /// Access token.
    pub access_token: AccessTokenRecord,
    /// Refresh token, when the client is allowed one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<RefreshTokenRecord>,
}

impl Authorization {
    /// Whether the access token is neither revoked nor expired at `now`.
    #[must_use]
    pub fn access_token_active(&self, now: DateTime<Utc>) -> bool {
        !self.access_token.revoked && now < self.access_token.expires_at
    }

    /// Whether nothing in the record can be used any more.
    #[must_use]
    pub fn is_spent(&self, now: DateTime<Utc>) -> bool {
        let access_done = self.access_token.revoked || now >= self.access_token.expires_at;
        let refresh_done = self
            .refresh_token
            .as_ref()
            .is_none_or(|r| !r.is_usable(now));
        access_done && refresh_done
    }
}

/// Trait abstracting the authorization storage backend.
#[async_trait::async_trait]
pub trait AuthorizationStore: Send + Sync + 'static {
    /// Persist a new authorization.
    ///
    /// When `consumes` is set, that refresh token is invalidated in the same
    /// atomic step. If it is unknown, already invalidated, or now belongs to
    /// a different record than the one it was read from, the save fails with
    /// [`StoreError::Conflict`] and nothing is written. A refresh token read
    /// once can therefore be exchanged at most once.
    async fn save(
        &self,
        authorization: Authorization,
        consumes: Option<ConsumedRefreshToken<'_>>,
    ) -> Result<(), StoreError>;

    /// Look up by access token value.
    async fn find_by_access_token(&self, token: &str) -> Result<Option<Authorization>, StoreError>;

    /// Look up by refresh token value.
    async fn find_by_refresh_token(&self, token: &str)
    -> Result<Option<Authorization>, StoreError>;

    /// Revoke the authorization holding `token` (access or refresh value).
    ///
    /// Both halves become unusable. Returns the revoked record, or `None`
    /// when the token is unknown.
    async fn revoke(&self, token: &str) -> Result<Option<Authorization>, StoreError>;

    /// Drop records with nothing usable left. Returns how many were removed.
    async fn remove_spent(&self, now: DateTime<Utc>) -> Result<usize, StoreError>;
}

#[derive(Debug, Default, Clone)]
struct Records {
    by_id: HashMap<String, Authorization>,
    by_access: HashMap<String, String>,
    by_refresh: HashMap<String, String>,
}

impl Records {
    fn from_snapshot(authorizations: Vec<Authorization>) -> Self {
        let mut records = Self::default();
        for authorization in authorizations {
            records.index(authorization);
        }
        records
    }

    fn snapshot(&self) -> Vec<&Authorization> {
        let mut all: Vec<&Authorization> = self.by_id.values().collect();
        all.sort_by(|a, b| a.access_token.issued_at.cmp(&b.access_token.issued_at));
        all
    }

    fn index(&mut self, authorization: Authorization) {
        let id = authorization.id.clone();
        self.by_access
            .insert(authorization.access_token.value.clone(), id.clone());
        if let Some(refresh) = authorization.refresh_token.as_ref().filter(|r| !r.invalidated) {
            self.by_refresh.insert(refresh.value.clone(), id.clone());
        }
        self.by_id.insert(id, authorization);
    }

    fn lookup(&self, index: &HashMap<String, String>, token: &str) -> Option<Authorization> {
        index.get(token).and_then(|id| self.by_id.get(id)).cloned()
    }

    fn save(
        &mut self,
        authorization: Authorization,
        consumes: Option<ConsumedRefreshToken<'_>>,
    ) -> Result<(), StoreError> {
        if let Some(consumed) = consumes {
            if self.by_refresh.get(consumed.value).map(String::as_str)
                != Some(consumed.authorization_id)
            {
                return Err(StoreError::Conflict(
                    "refresh token already exchanged".to_string(),
                ));
            }
            let prior = self
                .by_id
                .get_mut(consumed.authorization_id)
                .and_then(|a| a.refresh_token.as_mut())
                .ok_or_else(|| StoreError::Conflict("refresh token not found".to_string()))?;
            if prior.invalidated {
                return Err(StoreError::Conflict(
                    "refresh token already exchanged".to_string(),
                ));
            }
            prior.invalidated = true;
            self.by_refresh.remove(consumed.value);
        }

        self.index(authorization);
        Ok(())
    }

    fn revoke(&mut self, token: &str) -> Option<Authorization> {
        let id = self
            .by_access
            .get(token)
            .or_else(|| self.by_refresh.get(token))
            .cloned()?;
        let authorization = self.by_id.get_mut(&id)?;
        authorization.access_token.revoked = true;
        if let Some(refresh) = authorization.refresh_token.as_mut() {
            refresh.invalidated = true;
        }
        Some(authorization.clone())
    }

    fn remove_spent(&mut self, now: DateTime<Utc>) -> usize {
        let spent: Vec<String> = self
            .by_id
            .values()
            .filter(|a| a.is_spent(now))
            .map(|a| a.id.clone())
            .collect();

        for id in &spent {
            if let Some(authorization) = self.by_id.remove(id) {
                self.by_access.remove(&authorization.access_token.value);
                if let Some(refresh) = &authorization.refresh_token {
                    if self.by_refresh.get(&refresh.value) == Some(id) {
                        self.by_refresh.remove(&refresh.value);
                    }
                }
                debug!(id = %id, "Reaped spent authorization");
            }
        }
        spent.len()
    }
}

/// In-memory authorization store. A single lock covers all indices so that
/// invalidate-and-insert is atomic.
#[derive(Default)]
pub struct InMemoryAuthorizationStore {
    records: RwLock<Records>,
}

impl InMemoryAuthorizationStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.read().by_id.len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait::async_trait]
impl AuthorizationStore for InMemoryAuthorizationStore {
    async fn save(
        &self,
        authorization: Authorization,
        consumes: Option<ConsumedRefreshToken<'_>>,
    ) -> Result<(), StoreError> {
        self.records.write().save(authorization, consumes)
    }

    async fn find_by_access_token(&self, token: &str) -> Result<Option<Authorization>, StoreError> {
        let records = self.records.read();
        Ok(records.lookup(&records.by_access, token))
    }

    async fn find_by_refresh_token(
        &self,
        token: &str,
    ) -> Result<Option<Authorization>, StoreError> {
        let records = self.records.read();
        Ok(records.lookup(&records.by_refresh, token))
    }

    async fn revoke(&self, token: &str) -> Result<Option<Authorization>, StoreError> {
        Ok(self.records.write().revoke(token))
    }

    async fn remove_spent(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        Ok(self.records.write().remove_spent(now))
    }
}

/// On-disk snapshot layout.
#[derive(Serialize)]
struct SnapshotRef<'a> {
    authorizations: Vec<&'a Authorization>,
}

#[derive(Deserialize)]
struct Snapshot {
    #[serde(default)]
    authorizations: Vec<Authorization>,
}

/// File-backed authorization store.
///
/// Records live in memory and every mutation rewrites a JSON snapshot
/// (`{"authorizations": [...]}`), staged in a temporary file and renamed into
/// place so a crash never leaves a half-written snapshot. A mutation is applied
/// to a copy of the records and only becomes visible once the snapshot is on
/// disk; if the write fails the store is unchanged and the caller gets the
/// error. One process owns the file.
pub struct FileAuthorizationStore {
    path: PathBuf,
    records: Mutex<Records>,
}

impl FileAuthorizationStore {
    /// Open the snapshot at `path`, starting empty when it does not exist.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let records = match tokio::fs::read(&path).await {
            Ok(raw) => {
                let snapshot: Snapshot =
                    serde_json::from_slice(&raw).map_err(|e| StoreError::Corrupt {
                        id: path.display().to_string(),
                        reason: e.to_string(),
                    })?;
                Records::from_snapshot(snapshot.authorizations)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Records::default(),
            Err(e) => return Err(e.into()),
        };
        info!(path = %path.display(), records = records.by_id.len(), "Opened authorization store");

        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    /// Snapshot file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of stored records.
    pub async fn record_count(&self) -> usize {
        self.records.lock().await.by_id.len()
    }

    async fn persist(&self, records: &Records) -> Result<(), StoreError> {
        let body = serde_json::to_vec_pretty(&SnapshotRef {
            authorizations: records.snapshot(),
        })
        .map_err(|e| StoreError::Corrupt {
            id: self.path.display().to_string(),
            reason: e.to_string(),
        })?;

        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "authorizations.json".to_string());
        let staging = self.path.with_file_name(format!(
            ".{file_name}.{}.tmp",
            uuid::Uuid::new_v4().simple()
        ));
        tokio::fs::write(&staging, &body).await?;
        if let Err(e) = tokio::fs::rename(&staging, &self.path).await {
            if let Err(cleanup) = tokio::fs::remove_file(&staging).await {
                warn!(path = %staging.display(), error = %cleanup, "Failed to remove staging file");
            }
            return Err(e.into());
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl AuthorizationStore for FileAuthorizationStore {
    async fn save(
        &self,
        authorization: Authorization,
        consumes: Option<ConsumedRefreshToken<'_>>,
    ) -> Result<(), StoreError> {
        let mut records = self.records.lock().await;
        let mut next = records.clone();
        next.save(authorization, consumes)?;
        self.persist(&next).await?;
        *records = next;
        Ok(())
    }

    async fn find_by_access_token(&self, token: &str) -> Result<Option<Authorization>, StoreError> {
        let records = self.records.lock().await;
        Ok(records.lookup(&records.by_access, token))
    }

    async fn find_by_refresh_token(
        &self,
        token: &str,
    ) -> Result<Option<Authorization>, StoreError> {
        let records = self.records.lock().await;
        Ok(records.lookup(&records.by_refresh, token))
    }

    async fn revoke(&self, token: &str) -> Result<Option<Authorization>, StoreError> {
        let mut records = self.records.lock().await;
        let mut next = records.clone();
        let Some(revoked) = next.revoke(token) else {
            return Ok(None);
        };
        self.persist(&next).await?;
        *records = next;
        Ok(Some(revoked))
    }

    async fn remove_spent(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut records = self.records.lock().await;
        let mut next = records.clone();
        let removed = next.remove_spent(now);
        if removed > 0 {
            self.persist(&next).await?;
            *records = next;
        }
        Ok(removed)
    }
}

/// Spawn a background task that drops spent authorizations every `interval`.
///
/// The task exits when the `shutdown` receiver fires.
pub fn spawn_reaper(
    store: Arc<dyn AuthorizationStore>,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match store.remove_spent(Utc::now()).await {
                        Ok(0) => {}
                        Ok(reaped) => debug!(count = reaped, "Reaped spent authorizations"),
                        Err(e) => warn!(error = %e, "Authorization reaper failed"),
                    }
                }
                _ = shutdown.recv() => {
                    debug!("Authorization reaper shutting down");
                    break;
                }
            }
        }
    })
}
