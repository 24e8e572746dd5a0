//! Resource-owner lookup.
//!
//! [`PrincipalStore`] is the seam to whatever owns user accounts. The
//! authority ships an in-memory implementation seeded from configuration.

use std::collections::{BTreeSet, HashMap};

use authority_core::Principal;
use tokio::task::JoinError;
use tracing::{debug, warn};

use crate::Result;
use crate::config::UserConfig;
use crate::grant::OAuthError;
use crate::password::{PasswordHasher, dummy_hash, verify_password};

/// A stored resource owner.
#[derive(Debug, Clone)]
pub struct UserRecord {
    /// Login name.
    pub username: String,
    /// Argon2 PHC hash.
    pub password_hash: String,
    /// Roles and permissions.
    pub authorities: BTreeSet<String>,
    /// Disabled users cannot authenticate.
    pub enabled: bool,
}

/// Username → credentials + authorities.
#[async_trait::async_trait]
pub trait PrincipalStore: Send + Sync + 'static {
    /// Look up a user by login name.
    async fn find_by_username(&self, username: &str) -> Option<UserRecord>;

    /// Hash verified when the username matches no account.
    fn dummy_hash(&self) -> &str {
        dummy_hash()
    }

    /// Verify a username/password pair.
    ///
    /// Returns `Ok(None)` for unknown users, disabled users and wrong
    /// passwords alike, and runs one argon2 verification in every case, so
    /// callers cannot tell them apart by answer or by timing.
    ///
    /// # Errors
    ///
    /// [`OAuthError::ServerError`] when the verification task dies.
    async fn authenticate(
        &self,
        username: &str,
        password: &str,
    ) -> std::result::Result<Option<Principal>, OAuthError> {
        let user = self.find_by_username(username).await;
        let hash = match &user {
            Some(user) => user.password_hash.clone(),
            None => self.dummy_hash().to_string(),
        };

        let password = password.to_string();
        let joined = tokio::task::spawn_blocking(move || verify_password(&password, &hash)).await;
        let matches = verification_outcome(joined)?;

        let Some(user) = user else {
            debug!(username, "Login attempt for unknown user");
            return Ok(None);
        };
        if !user.enabled {
            debug!(username, "Login attempt for disabled user");
            return Ok(None);
        }
        Ok(matches.then(|| Principal::User {
            username: user.username,
            authorities: user.authorities,
        }))
    }
}

/// Surface a failed verification task instead of reading it as a mismatch.
fn verification_outcome(
    joined: std::result::Result<bool, JoinError>,
) -> std::result::Result<bool, OAuthError> {
    joined.map_err(|e| {
        warn!(error = %e, "Password verification task failed");
        OAuthError::ServerError("password verification failed".to_string())
    })
}

/// In-memory principal store.
#[derive(Debug, Default)]
pub struct InMemoryPrincipalStore {
    users: HashMap<String, UserRecord>,
}

impl InMemoryPrincipalStore {
    /// Build from already-hashed records.
    pub fn new(users: impl IntoIterator<Item = UserRecord>) -> Self {
        Self {
            users: users
                .into_iter()
                .map(|u| (u.username.clone(), u))
                .collect(),
        }
    }

    /// Build from configuration, hashing plaintext passwords.
    pub fn from_config(users: &[UserConfig], hasher: &PasswordHasher) -> Result<Self> {
        let mut records = Vec::with_capacity(users.len());
        for user in users {
            records.push(UserRecord {
                username: user.username.clone(),
                password_hash: hasher.hash_if_plain(&user.password)?,
                authorities: user.authorities.iter().cloned().collect(),
                enabled: user.enabled,
            });
        }
        Ok(Self::new(records))
    }

    /// Number of users.
    #[must_use]
    pub fn len(&self) -> usize {
        self.users.len()
    }

    /// Whether no users are configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

#[async_trait::async_trait]
impl PrincipalStore for InMemoryPrincipalStore {
    async fn find_by_username(&self, username: &str) -> Option<UserRecord> {
        self.users.get(username).cloned()
    }
}
