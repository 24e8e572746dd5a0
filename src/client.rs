//! Registered client lookup, client authentication and per-client rate limits.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;

use authority_core::{ClientAuthenticationMethod, RegisteredClient, ScopeSet};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use dashmap::DashMap;
use governor::{
    Quota, RateLimiter,
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
};
use tracing::debug;

use crate::Result;
use crate::config::ClientConfig;
use crate::grant::OAuthError;
use crate::password::{PasswordHasher, verify_password};

type ClientRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Credentials a caller presented for itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientCredentials {
    /// Claimed client id.
    pub client_id: String,
    /// Secret, when sent via HTTP Basic.
    pub client_secret: Option<String>,
}

impl ClientCredentials {
    /// Public-client credentials (id only).
    #[must_use]
    pub fn public(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: None,
        }
    }

    /// Parse an `Authorization: Basic <base64(id:secret)>` header value.
    #[must_use]
    pub fn from_basic_header(value: &str) -> Option<Self> {
        let (scheme, encoded) = value.trim().split_once(' ')?;
        if !scheme.eq_ignore_ascii_case("basic") {
            return None;
        }
        let decoded = BASE64.decode(encoded.trim()).ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        let (id, secret) = decoded.split_once(':')?;
        if id.is_empty() {
            return None;
        }
        Some(Self {
            client_id: id.to_string(),
            client_secret: (!secret.is_empty()).then(|| secret.to_string()),
        })
    }
}

/// Registered clients, seeded at startup.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: HashMap<String, RegisteredClient>,
}

impl ClientRegistry {
    /// Build from already-resolved clients.
    pub fn new(clients: impl IntoIterator<Item = RegisteredClient>) -> Self {
        Self {
            clients: clients
                .into_iter()
                .map(|c| (c.client_id.clone(), c))
                .collect(),
        }
    }

    /// Build from configuration, hashing plaintext secrets.
    pub fn from_config(configs: &[ClientConfig], hasher: &PasswordHasher) -> Result<Self> {
        let mut clients = Vec::with_capacity(configs.len());
        for config in configs {
            let client_secret_hash = config
                .client_secret
                .as_deref()
                .filter(|s| !s.is_empty())
                .map(|s| hasher.hash_if_plain(s))
                .transpose()?;
            clients.push(RegisteredClient {
                client_id: config.client_id.clone(),
                authentication_method: config.authentication_method,
                client_secret_hash,
                grant_types: config.grant_types.iter().copied().collect(),
                scopes: config.scopes.iter().cloned().collect::<ScopeSet>(),
                access_token_ttl: config.access_token_ttl,
                refresh_token_ttl: config.refresh_token_ttl,
                reuse_refresh_tokens: config.reuse_refresh_tokens,
                rate_limit: config.rate_limit,
            });
        }
        Ok(Self::new(clients))
    }

    /// Look up a client.
    #[must_use]
    pub fn get(&self, client_id: &str) -> Option<&RegisteredClient> {
        self.clients.get(client_id)
    }

    /// All registered clients.
    pub fn iter(&self) -> impl Iterator<Item = &RegisteredClient> {
        self.clients.values()
    }

    /// Authenticate `credentials` according to the client's method.
    ///
    /// `private_key_jwt` clients cannot authenticate here; they only use the
    /// jwt-bearer grant, which carries its own assertion.
    pub async fn authenticate(
        &self,
        credentials: &ClientCredentials,
    ) -> std::result::Result<RegisteredClient, OAuthError> {
        let client = self
            .get(&credentials.client_id)
            .ok_or_else(|| OAuthError::InvalidClient("unknown client".to_string()))?;

        match client.authentication_method {
            ClientAuthenticationMethod::None => Ok(client.clone()),
            ClientAuthenticationMethod::PrivateKeyJwt => Err(OAuthError::InvalidClient(
                "client must authenticate with a signed assertion".to_string(),
            )),
            ClientAuthenticationMethod::ClientSecretBasic => {
                let (Some(secret), Some(hash)) = (
                    credentials.client_secret.clone(),
                    client.client_secret_hash.clone(),
                ) else {
                    return Err(OAuthError::InvalidClient(
                        "client authentication required".to_string(),
                    ));
                };
                let matches = tokio::task::spawn_blocking(move || verify_password(&secret, &hash))
                    .await
                    .map_err(|e| OAuthError::ServerError(e.to_string()))?;
                if matches {
                    Ok(client.clone())
                } else {
                    debug!(client_id = %client.client_id, "Client secret mismatch");
                    Err(OAuthError::InvalidClient(
                        "client authentication failed".to_string(),
                    ))
                }
            }
        }
    }
}

/// Per-client token endpoint rate limiting.
pub struct ClientRateLimits {
    limiters: DashMap<String, Arc<ClientRateLimiter>>,
}

impl ClientRateLimits {
    /// One limiter per client with a non-zero `rate_limit`.
    #[must_use]
    pub fn new(registry: &ClientRegistry) -> Self {
        let limiters = DashMap::new();
        for client in registry.iter() {
            if let Some(quota) = NonZeroU32::new(client.rate_limit) {
                limiters.insert(
                    client.client_id.clone(),
                    Arc::new(RateLimiter::direct(Quota::per_minute(quota))),
                );
            }
        }
        Self { limiters }
    }

    /// Take one request from the client's budget.
    pub fn check(&self, client_id: &str) -> std::result::Result<(), OAuthError> {
        match self.limiters.get(client_id) {
            Some(limiter) if limiter.check().is_err() => Err(OAuthError::RateLimited(format!(
                "too many token requests for client '{client_id}'"
            ))),
            _ => Ok(()),
        }
    }
}
