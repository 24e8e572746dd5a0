//! Registered OAuth2 clients.

use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::grant_type::GrantType;
use crate::scope::ScopeSet;

/// How a client proves its identity at the token endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientAuthenticationMethod {
    /// Public client: the `client_id` alone identifies it.
    #[default]
    None,
    /// Confidential client: HTTP Basic `client_id:client_secret`.
    ClientSecretBasic,
    /// The client authenticates by presenting a signed assertion.
    PrivateKeyJwt,
}

/// A client allowed to request tokens. Immutable for the lifetime of a request.
#[derive(Debug, Clone)]
pub struct RegisteredClient {
    /// Public identifier.
    pub client_id: String,
    /// Authentication method.
    pub authentication_method: ClientAuthenticationMethod,
    /// Argon2 PHC hash of the client secret (confidential clients only).
    pub client_secret_hash: Option<String>,
    /// Grants this client may use.
    pub grant_types: BTreeSet<GrantType>,
    /// Scopes this client may be granted.
    pub scopes: ScopeSet,
    /// Access token lifetime.
    pub access_token_ttl: Duration,
    /// Refresh token lifetime.
    pub refresh_token_ttl: Duration,
    /// `true` keeps the same refresh token across exchanges; `false` rotates it.
    pub reuse_refresh_tokens: bool,
    /// Token endpoint requests per minute (0 = unlimited).
    pub rate_limit: u32,
}

impl RegisteredClient {
    /// Whether the client may use `grant`.
    #[must_use]
    pub fn allows_grant(&self, grant: GrantType) -> bool {
        self.grant_types.contains(&grant)
    }

    /// Whether tokens issued to this client come with a refresh token.
    #[must_use]
    pub fn issues_refresh_tokens(&self) -> bool {
        self.allows_grant(GrantType::RefreshToken)
    }
}
