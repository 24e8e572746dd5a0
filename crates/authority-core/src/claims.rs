//! Claim shaping for issued access tokens.
//!
//! [`ClaimsCustomizer::customize`] is a pure function of its inputs apart from
//! the fresh `jti`. The signer wraps the result in [`AccessTokenClaims`],
//! adding `iss` and `exp`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::client::RegisteredClient;
use crate::grant_type::GrantType;
use crate::principal::{Principal, ROLE_PREFIX};
use crate::scope::ScopeSet;

/// Authority-specific claims carried by every access token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomClaims {
    /// Principal name (username or client id).
    pub sub: String,
    /// Unique token id.
    pub jti: String,
    /// Issued-at (Unix seconds).
    pub iat: i64,
    /// Client the token was issued to.
    pub client_id: String,
    /// Username, present for user principals only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Granted scopes, space-joined on the wire.
    #[serde(default)]
    pub scope: ScopeSet,
    /// Grant that produced the token.
    pub grant_type: String,
    /// Authorities with the `ROLE_` prefix.
    #[serde(default)]
    pub roles: Vec<String>,
    /// All remaining authorities.
    #[serde(default)]
    pub authorities: Vec<String>,
}

/// Full signed payload: custom claims plus the registered `iss` / `exp`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessTokenClaims {
    /// Issuer identifier.
    pub iss: String,
    /// Expiry (Unix seconds).
    pub exp: i64,
    /// Everything else.
    #[serde(flatten)]
    pub custom: CustomClaims,
}

/// Builds [`CustomClaims`] from an authenticated grant.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClaimsCustomizer;

impl ClaimsCustomizer {
    /// Shape the claims for a token issued to `principal` via `client`.
    ///
    /// Machine clients additionally receive a synthesized
    /// `ROLE_<CLIENT_ID>` role (see [`client_role`]).
    #[must_use]
    pub fn customize(
        principal: &Principal,
        client: &RegisteredClient,
        scopes: &ScopeSet,
        grant_type: GrantType,
        issued_at: DateTime<Utc>,
    ) -> CustomClaims {
        let (mut roles, authorities) = principal.split_authorities();

        let user_id = match principal {
            Principal::User { username, .. } => Some(username.clone()),
            Principal::Client { client_id, .. } => {
                roles.insert(client_role(client_id));
                None
            }
        };

        CustomClaims {
            sub: principal.name().to_string(),
            jti: uuid::Uuid::new_v4().to_string(),
            iat: issued_at.timestamp(),
            client_id: client.client_id.clone(),
            user_id,
            scope: scopes.clone(),
            grant_type: grant_type.as_str().to_string(),
            roles: roles.into_iter().collect(),
            authorities: authorities.into_iter().collect(),
        }
    }
}

/// Role synthesized for a machine client: `ROLE_` followed by the client id
/// uppercased, with every non-alphanumeric character replaced by `_`.
#[must_use]
pub fn client_role(client_id: &str) -> String {
    let normalized: String = client_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("{ROLE_PREFIX}{normalized}")
}
