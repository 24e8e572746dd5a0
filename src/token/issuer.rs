//! Token issuance.

use std::sync::Arc;

use authority_core::{AccessTokenClaims, ClaimsCustomizer, GrantType};
use chrono::{TimeDelta, Utc};
use jsonwebtoken::{Algorithm, Header};
use serde::Serialize;
use tracing::debug;

use super::authorization::{
    AccessTokenRecord, Authorization, AuthorizationStore, ConsumedRefreshToken, RefreshTokenRecord,
};
use crate::error::StoreError;
use crate::grant::{AuthResult, OAuthError};
use crate::keys::KeyManager;

/// Successful token response (RFC 6749 §5.1).
#[derive(Debug, Clone, Serialize)]
pub struct IssuedTokens {
    /// Signed JWT.
    pub access_token: String,
    /// Always `Bearer`.
    pub token_type: &'static str,
    /// Access token lifetime in seconds.
    pub expires_in: u64,
    /// Granted scopes, space-joined.
    pub scope: String,
    /// Opaque refresh token, when the client may refresh.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// `jti` of the access token.
    #[serde(skip)]
    pub jti: String,
    /// Key that signed the access token.
    #[serde(skip)]
    pub kid: String,
    /// Persisted authorization record.
    #[serde(skip)]
    pub authorization_id: String,
}

/// Signs access tokens and records the authorization.
pub struct TokenIssuer {
    issuer: String,
    keys: Arc<KeyManager>,
    authorizations: Arc<dyn AuthorizationStore>,
}

impl TokenIssuer {
    /// Create an issuer stamping `iss = issuer`.
    #[must_use]
    pub fn new(
        issuer: impl Into<String>,
        keys: Arc<KeyManager>,
        authorizations: Arc<dyn AuthorizationStore>,
    ) -> Self {
        Self {
            issuer: issuer.into(),
            keys,
            authorizations,
        }
    }

    /// Issuer identifier stamped into `iss`.
    #[must_use]
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// Mint tokens for an authenticated grant.
    ///
    /// The authorization record is saved before anything is returned; if the
    /// save fails the signed token is dropped. A refresh token that was
    /// already exchanged by a concurrent request yields `invalid_grant`.
    pub async fn issue(&self, auth: &AuthResult) -> Result<IssuedTokens, OAuthError> {
        let now = Utc::now();
        let client = &auth.client;

        let custom = ClaimsCustomizer::customize(
            &auth.principal,
            client,
            &auth.scopes,
            auth.grant_type,
            now,
        );
        let signer = self.keys.active_signing_key().await?;

        let expires_at = TimeDelta::from_std(client.access_token_ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .ok_or_else(|| OAuthError::ServerError("access token ttl out of range".to_string()))?;
        let jti = custom.jti.clone();
        let claims = AccessTokenClaims {
            iss: self.issuer.clone(),
            exp: expires_at.timestamp(),
            custom,
        };

        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(signer.kid.clone());
        let access_token = jsonwebtoken::encode(&header, &claims, signer.encoding_key())
            .map_err(|e| OAuthError::ServerError(format!("token signing failed: {e}")))?;

        let refresh_token = self.refresh_token_for(auth, now);
        let authorization = Authorization {
            id: uuid::Uuid::new_v4().to_string(),
            registered_client_id: client.client_id.clone(),
            principal_name: auth.principal.name().to_string(),
            principal: auth.principal.clone(),
            grant_type: auth.grant_type,
            access_token: AccessTokenRecord {
                value: access_token.clone(),
                jti: jti.clone(),
                issued_at: now,
                expires_at,
                scopes: auth.scopes.clone(),
                revoked: false,
            },
            refresh_token: refresh_token.clone(),
        };
        let authorization_id = authorization.id.clone();
        let consumes = auth.refresh.as_ref().map(|r| ConsumedRefreshToken {
            authorization_id: &r.authorization_id,
            value: &r.previous.value,
        });

        self.authorizations
            .save(authorization, consumes)
            .await
            .map_err(|e| match e {
                StoreError::Conflict(reason) => {
                    debug!(reason = %reason, "Refresh token exchange lost a race");
                    OAuthError::InvalidGrant("refresh token already used".to_string())
                }
                other => other.into(),
            })?;

        Ok(IssuedTokens {
            access_token,
            token_type: "Bearer",
            expires_in: client.access_token_ttl.as_secs(),
            scope: auth.scopes.to_scope_string(),
            refresh_token: refresh_token.map(|r| r.value),
            jti,
            kid: signer.kid.clone(),
            authorization_id,
        })
    }

    /// Refresh token to hand out alongside the access token.
    ///
    /// jwt-bearer never gets one. On a refresh exchange a client with
    /// `reuse_refresh_tokens` keeps the presented token (and its expiry);
    /// everyone else gets a new one.
    fn refresh_token_for(
        &self,
        auth: &AuthResult,
        now: chrono::DateTime<Utc>,
    ) -> Option<RefreshTokenRecord> {
        if auth.grant_type == GrantType::JwtBearer || !auth.client.issues_refresh_tokens() {
            return None;
        }
        match &auth.refresh {
            Some(context) if auth.client.reuse_refresh_tokens => Some(RefreshTokenRecord {
                invalidated: false,
                ..context.previous.clone()
            }),
            _ => Some(RefreshTokenRecord::generate(now, auth.client.refresh_token_ttl)),
        }
    }
}
