//! Bearer-token verification.
//!
//! # Verification flow
//!
//! 1. Read `kid` from the header. The algorithm is pinned to RS256; no other
//!    header field is trusted.
//! 2. Load the public key for that `kid` from the key store. Superseded keys
//!    remain valid for verification.
//! 3. Verify the signature, then `iss` and `exp` (no leeway).
//! 4. Project the claims into an [`AuthenticatedContext`].

use std::collections::BTreeSet;
use std::sync::Arc;

use authority_core::{ROLE_PREFIX, ScopeSet};
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::grant::error::ErrorBody;
use crate::keys::{KeyError, KeyManager};

/// Validation failures. Both map to HTTP 401.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TokenError {
    /// Malformed, unsigned, tampered, wrong issuer or unknown key.
    #[error("invalid token: {0}")]
    InvalidToken(String),

    /// Signature is fine but `exp` has passed.
    #[error("token expired")]
    ExpiredToken,
}

impl IntoResponse for TokenError {
    fn into_response(self) -> Response {
        let description = match &self {
            Self::InvalidToken(reason) => reason.clone(),
            Self::ExpiredToken => "token expired".to_string(),
        };
        let challenge = format!("Bearer error=\"invalid_token\", error_description=\"{description}\"");
        let mut response = (
            StatusCode::UNAUTHORIZED,
            Json(ErrorBody {
                error: "invalid_token",
                error_description: description,
            }),
        )
            .into_response();
        let www_authenticate = HeaderValue::from_str(&challenge)
            .unwrap_or_else(|_| HeaderValue::from_static("Bearer error=\"invalid_token\""));
        response
            .headers_mut()
            .insert(header::WWW_AUTHENTICATE, www_authenticate);
        response
    }
}

/// The caller behind a verified bearer token.
///
/// Handlers receive it explicitly as a request extension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthenticatedContext {
    /// `sub`, falling back to `user_id` then `client_id`.
    pub principal_name: String,
    /// Client the token was issued to.
    pub client_id: String,
    /// Username for user principals.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Granted scopes.
    pub scopes: ScopeSet,
    /// Roles and permissions combined.
    pub authorities: BTreeSet<String>,
    /// `jti`.
    pub token_id: String,
    /// Expiry.
    pub expires_at: DateTime<Utc>,
}

impl AuthenticatedContext {
    /// Whether the caller holds `authority` exactly.
    #[must_use]
    pub fn has_authority(&self, authority: &str) -> bool {
        self.authorities.contains(authority)
    }

    /// Whether the caller holds `role`, with or without the `ROLE_` prefix.
    #[must_use]
    pub fn has_role(&self, role: &str) -> bool {
        if role.starts_with(ROLE_PREFIX) {
            self.has_authority(role)
        } else {
            self.has_authority(&format!("{ROLE_PREFIX}{role}"))
        }
    }

    /// Whether `scope` was granted.
    #[must_use]
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.contains(scope)
    }
}

/// Claims read back from a verified token. Looser than the issued shape so
/// that the principal fallback works for tokens without `sub`.
#[derive(Debug, Deserialize)]
struct VerifiedClaims {
    exp: i64,
    #[serde(default)]
    sub: Option<String>,
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    client_id: Option<String>,
    #[serde(default)]
    jti: Option<String>,
    #[serde(default)]
    scope: ScopeSet,
    #[serde(default)]
    roles: Vec<String>,
    #[serde(default)]
    authorities: Vec<String>,
}

/// Verifies access tokens issued by this authority.
pub struct TokenValidator {
    keys: Arc<KeyManager>,
    issuer: String,
}

impl TokenValidator {
    /// Create a validator accepting tokens with `iss = issuer`.
    #[must_use]
    pub fn new(keys: Arc<KeyManager>, issuer: impl Into<String>) -> Self {
        Self {
            keys,
            issuer: issuer.into(),
        }
    }

    /// Verify `token` and return its caller context.
    pub async fn validate(&self, token: &str) -> Result<AuthenticatedContext, TokenError> {
        let header = jsonwebtoken::decode_header(token)
            .map_err(|e| TokenError::InvalidToken(format!("malformed token: {e}")))?;
        let kid = header
            .kid
            .ok_or_else(|| TokenError::InvalidToken("token has no key id".to_string()))?;

        let key = match self.keys.verification_key(&kid).await {
            Ok(key) => key,
            Err(KeyError::NotFound(_)) => {
                debug!(kid = %kid, "Token signed by unknown key");
                return Err(TokenError::InvalidToken(format!("unknown key id '{kid}'")));
            }
            Err(e) => {
                warn!(kid = %kid, error = %e, "Verification key unavailable");
                return Err(TokenError::InvalidToken("verification key unavailable".to_string()));
            }
        };

        let mut validation = Validation::new(Algorithm::RS256);
        validation.leeway = 0;
        validation.validate_aud = false;
        validation.set_issuer(&[&self.issuer]);
        validation.set_required_spec_claims(&["exp", "iss"]);

        let claims = jsonwebtoken::decode::<VerifiedClaims>(token, key.decoding_key(), &validation)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => TokenError::ExpiredToken,
                _ => TokenError::InvalidToken(e.to_string()),
            })?
            .claims;

        project(claims)
    }
}

fn project(claims: VerifiedClaims) -> Result<AuthenticatedContext, TokenError> {
    let non_empty = |v: &Option<String>| v.clone().filter(|s| !s.is_empty());
    let principal_name = non_empty(&claims.sub)
        .or_else(|| non_empty(&claims.user_id))
        .or_else(|| non_empty(&claims.client_id))
        .ok_or_else(|| TokenError::InvalidToken("token names no principal".to_string()))?;
    let expires_at = DateTime::from_timestamp(claims.exp, 0)
        .ok_or_else(|| TokenError::InvalidToken("exp out of range".to_string()))?;

    Ok(AuthenticatedContext {
        principal_name,
        client_id: claims.client_id.unwrap_or_default(),
        user_id: claims.user_id,
        scopes: claims.scope,
        authorities: claims.roles.into_iter().chain(claims.authorities).collect(),
        token_id: claims.jti.unwrap_or_default(),
        expires_at,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::time::Duration;

    use authority_core::{ClientAuthenticationMethod, GrantType, Principal, RegisteredClient};
    use jsonwebtoken::Header;

    use super::*;
    use crate::grant::AuthResult;
    use crate::keys::{InMemoryKeyStore, KeyCipher};
    use crate::token::{InMemoryAuthorizationStore, TokenIssuer};

    const ISSUER: &str = "http://localhost:9000";

    struct Fixture {
        keys: Arc<KeyManager>,
        issuer: TokenIssuer,
        validator: TokenValidator,
    }

    async fn fixture() -> Fixture {
        let keys = Arc::new(KeyManager::new(
            Arc::new(InMemoryKeyStore::new()),
            KeyCipher::new("test-secret", "test-salt").unwrap(),
        ));
        keys.bootstrap().await.unwrap();
        Fixture {
            issuer: TokenIssuer::new(
                ISSUER,
                Arc::clone(&keys),
                Arc::new(InMemoryAuthorizationStore::new()),
            ),
            validator: TokenValidator::new(Arc::clone(&keys), ISSUER),
            keys,
        }
    }

    fn admin_grant() -> AuthResult {
        AuthResult {
            client: RegisteredClient {
                client_id: "web-app".to_string(),
                authentication_method: ClientAuthenticationMethod::None,
                client_secret_hash: None,
                grant_types: BTreeSet::from([GrantType::Password]),
                scopes: ScopeSet::parse("read write"),
                access_token_ttl: Duration::from_secs(1800),
                refresh_token_ttl: Duration::from_secs(86_400),
                reuse_refresh_tokens: false,
                rate_limit: 0,
            },
            principal: Principal::User {
                username: "admin".to_string(),
                authorities: BTreeSet::from([
                    "ROLE_ADMIN".to_string(),
                    "READ_USER".to_string(),
                    "WRITE_USER".to_string(),
                ]),
            },
            scopes: ScopeSet::parse("read"),
            grant_type: GrantType::Password,
            refresh: None,
        }
    }

    async fn sign(keys: &KeyManager, claims: &serde_json::Value) -> String {
        let signer = keys.active_signing_key().await.unwrap();
        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(signer.kid.clone());
        jsonwebtoken::encode(&header, claims, signer.encoding_key()).unwrap()
    }

    #[tokio::test]
    async fn issued_token_projects_into_context() {
        let f = fixture().await;
        let issued = f.issuer.issue(&admin_grant()).await.unwrap();

        let ctx = f.validator.validate(&issued.access_token).await.unwrap();

        assert_eq!(ctx.principal_name, "admin");
        assert_eq!(ctx.client_id, "web-app");
        assert_eq!(ctx.user_id.as_deref(), Some("admin"));
        assert_eq!(ctx.token_id, issued.jti);
        assert!(ctx.has_role("ADMIN"));
        assert!(ctx.has_role("ROLE_ADMIN"));
        assert!(ctx.has_authority("WRITE_USER"));
        assert!(ctx.has_scope("read"));
        assert!(!ctx.has_scope("write"));
    }

    #[tokio::test]
    async fn token_stays_valid_after_rotation() {
        // GIVEN: a token signed by the first key
        let f = fixture().await;
        let issued = f.issuer.issue(&admin_grant()).await.unwrap();
        let original_kid = issued.kid.clone();

        // WHEN: a newer key becomes the signer
        f.keys.rotate().await.unwrap();
        let newer = f.issuer.issue(&admin_grant()).await.unwrap();

        // THEN: both tokens validate, each against the key named in its header
        assert_ne!(newer.kid, original_kid);
        assert!(f.validator.validate(&issued.access_token).await.is_ok());
        assert!(f.validator.validate(&newer.access_token).await.is_ok());
        let header = jsonwebtoken::decode_header(&issued.access_token).unwrap();
        assert_eq!(header.kid, Some(original_kid));
    }

    #[tokio::test]
    async fn expired_token_is_reported_as_expired() {
        let f = fixture().await;
        let now = Utc::now().timestamp();
        let token = sign(
            &f.keys,
            &serde_json::json!({"iss": ISSUER, "sub": "admin", "client_id": "web-app", "exp": now - 5}),
        )
        .await;

        assert_eq!(f.validator.validate(&token).await, Err(TokenError::ExpiredToken));
    }

    #[tokio::test]
    async fn tampered_token_is_invalid() {
        let f = fixture().await;
        let issued = f.issuer.issue(&admin_grant()).await.unwrap();

        // Swap the payload for one claiming a different subject
        let mut parts: Vec<&str> = issued.access_token.split('.').collect();
        let forged = base64::Engine::encode(
            &base64::engine::general_purpose::URL_SAFE_NO_PAD,
            serde_json::json!({"iss": ISSUER, "sub": "root", "exp": Utc::now().timestamp() + 600})
                .to_string(),
        );
        parts[1] = &forged;
        let tampered = parts.join(".");

        assert!(matches!(
            f.validator.validate(&tampered).await,
            Err(TokenError::InvalidToken(_))
        ));
    }

    #[tokio::test]
    async fn unknown_kid_missing_kid_and_foreign_issuer_are_invalid() {
        let f = fixture().await;
        let now = Utc::now().timestamp();
        let claims = serde_json::json!({"iss": ISSUER, "sub": "admin", "exp": now + 600});

        let signer = f.keys.active_signing_key().await.unwrap();
        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some("not-a-key".to_string());
        let unknown = jsonwebtoken::encode(&header, &claims, signer.encoding_key()).unwrap();
        let no_kid =
            jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, signer.encoding_key())
                .unwrap();
        let foreign = sign(
            &f.keys,
            &serde_json::json!({"iss": "https://elsewhere", "sub": "admin", "exp": now + 600}),
        )
        .await;

        for token in [unknown, no_kid, foreign, "garbage".to_string()] {
            assert!(matches!(
                f.validator.validate(&token).await,
                Err(TokenError::InvalidToken(_))
            ));
        }
    }

    #[tokio::test]
    async fn principal_falls_back_to_user_id_then_client_id() {
        let f = fixture().await;
        let exp = Utc::now().timestamp() + 600;

        let token = sign(
            &f.keys,
            &serde_json::json!({"iss": ISSUER, "user_id": "alice", "client_id": "web-app", "exp": exp}),
        )
        .await;
        assert_eq!(f.validator.validate(&token).await.unwrap().principal_name, "alice");

        let token = sign(
            &f.keys,
            &serde_json::json!({"iss": ISSUER, "client_id": "billing-svc", "exp": exp}),
        )
        .await;
        assert_eq!(
            f.validator.validate(&token).await.unwrap().principal_name,
            "billing-svc"
        );
    }

    #[tokio::test]
    async fn error_response_is_401_with_challenge() {
        let response = TokenError::ExpiredToken.into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(
            response
                .headers()
                .get(header::WWW_AUTHENTICATE)
                .unwrap()
                .to_str()
                .unwrap()
                .starts_with("Bearer error=\"invalid_token\"")
        );
    }
}
