//! JWT-bearer grant (RFC 7523 §2.1), self-asserted by a machine client.
//!
//! The assertion must be signed by one of the authority's own keys: the
//! authority hands assertions to trusted services ([`mint_assertion`], the
//! `mint-assertion` CLI command) and later exchanges them for access tokens.
//! Checks, in order: signature and `kid`, `iss`, `sub`, `exp`.

use std::sync::Arc;
use std::time::Duration;

use authority_core::{GrantType, Principal};
use chrono::Utc;
use jsonwebtoken::{Algorithm, Header, Validation};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{AuthResult, GrantHandler, OAuthError, TokenRequest};
use crate::client::ClientRegistry;
use crate::keys::{KeyError, KeyManager};

#[derive(Debug, Serialize, Deserialize)]
struct AssertionClaims {
    iss: String,
    sub: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    exp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    iat: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    jti: Option<String>,
}

/// `grant_type=urn:ietf:params:oauth:grant-type:jwt-bearer`.
pub struct JwtBearerGrant {
    clients: Arc<ClientRegistry>,
    keys: Arc<KeyManager>,
    issuer: String,
}

impl JwtBearerGrant {
    /// Create the handler. `issuer` must equal the assertions' `iss`.
    #[must_use]
    pub fn new(clients: Arc<ClientRegistry>, keys: Arc<KeyManager>, issuer: impl Into<String>) -> Self {
        Self {
            clients,
            keys,
            issuer: issuer.into(),
        }
    }

    async fn verify_assertion(&self, assertion: &str) -> Result<AssertionClaims, OAuthError> {
        let header = jsonwebtoken::decode_header(assertion)
            .map_err(|e| OAuthError::InvalidRequest(format!("malformed assertion: {e}")))?;
        let kid = header
            .kid
            .ok_or_else(|| OAuthError::InvalidRequest("assertion has no key id".to_string()))?;
        let key = match self.keys.verification_key(&kid).await {
            Ok(key) => key,
            Err(KeyError::NotFound(_)) => {
                return Err(OAuthError::InvalidRequest(format!(
                    "assertion signed by unknown key '{kid}'"
                )));
            }
            Err(e) => return Err(e.into()),
        };

        // exp is checked separately so that expiry maps to invalid_token
        let mut validation = Validation::new(Algorithm::RS256);
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.required_spec_claims.clear();

        jsonwebtoken::decode::<AssertionClaims>(assertion, key.decoding_key(), &validation)
            .map(|data| data.claims)
            .map_err(|e| OAuthError::InvalidRequest(format!("assertion verification failed: {e}")))
    }
}

#[async_trait::async_trait]
impl GrantHandler for JwtBearerGrant {
    fn grant_type(&self) -> GrantType {
        GrantType::JwtBearer
    }

    async fn authenticate(&self, request: &TokenRequest) -> Result<AuthResult, OAuthError> {
        let client_id = request
            .claimed_client_id()
            .ok_or_else(|| OAuthError::InvalidRequest("missing required parameter 'client_id'".to_string()))?;
        let client = self
            .clients
            .get(client_id)
            .cloned()
            .ok_or_else(|| OAuthError::InvalidClient("unknown client".to_string()))?;
        if !client.allows_grant(GrantType::JwtBearer) {
            return Err(OAuthError::UnauthorizedClient(format!(
                "client '{client_id}' may not use the jwt-bearer grant"
            )));
        }

        let assertion = TokenRequest::require(request.assertion.as_ref(), "assertion")?;
        let claims = self.verify_assertion(assertion).await?;

        if claims.iss != self.issuer {
            debug!(expected = %self.issuer, actual = %claims.iss, "Assertion issuer mismatch");
            return Err(OAuthError::InvalidRequest("assertion issuer mismatch".to_string()));
        }
        if !claims.sub.contains(client_id) {
            return Err(OAuthError::InvalidRequest(
                "assertion subject does not match client".to_string(),
            ));
        }
        match claims.exp {
            None => {
                return Err(OAuthError::InvalidRequest("assertion has no exp".to_string()));
            }
            Some(exp) if exp <= Utc::now().timestamp() => {
                return Err(OAuthError::InvalidToken("assertion expired".to_string()));
            }
            Some(_) => {}
        }

        let principal = Principal::Client {
            client_id: client.client_id.clone(),
            authorities: client.scopes.iter().map(str::to_string).collect(),
        };
        let scopes = client.scopes.clone();

        Ok(AuthResult {
            client,
            principal,
            scopes,
            grant_type: GrantType::JwtBearer,
            refresh: None,
        })
    }
}

/// Sign an assertion for `client_id` with the active key, valid for `ttl`.
pub async fn mint_assertion(
    keys: &KeyManager,
    issuer: &str,
    client_id: &str,
    ttl: Duration,
) -> Result<String, KeyError> {
    let signer = keys.active_signing_key().await?;
    let now = Utc::now().timestamp();
    let lifetime = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
    let claims = AssertionClaims {
        iss: issuer.to_string(),
        sub: client_id.to_string(),
        exp: Some(now.saturating_add(lifetime)),
        iat: Some(now),
        jti: Some(uuid::Uuid::new_v4().to_string()),
    };
    let mut header = Header::new(Algorithm::RS256);
    header.kid = Some(signer.kid.clone());
    jsonwebtoken::encode(&header, &claims, signer.encoding_key())
        .map_err(|e| KeyError::Crypto(format!("assertion signing failed: {e}")))
}
