//! Refresh-token grant (RFC 6749 §6).

use std::sync::Arc;

use authority_core::{ClientAuthenticationMethod, GrantType};
use chrono::Utc;

use super::{AuthResult, GrantHandler, OAuthError, RefreshContext, TokenRequest, resolve_scopes};
use crate::client::ClientRegistry;
use crate::token::AuthorizationStore;

/// `grant_type=refresh_token`.
///
/// Re-issues for the principal and scopes of the owning authorization. A
/// requested `scope` can only narrow them. Whether the refresh token itself
/// is replaced is the issuer's job (per the client's reuse policy).
pub struct RefreshTokenGrant {
    clients: Arc<ClientRegistry>,
    authorizations: Arc<dyn AuthorizationStore>,
}

impl RefreshTokenGrant {
    /// Create the handler.
    #[must_use]
    pub fn new(clients: Arc<ClientRegistry>, authorizations: Arc<dyn AuthorizationStore>) -> Self {
        Self {
            clients,
            authorizations,
        }
    }
}

#[async_trait::async_trait]
impl GrantHandler for RefreshTokenGrant {
    fn grant_type(&self) -> GrantType {
        GrantType::RefreshToken
    }

    async fn authenticate(&self, request: &TokenRequest) -> Result<AuthResult, OAuthError> {
        let token = TokenRequest::require(request.refresh_token.as_ref(), "refresh_token")?;

        let invalid = || OAuthError::InvalidGrant("invalid refresh token".to_string());
        let authorization = self
            .authorizations
            .find_by_refresh_token(token)
            .await?
            .ok_or_else(invalid)?;
        let record = authorization
            .refresh_token
            .clone()
            .filter(|r| r.value == token)
            .ok_or_else(invalid)?;
        if !record.is_usable(Utc::now()) {
            return Err(OAuthError::InvalidGrant(
                "refresh token expired or revoked".to_string(),
            ));
        }

        let client = self
            .clients
            .get(&authorization.registered_client_id)
            .cloned()
            .ok_or_else(|| OAuthError::InvalidGrant("client is no longer registered".to_string()))?;

        match request.client_credentials() {
            Some(credentials) if credentials.client_id != client.client_id => {
                return Err(OAuthError::InvalidGrant(
                    "refresh token was issued to another client".to_string(),
                ));
            }
            Some(credentials)
                if client.authentication_method == ClientAuthenticationMethod::ClientSecretBasic =>
            {
                self.clients.authenticate(&credentials).await?;
            }
            None if client.authentication_method == ClientAuthenticationMethod::ClientSecretBasic => {
                return Err(OAuthError::InvalidClient(
                    "client authentication required".to_string(),
                ));
            }
            _ => {}
        }

        if !client.allows_grant(GrantType::RefreshToken) {
            return Err(OAuthError::UnauthorizedClient(format!(
                "client '{}' may not use the refresh_token grant",
                client.client_id
            )));
        }

        let scopes = resolve_scopes(request.scope.as_deref(), &authorization.access_token.scopes)?;

        Ok(AuthResult {
            client,
            principal: authorization.principal,
            scopes,
            grant_type: GrantType::RefreshToken,
            refresh: Some(RefreshContext {
                authorization_id: authorization.id,
                previous: record,
            }),
        })
    }
}
