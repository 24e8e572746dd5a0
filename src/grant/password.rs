//! Resource-owner password grant (RFC 6749 §4.3).

use std::sync::Arc;

use authority_core::GrantType;

use super::{AuthResult, GrantHandler, OAuthError, TokenRequest, resolve_scopes};
use crate::client::ClientRegistry;
use crate::principal::PrincipalStore;

/// `grant_type=password`.
pub struct PasswordGrant {
    clients: Arc<ClientRegistry>,
    principals: Arc<dyn PrincipalStore>,
}

impl PasswordGrant {
    /// Create the handler.
    #[must_use]
    pub fn new(clients: Arc<ClientRegistry>, principals: Arc<dyn PrincipalStore>) -> Self {
        Self {
            clients,
            principals,
        }
    }
}

#[async_trait::async_trait]
impl GrantHandler for PasswordGrant {
    fn grant_type(&self) -> GrantType {
        GrantType::Password
    }

    async fn authenticate(&self, request: &TokenRequest) -> Result<AuthResult, OAuthError> {
        let credentials = request
            .client_credentials()
            .ok_or_else(|| OAuthError::InvalidClient("client authentication required".to_string()))?;
        let client = self.clients.authenticate(&credentials).await?;
        if !client.allows_grant(GrantType::Password) {
            return Err(OAuthError::UnauthorizedClient(format!(
                "client '{}' may not use the password grant",
                client.client_id
            )));
        }

        let username = TokenRequest::require(request.username.as_ref(), "username")?;
        let password = TokenRequest::require(request.password.as_ref(), "password")?;
        let principal = self
            .principals
            .authenticate(username, password)
            .await?
            .ok_or_else(|| OAuthError::InvalidGrant("bad credentials".to_string()))?;

        let scopes = resolve_scopes(request.scope.as_deref(), &client.scopes)?;

        Ok(AuthResult {
            client,
            principal,
            scopes,
            grant_type: GrantType::Password,
            refresh: None,
        })
    }
}
