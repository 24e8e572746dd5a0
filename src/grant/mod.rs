//! Grant handlers.
//!
//! Each OAuth2 grant is a [`GrantHandler`]; the [`GrantRegistry`] dispatches
//! a token request to the handler whose `supports` accepts its
//! `grant_type`. Handlers only authenticate. Token minting is left to
//! [`TokenIssuer`](crate::token::TokenIssuer), which receives the
//! [`AuthResult`].

pub mod error;
pub mod jwt_bearer;
pub mod password;
pub mod refresh;

use std::sync::Arc;

use authority_core::{GrantType, Principal, RegisteredClient, ScopeSet};
use serde::Deserialize;

use crate::client::ClientCredentials;
use crate::token::RefreshTokenRecord;

pub use error::OAuthError;
pub use jwt_bearer::{JwtBearerGrant, mint_assertion};
pub use password::PasswordGrant;
pub use refresh::RefreshTokenGrant;

/// Parameters of a `POST /oauth2/token` request.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenRequest {
    /// Requested grant.
    pub grant_type: Option<String>,
    /// Password grant: login name.
    pub username: Option<String>,
    /// Password grant: password.
    pub password: Option<String>,
    /// Requested scopes (space-delimited).
    pub scope: Option<String>,
    /// JWT-bearer grant: signed assertion.
    pub assertion: Option<String>,
    /// Refresh grant: token to exchange.
    pub refresh_token: Option<String>,
    /// Client id sent in the body (public clients, jwt-bearer).
    pub client_id: Option<String>,
    /// Credentials from the `Authorization: Basic` header.
    #[serde(skip)]
    pub client: Option<ClientCredentials>,
}

impl TokenRequest {
    /// Client credentials: the Basic header wins over a body `client_id`.
    #[must_use]
    pub fn client_credentials(&self) -> Option<ClientCredentials> {
        self.client.clone().or_else(|| {
            self.client_id
                .as_deref()
                .filter(|id| !id.is_empty())
                .map(ClientCredentials::public)
        })
    }

    /// Claimed client id, from either source.
    #[must_use]
    pub fn claimed_client_id(&self) -> Option<&str> {
        self.client
            .as_ref()
            .map(|c| c.client_id.as_str())
            .or(self.client_id.as_deref())
            .filter(|id| !id.is_empty())
    }

    fn require<'a>(value: Option<&'a String>, name: &str) -> Result<&'a str, OAuthError> {
        value
            .map(String::as_str)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| OAuthError::InvalidRequest(format!("missing required parameter '{name}'")))
    }
}

/// A refresh token being exchanged.
#[derive(Debug, Clone)]
pub struct RefreshContext {
    /// Authorization the presented token was read from.
    pub authorization_id: String,
    /// The presented refresh token.
    pub previous: RefreshTokenRecord,
}

/// Outcome of a successful grant authentication.
#[derive(Debug, Clone)]
pub struct AuthResult {
    /// Client the tokens will be issued to.
    pub client: RegisteredClient,
    /// Authenticated principal.
    pub principal: Principal,
    /// Effective scopes.
    pub scopes: ScopeSet,
    /// Grant that authenticated.
    pub grant_type: GrantType,
    /// Present for refresh-token exchanges.
    pub refresh: Option<RefreshContext>,
}

/// One credential-presentation protocol.
#[async_trait::async_trait]
pub trait GrantHandler: Send + Sync + 'static {
    /// The grant this handler implements.
    fn grant_type(&self) -> GrantType;

    /// Whether this handler accepts the wire `grant_type`.
    fn supports(&self, grant_type: &str) -> bool {
        self.grant_type().as_str() == grant_type
    }

    /// Authenticate the request.
    async fn authenticate(&self, request: &TokenRequest) -> Result<AuthResult, OAuthError>;
}

/// Grant handlers, keyed by grant type.
#[derive(Default, Clone)]
pub struct GrantRegistry {
    handlers: Vec<Arc<dyn GrantHandler>>,
}

impl GrantRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a handler. The first handler registered for a grant type wins.
    #[must_use]
    pub fn with(mut self, handler: Arc<dyn GrantHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Handler for a wire grant type.
    #[must_use]
    pub fn handler(&self, grant_type: &str) -> Option<&Arc<dyn GrantHandler>> {
        self.handlers.iter().find(|h| h.supports(grant_type))
    }

    /// Registered grant types, in registration order.
    #[must_use]
    pub fn grant_types(&self) -> Vec<GrantType> {
        self.handlers.iter().map(|h| h.grant_type()).collect()
    }

    /// Dispatch `request` to its handler.
    pub async fn authenticate(&self, request: &TokenRequest) -> Result<AuthResult, OAuthError> {
        let grant_type = TokenRequest::require(request.grant_type.as_ref(), "grant_type")?;
        let handler = self.handler(grant_type).ok_or_else(|| {
            OAuthError::UnsupportedGrantType(format!("grant type '{grant_type}' is not supported"))
        })?;
        handler.authenticate(request).await
    }
}

/// Effective scopes for a request.
///
/// No (or blank) `requested` means everything `allowed`; otherwise the
/// request must be a subset of `allowed`.
pub fn resolve_scopes(requested: Option<&str>, allowed: &ScopeSet) -> Result<ScopeSet, OAuthError> {
    let requested = requested.map(ScopeSet::parse).unwrap_or_default();
    if requested.is_empty() {
        return Ok(allowed.clone());
    }
    if !requested.is_subset(allowed) {
        return Err(OAuthError::InvalidScope(format!(
            "scope not allowed: {}",
            requested.difference(allowed).join(" ")
        )));
    }
    Ok(requested)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(GrantType);

    #[async_trait::async_trait]
    impl GrantHandler for Fixed {
        fn grant_type(&self) -> GrantType {
            self.0
        }

        async fn authenticate(&self, _request: &TokenRequest) -> Result<AuthResult, OAuthError> {
            Err(OAuthError::InvalidGrant(format!("{} reached", self.0)))
        }
    }

    fn registry() -> GrantRegistry {
        GrantRegistry::new()
            .with(Arc::new(Fixed(GrantType::Password)))
            .with(Arc::new(Fixed(GrantType::RefreshToken)))
    }

    fn request(grant_type: Option<&str>) -> TokenRequest {
        TokenRequest {
            grant_type: grant_type.map(str::to_string),
            ..TokenRequest::default()
        }
    }

    #[tokio::test]
    async fn dispatches_by_wire_grant_type() {
        let err = registry()
            .authenticate(&request(Some("refresh_token")))
            .await
            .unwrap_err();
        assert_eq!(err, OAuthError::InvalidGrant("refresh_token reached".to_string()));
    }

    #[tokio::test]
    async fn unknown_grant_type_is_unsupported() {
        let err = registry()
            .authenticate(&request(Some("client_credentials")))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "unsupported_grant_type");
    }

    #[tokio::test]
    async fn missing_grant_type_is_invalid_request() {
        let err = registry().authenticate(&request(None)).await.unwrap_err();
        assert_eq!(err.code(), "invalid_request");
    }

    #[test]
    fn lists_registered_grants() {
        assert_eq!(
            registry().grant_types(),
            vec![GrantType::Password, GrantType::RefreshToken]
        );
    }

    #[test]
    fn scope_resolution() {
        let allowed = ScopeSet::parse("read write");
        assert_eq!(resolve_scopes(None, &allowed).unwrap(), allowed);
        assert_eq!(resolve_scopes(Some("  "), &allowed).unwrap(), allowed);
        assert_eq!(
            resolve_scopes(Some("read"), &allowed).unwrap(),
            ScopeSet::parse("read")
        );
        let err = resolve_scopes(Some("read admin"), &allowed).unwrap_err();
        assert_eq!(err, OAuthError::InvalidScope("scope not allowed: admin".to_string()));
    }

    #[test]
    fn basic_credentials_win_over_body_client_id() {
        let mut req = request(Some("password"));
        req.client_id = Some("from-body".to_string());
        assert_eq!(req.client_credentials().unwrap().client_id, "from-body");

        req.client = Some(ClientCredentials::public("from-header"));
        assert_eq!(req.client_credentials().unwrap().client_id, "from-header");
        assert_eq!(req.claimed_client_id(), Some("from-header"));
    }
}
