//! The authority: wires key management, grants, issuance and validation.
//!
//! [`Authority`] is the single object the HTTP layer and the CLI talk to.
//! It owns no background tasks; [`crate::server`] spawns the key rotator and
//! the authorization reaper against the stores it exposes.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::audit::{self, AuditEvent};
use crate::client::{ClientCredentials, ClientRateLimits, ClientRegistry};
use crate::config::{AuthorizationStoreConfig, Config, KeysConfig, StoreKind};
use crate::grant::{
    AuthResult, GrantRegistry, JwtBearerGrant, OAuthError, PasswordGrant, RefreshTokenGrant,
    TokenRequest,
};
use crate::keys::{FileKeyStore, InMemoryKeyStore, KeyCipher, KeyManager, KeyStore};
use crate::password::PasswordHasher;
use crate::principal::{InMemoryPrincipalStore, PrincipalStore};
use crate::token::{
    AuthorizationStore, FileAuthorizationStore, InMemoryAuthorizationStore, IssuedTokens,
    TokenIssuer, TokenValidator,
};
use crate::Result;

/// RFC 7662 introspection response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Introspection {
    /// Whether the token is currently usable.
    pub active: bool,
    /// Granted scopes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    /// Client the token was issued to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// Resource owner, for user principals.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// `access_token` or `refresh_token`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_type: Option<&'static str>,
    /// Expiry (Unix seconds).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
    /// Issued-at (Unix seconds).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
    /// Subject.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    /// Access token id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jti: Option<String>,
}

impl Introspection {
    fn inactive() -> Self {
        Self::default()
    }
}

/// Open the configured key store and wrap it in a [`KeyManager`].
pub async fn open_key_manager(config: &KeysConfig) -> Result<KeyManager> {
    let store: Arc<dyn KeyStore> = match config.store.kind {
        StoreKind::Memory => {
            warn!("Using in-memory key store; signing keys are lost on restart");
            Arc::new(InMemoryKeyStore::new())
        }
        StoreKind::File => Arc::new(FileKeyStore::open(&config.store.path).await?),
    };
    let cipher = KeyCipher::new(&config.encryption.resolve_secret(), &config.encryption.salt)?;
    Ok(KeyManager::new(store, cipher))
}

/// Open the configured authorization store.
pub async fn open_authorization_store(
    config: &AuthorizationStoreConfig,
) -> Result<Arc<dyn AuthorizationStore>> {
    Ok(match config.kind {
        StoreKind::Memory => {
            warn!("Using in-memory authorization store; refresh tokens are lost on restart");
            Arc::new(InMemoryAuthorizationStore::new())
        }
        StoreKind::File => Arc::new(FileAuthorizationStore::open(&config.path).await?),
    })
}

/// Token authority.
pub struct Authority {
    issuer_id: String,
    keys: Arc<KeyManager>,
    clients: Arc<ClientRegistry>,
    authorizations: Arc<dyn AuthorizationStore>,
    grants: GrantRegistry,
    issuer: TokenIssuer,
    validator: TokenValidator,
    rate_limits: ClientRateLimits,
}

impl Authority {
    /// Assemble an authority from its parts, registering the password,
    /// jwt-bearer and refresh-token grants.
    #[must_use]
    pub fn new(
        issuer: impl Into<String>,
        keys: Arc<KeyManager>,
        clients: Arc<ClientRegistry>,
        principals: Arc<dyn PrincipalStore>,
        authorizations: Arc<dyn AuthorizationStore>,
    ) -> Self {
        let issuer_id = issuer.into();
        let grants = GrantRegistry::new()
            .with(Arc::new(PasswordGrant::new(Arc::clone(&clients), principals)))
            .with(Arc::new(JwtBearerGrant::new(
                Arc::clone(&clients),
                Arc::clone(&keys),
                issuer_id.clone(),
            )))
            .with(Arc::new(RefreshTokenGrant::new(
                Arc::clone(&clients),
                Arc::clone(&authorizations),
            )));

        Self {
            issuer: TokenIssuer::new(
                issuer_id.clone(),
                Arc::clone(&keys),
                Arc::clone(&authorizations),
            ),
            validator: TokenValidator::new(Arc::clone(&keys), issuer_id.clone()),
            rate_limits: ClientRateLimits::new(&clients),
            issuer_id,
            keys,
            clients,
            authorizations,
            grants,
        }
    }

    /// Build from configuration and make sure a signing key exists.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let hasher = PasswordHasher::default();
        let clients = Arc::new(ClientRegistry::from_config(&config.clients, &hasher)?);
        let principals: Arc<dyn PrincipalStore> =
            Arc::new(InMemoryPrincipalStore::from_config(&config.users, &hasher)?);
        let keys = Arc::new(open_key_manager(&config.keys).await?);
        let active = keys.bootstrap().await?;
        info!(kid = %active.id, "Active signing key");
        let authorizations = open_authorization_store(&config.authorizations.store).await?;

        Ok(Self::new(
            config.issuer.clone(),
            keys,
            clients,
            principals,
            authorizations,
        ))
    }

    /// Issuer identifier.
    #[must_use]
    pub fn issuer(&self) -> &str {
        &self.issuer_id
    }

    /// Key manager.
    #[must_use]
    pub fn keys(&self) -> &Arc<KeyManager> {
        &self.keys
    }

    /// Registered clients.
    #[must_use]
    pub fn clients(&self) -> &Arc<ClientRegistry> {
        &self.clients
    }

    /// Authorization store.
    #[must_use]
    pub fn authorizations(&self) -> &Arc<dyn AuthorizationStore> {
        &self.authorizations
    }

    /// Grant registry.
    #[must_use]
    pub fn grants(&self) -> &GrantRegistry {
        &self.grants
    }

    /// Bearer-token validator.
    #[must_use]
    pub fn validator(&self) -> &TokenValidator {
        &self.validator
    }

    /// Whether the authorization behind a signature-valid access token has
    /// been revoked.
    pub async fn access_token_revoked(&self, token: &str) -> std::result::Result<bool, OAuthError> {
        Ok(self
            .authorizations
            .find_by_access_token(token)
            .await?
            .is_some_and(|a| a.access_token.revoked))
    }

    /// Handle a token request: authenticate the grant, rate limit the
    /// authenticated client, issue.
    pub async fn token(&self, request: &TokenRequest) -> std::result::Result<IssuedTokens, OAuthError> {
        let grant_type = request.grant_type.clone().unwrap_or_default();

        match self.authenticate_and_issue(request).await {
            Ok((auth, issued)) => {
                debug!(
                    client_id = %auth.client.client_id,
                    grant_type = %grant_type,
                    kid = %issued.kid,
                    "Issued access token"
                );
                audit::emit(&AuditEvent::issued(
                    auth.principal.name(),
                    &auth.client.client_id,
                    auth.grant_type.as_str(),
                    &issued.jti,
                    &issued.scope,
                    &issued.kid,
                ));
                telemetry_metrics::counter!(
                    "authority_tokens_issued_total",
                    "grant_type" => auth.grant_type.as_str()
                )
                .increment(1);
                Ok(issued)
            }
            Err(e) => {
                debug!(grant_type = %grant_type, error = %e, "Token request refused");
                audit::emit(&AuditEvent::denied(
                    request.claimed_client_id(),
                    request.grant_type.as_deref(),
                    e.to_string(),
                ));
                telemetry_metrics::counter!(
                    "authority_grant_failures_total",
                    "grant_type" => grant_type,
                    "error" => e.code()
                )
                .increment(1);
                Err(e)
            }
        }
    }

    async fn authenticate_and_issue(
        &self,
        request: &TokenRequest,
    ) -> std::result::Result<(AuthResult, IssuedTokens), OAuthError> {
        let auth = self.grants.authenticate(request).await?;
        self.rate_limits.check(&auth.client.client_id)?;
        let issued = self.issuer.issue(&auth).await?;
        Ok((auth, issued))
    }

    /// RFC 7662 introspection.
    ///
    /// Confidential clients may introspect any token; public clients only
    /// their own. Unknown, foreign, expired and revoked tokens are all
    /// reported as `{active: false}`.
    pub async fn introspect(
        &self,
        credentials: Option<ClientCredentials>,
        token: &str,
    ) -> std::result::Result<Introspection, OAuthError> {
        let caller = self.authenticate_client(credentials).await?;
        let now = Utc::now();

        let (authorization, token_type, active) =
            if let Some(a) = self.authorizations.find_by_access_token(token).await? {
                let active = a.access_token_active(now);
                (a, "access_token", active)
            } else if let Some(a) = self.authorizations.find_by_refresh_token(token).await? {
                let active = a
                    .refresh_token
                    .as_ref()
                    .is_some_and(|r| r.value == token && r.is_usable(now));
                (a, "refresh_token", active)
            } else {
                return Ok(Introspection::inactive());
            };

        let may_see = caller.client_secret_hash.is_some()
            || authorization.registered_client_id == caller.client_id;
        if !active || !may_see {
            return Ok(Introspection::inactive());
        }

        let (exp, iat) = match (token_type, &authorization.refresh_token) {
            ("refresh_token", Some(refresh)) => (refresh.expires_at, refresh.issued_at),
            _ => (
                authorization.access_token.expires_at,
                authorization.access_token.issued_at,
            ),
        };
        Ok(Introspection {
            active: true,
            scope: Some(authorization.access_token.scopes.to_scope_string()),
            client_id: Some(authorization.registered_client_id.clone()),
            username: (!authorization.principal.is_client())
                .then(|| authorization.principal_name.clone()),
            token_type: Some(token_type),
            exp: Some(exp.timestamp()),
            iat: Some(iat.timestamp()),
            sub: Some(authorization.principal_name.clone()),
            jti: Some(authorization.access_token.jti.clone()),
        })
    }

    /// RFC 7009 revocation.
    ///
    /// Revoking either token of an authorization kills both. Unknown tokens
    /// succeed silently; tokens issued to another client are refused.
    pub async fn revoke(
        &self,
        credentials: Option<ClientCredentials>,
        token: &str,
    ) -> std::result::Result<(), OAuthError> {
        let caller = self.authenticate_client(credentials).await?;

        let owner = match self.authorizations.find_by_access_token(token).await? {
            Some(a) => Some(a),
            None => self.authorizations.find_by_refresh_token(token).await?,
        };
        let Some(owner) = owner else {
            debug!(client_id = %caller.client_id, "Revocation of unknown token ignored");
            return Ok(());
        };
        if owner.registered_client_id != caller.client_id {
            return Err(OAuthError::UnauthorizedClient(
                "token was issued to another client".to_string(),
            ));
        }

        if let Some(revoked) = self.authorizations.revoke(token).await? {
            info!(client_id = %caller.client_id, jti = %revoked.access_token.jti, "Revoked authorization");
            audit::emit(&AuditEvent::revoked(
                &revoked.principal_name,
                &revoked.registered_client_id,
                &revoked.access_token.jti,
            ));
        }
        Ok(())
    }

    async fn authenticate_client(
        &self,
        credentials: Option<ClientCredentials>,
    ) -> std::result::Result<authority_core::RegisteredClient, OAuthError> {
        let credentials = credentials
            .ok_or_else(|| OAuthError::InvalidClient("client authentication required".to_string()))?;
        let client = self.clients.authenticate(&credentials).await?;
        self.rate_limits.check(&client.client_id)?;
        Ok(client)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::time::Duration;

    use authority_core::{ClientAuthenticationMethod, GrantType, RegisteredClient, ScopeSet};

    use super::*;
    use crate::principal::UserRecord;

    fn authority(rate_limit: u32) -> Authority {
        authority_with_store(rate_limit).0
    }

    fn authority_with_store(rate_limit: u32) -> (Authority, Arc<InMemoryAuthorizationStore>) {
        let hasher = PasswordHasher::with_params(1024, 1, 1).unwrap();
        let keys = Arc::new(KeyManager::new(
            Arc::new(InMemoryKeyStore::new()),
            KeyCipher::new("test-secret", "test-salt").unwrap(),
        ));
        let client = |id: &str, secret: Option<&str>| RegisteredClient {
            client_id: id.to_string(),
            authentication_method: if secret.is_some() {
                ClientAuthenticationMethod::ClientSecretBasic
            } else {
                ClientAuthenticationMethod::None
            },
            client_secret_hash: secret.map(|s| hasher.hash(s).unwrap()),
            grant_types: [GrantType::Password, GrantType::RefreshToken].into_iter().collect(),
            scopes: ScopeSet::parse("read write"),
            access_token_ttl: Duration::from_secs(1800),
            refresh_token_ttl: Duration::from_secs(86_400),
            reuse_refresh_tokens: false,
            rate_limit,
        };
        let clients = Arc::new(ClientRegistry::new([
            client("web-app", None),
            client("mobile", None),
            client("resource-server", Some("rs-secret")),
        ]));
        let principals = Arc::new(InMemoryPrincipalStore::new([UserRecord {
            username: "admin".to_string(),
            password_hash: hasher.hash("admin@2025!").unwrap(),
            authorities: BTreeSet::from(["ROLE_ADMIN".to_string()]),
            enabled: true,
        }]));
        let store = Arc::new(InMemoryAuthorizationStore::new());
        let authority = Authority::new(
            "http://localhost:9000",
            keys,
            clients,
            principals,
            store.clone(),
        );
        (authority, store)
    }

    fn password_request(client_id: &str, password: &str) -> TokenRequest {
        TokenRequest {
            grant_type: Some("password".to_string()),
            username: Some("admin".to_string()),
            password: Some(password.to_string()),
            client_id: Some(client_id.to_string()),
            ..TokenRequest::default()
        }
    }

    async fn issued(authority: &Authority) -> IssuedTokens {
        authority.keys().bootstrap().await.unwrap();
        authority
            .token(&password_request("web-app", "admin@2025!"))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn token_then_validate() {
        let authority = authority(0);
        let tokens = issued(&authority).await;

        let ctx = authority.validator().validate(&tokens.access_token).await.unwrap();
        assert_eq!(ctx.principal_name, "admin");
        assert_eq!(ctx.client_id, "web-app");
    }

    #[tokio::test]
    async fn failed_grant_leaves_no_record() {
        let (authority, store) = authority_with_store(0);
        authority.keys().bootstrap().await.unwrap();

        let err = authority
            .token(&password_request("web-app", "wrong"))
            .await
            .unwrap_err();

        assert_eq!(err.code(), "invalid_grant");
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn rate_limited_client_gets_429() {
        // GIVEN: a budget of one request per minute
        let authority = authority(1);
        authority.keys().bootstrap().await.unwrap();
        authority
            .token(&password_request("web-app", "admin@2025!"))
            .await
            .unwrap();

        // WHEN: a second request arrives in the same minute
        let err = authority
            .token(&password_request("web-app", "admin@2025!"))
            .await
            .unwrap_err();

        // THEN
        assert_eq!(err.code(), "rate_limit_exceeded");
    }

    #[tokio::test]
    async fn failed_requests_do_not_drain_a_clients_budget() {
        // GIVEN: a budget of one request per minute
        let authority = authority(1);
        authority.keys().bootstrap().await.unwrap();

        // WHEN: someone naming the client keeps failing to authenticate
        for _ in 0..3 {
            let err = authority
                .token(&password_request("web-app", "guess"))
                .await
                .unwrap_err();
            assert_eq!(err.code(), "invalid_grant");
        }
        let rs_guess = ClientCredentials {
            client_id: "resource-server".to_string(),
            client_secret: Some("guess".to_string()),
        };
        for _ in 0..3 {
            let err = authority.introspect(Some(rs_guess.clone()), "x").await.unwrap_err();
            assert_eq!(err.code(), "invalid_client");
        }

        // THEN: the real clients still get their request
        authority
            .token(&password_request("web-app", "admin@2025!"))
            .await
            .unwrap();
        let rs = ClientCredentials {
            client_id: "resource-server".to_string(),
            client_secret: Some("rs-secret".to_string()),
        };
        authority.introspect(Some(rs), "x").await.unwrap();
    }

    #[tokio::test]
    async fn revoked_access_token_is_reported() {
        let authority = authority(0);
        let tokens = issued(&authority).await;
        assert!(!authority.access_token_revoked(&tokens.access_token).await.unwrap());

        authority
            .revoke(Some(ClientCredentials::public("web-app")), &tokens.access_token)
            .await
            .unwrap();

        assert!(authority.access_token_revoked(&tokens.access_token).await.unwrap());
        assert!(!authority.access_token_revoked("never-issued").await.unwrap());
    }

    #[tokio::test]
    async fn introspection_visibility() {
        let authority = authority(0);
        let tokens = issued(&authority).await;

        // Owner sees its token
        let own = authority
            .introspect(Some(ClientCredentials::public("web-app")), &tokens.access_token)
            .await
            .unwrap();
        assert!(own.active);
        assert_eq!(own.username.as_deref(), Some("admin"));
        assert_eq!(own.token_type, Some("access_token"));

        // Another public client does not
        let other = authority
            .introspect(Some(ClientCredentials::public("mobile")), &tokens.access_token)
            .await
            .unwrap();
        assert_eq!(other, Introspection::inactive());

        // A confidential resource server does
        let rs = ClientCredentials {
            client_id: "resource-server".to_string(),
            client_secret: Some("rs-secret".to_string()),
        };
        let refresh = tokens.refresh_token.unwrap();
        let seen = authority.introspect(Some(rs), &refresh).await.unwrap();
        assert!(seen.active);
        assert_eq!(seen.token_type, Some("refresh_token"));

        // Unauthenticated callers are refused outright
        let err = authority.introspect(None, &refresh).await.unwrap_err();
        assert_eq!(err.code(), "invalid_client");
    }

    #[tokio::test]
    async fn revocation_kills_both_tokens() {
        let authority = authority(0);
        let tokens = issued(&authority).await;
        let owner = || Some(ClientCredentials::public("web-app"));

        // Foreign client may not revoke
        let err = authority
            .revoke(Some(ClientCredentials::public("mobile")), &tokens.access_token)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "unauthorized_client");

        authority.revoke(owner(), &tokens.access_token).await.unwrap();

        let introspected = authority
            .introspect(owner(), tokens.refresh_token.as_deref().unwrap())
            .await
            .unwrap();
        assert!(!introspected.active);

        let refresh = TokenRequest {
            grant_type: Some("refresh_token".to_string()),
            refresh_token: tokens.refresh_token.clone(),
            client_id: Some("web-app".to_string()),
            ..TokenRequest::default()
        };
        assert_eq!(authority.token(&refresh).await.unwrap_err().code(), "invalid_grant");

        // Unknown tokens are fine
        authority.revoke(owner(), "never-issued").await.unwrap();
    }
}
