//! End-to-end tests for the HTTP surface
//!
//! Drives the axum router in-process:
//! - Password, refresh-token and jwt-bearer grants on `POST /oauth2/token`
//! - JWKS publication across key rotation
//! - Bearer-protected `/userinfo`
//! - Introspection, revocation and metadata

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use authority_core::{ClientAuthenticationMethod, GrantType, RegisteredClient, ScopeSet};
use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use base64::Engine;
use pretty_assertions::assert_eq;
use serde_json::Value;
use tower::ServiceExt;

use token_authority::authority::Authority;
use token_authority::client::ClientRegistry;
use token_authority::config::ServerConfig;
use token_authority::grant::mint_assertion;
use token_authority::keys::{InMemoryKeyStore, KeyCipher, KeyManager};
use token_authority::password::PasswordHasher;
use token_authority::principal::{InMemoryPrincipalStore, UserRecord};
use token_authority::server::{AppState, create_router};
use token_authority::token::InMemoryAuthorizationStore;

const ISSUER: &str = "http://localhost:9000";

struct Harness {
    app: Router,
    authority: Arc<Authority>,
    store: Arc<InMemoryAuthorizationStore>,
}

fn client(id: &str, grants: &[GrantType], scopes: &str) -> RegisteredClient {
    RegisteredClient {
        client_id: id.to_string(),
        authentication_method: ClientAuthenticationMethod::None,
        client_secret_hash: None,
        grant_types: grants.iter().copied().collect(),
        scopes: ScopeSet::parse(scopes),
        access_token_ttl: Duration::from_secs(1800),
        refresh_token_ttl: Duration::from_secs(86_400),
        reuse_refresh_tokens: false,
        rate_limit: 0,
    }
}

async fn harness() -> Harness {
    let hasher = PasswordHasher::with_params(1024, 1, 1).unwrap();
    let keys = Arc::new(KeyManager::new(
        Arc::new(InMemoryKeyStore::new()),
        KeyCipher::new("integration-secret", "integration-salt").unwrap(),
    ));
    keys.bootstrap().await.unwrap();

    let resource_server = RegisteredClient {
        authentication_method: ClientAuthenticationMethod::ClientSecretBasic,
        client_secret_hash: Some(hasher.hash("rs-secret").unwrap()),
        ..client("resource-server", &[GrantType::Password], "read")
    };
    let clients = Arc::new(ClientRegistry::new([
        client(
            "web-app",
            &[GrantType::Password, GrantType::RefreshToken],
            "read write",
        ),
        RegisteredClient {
            authentication_method: ClientAuthenticationMethod::PrivateKeyJwt,
            access_token_ttl: Duration::from_secs(300),
            ..client("billing-svc", &[GrantType::JwtBearer], "invoices:read")
        },
        resource_server,
    ]));
    let principals = Arc::new(InMemoryPrincipalStore::new([UserRecord {
        username: "admin".to_string(),
        password_hash: hasher.hash("admin@2025!").unwrap(),
        authorities: BTreeSet::from([
            "ROLE_ADMIN".to_string(),
            "READ_USER".to_string(),
            "WRITE_USER".to_string(),
        ]),
        enabled: true,
    }]));
    let store = Arc::new(InMemoryAuthorizationStore::new());

    let authority = Arc::new(Authority::new(
        ISSUER,
        keys,
        clients,
        principals,
        store.clone(),
    ));
    let app = create_router(
        Arc::new(AppState::new(Arc::clone(&authority))),
        &ServerConfig::default(),
    );
    Harness {
        app,
        authority,
        store,
    }
}

fn form(uri: &str, params: &[(&str, &str)]) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(Body::from(serde_urlencoded::to_string(params).unwrap()))
        .unwrap()
}

fn with_basic(mut request: Request<Body>, id: &str, secret: &str) -> Request<Body> {
    let encoded = base64::engine::general_purpose::STANDARD.encode(format!("{id}:{secret}"));
    request.headers_mut().insert(
        header::AUTHORIZATION,
        format!("Basic {encoded}").parse().unwrap(),
    );
    request
}

fn get(uri: &str, bearer: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method("GET").uri(uri);
    if let Some(token) = bearer {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    builder.body(Body::empty()).unwrap()
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

async fn password_token(app: &Router, scope: Option<&str>) -> Value {
    let mut params = vec![
        ("grant_type", "password"),
        ("client_id", "web-app"),
        ("username", "admin"),
        ("password", "admin@2025!"),
    ];
    if let Some(scope) = scope {
        params.push(("scope", scope));
    }
    let (status, body) = send(app, form("/oauth2/token", &params)).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    body
}

/// Password grant for the public web-app client
#[tokio::test]
async fn test_password_grant_issues_bearer_token() {
    let h = harness().await;

    let response = h
        .app
        .clone()
        .oneshot(form(
            "/oauth2/token",
            &[
                ("grant_type", "password"),
                ("client_id", "web-app"),
                ("username", "admin"),
                ("password", "admin@2025!"),
            ],
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::CACHE_CONTROL).unwrap(),
        "no-store"
    );
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert!(!body["access_token"].as_str().unwrap().is_empty());
    assert_eq!(body["token_type"], "Bearer");
    assert_eq!(body["expires_in"], 1800);
    assert_eq!(body["scope"], "read write");
    assert!(body["refresh_token"].as_str().unwrap().starts_with("rt_"));
    assert_eq!(h.store.len(), 1);
}

/// Wrong password: 400 invalid_grant and nothing persisted
#[tokio::test]
async fn test_wrong_password_is_invalid_grant() {
    let h = harness().await;

    let (status, body) = send(
        &h.app,
        form(
            "/oauth2/token",
            &[
                ("grant_type", "password"),
                ("client_id", "web-app"),
                ("username", "admin"),
                ("password", "nope"),
            ],
        ),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_grant");
    assert!(h.store.is_empty());
}

/// Request-shape errors map to the OAuth2 error codes
#[tokio::test]
async fn test_request_errors() {
    let h = harness().await;

    let (status, body) = send(
        &h.app,
        form("/oauth2/token", &[("grant_type", "client_credentials")]),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "unsupported_grant_type");

    let (status, body) = send(&h.app, form("/oauth2/token", &[("client_id", "web-app")]))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_request");

    let (_, body) = send(
        &h.app,
        form(
            "/oauth2/token",
            &[
                ("grant_type", "password"),
                ("client_id", "web-app"),
                ("username", "admin"),
                ("password", "admin@2025!"),
                ("scope", "admin"),
            ],
        ),
    )
    .await;
    assert_eq!(body["error"], "invalid_scope");

    // Confidential client with a wrong secret
    let request = with_basic(
        form(
            "/oauth2/token",
            &[
                ("grant_type", "password"),
                ("username", "admin"),
                ("password", "admin@2025!"),
            ],
        ),
        "resource-server",
        "wrong",
    );
    let (status, body) = send(&h.app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_client");
}

/// JWKS publishes every key, and tokens signed before a rotation keep working
#[tokio::test]
async fn test_jwks_and_validation_across_rotation() {
    let h = harness().await;

    // GIVEN: a token signed by the bootstrap key
    let before = password_token(&h.app, None).await;
    let (_, jwks) = send(&h.app, get("/oauth2/jwks", None)).await;
    assert_eq!(jwks["keys"].as_array().unwrap().len(), 1);
    let first_kid = jwks["keys"][0]["kid"].as_str().unwrap().to_string();

    // WHEN: the key rotates
    let rotated = h.authority.keys().rotate().await.unwrap();

    // THEN: both keys are published, newest first
    let (status, jwks) = send(&h.app, get("/oauth2/jwks", None)).await;
    assert_eq!(status, StatusCode::OK);
    let keys = jwks["keys"].as_array().unwrap();
    assert_eq!(keys.len(), 2);
    assert_eq!(keys[0]["kid"], rotated.id.as_str());
    assert_eq!(keys[1]["kid"], first_kid.as_str());
    for key in keys {
        assert_eq!(key["kty"], "RSA");
        assert_eq!(key["alg"], "RS256");
        assert_eq!(key["use"], "sig");
        assert_eq!(key["e"], "AQAB");
    }

    // AND: the old token still authenticates
    let (status, info) = send(
        &h.app,
        get("/userinfo", before["access_token"].as_str()),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(info["principal_name"], "admin");

    // AND: new tokens carry the new kid
    let after = password_token(&h.app, None).await;
    let header = jsonwebtoken::decode_header(after["access_token"].as_str().unwrap()).unwrap();
    assert_eq!(header.kid.as_deref(), Some(rotated.id.as_str()));
}

/// Refresh narrows but never widens the original grant
#[tokio::test]
async fn test_refresh_cannot_escalate_scope() {
    let h = harness().await;
    let initial = password_token(&h.app, Some("read")).await;
    let refresh = initial["refresh_token"].as_str().unwrap();

    let (status, body) = send(
        &h.app,
        form(
            "/oauth2/token",
            &[
                ("grant_type", "refresh_token"),
                ("client_id", "web-app"),
                ("refresh_token", refresh),
                ("scope", "read write"),
            ],
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_scope");

    let (status, body) = send(
        &h.app,
        form(
            "/oauth2/token",
            &[
                ("grant_type", "refresh_token"),
                ("client_id", "web-app"),
                ("refresh_token", refresh),
            ],
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["scope"], "read");
}

/// A rotated refresh token can be exchanged exactly once
#[tokio::test]
async fn test_refresh_token_single_use() {
    let h = harness().await;
    let initial = password_token(&h.app, None).await;
    let refresh = initial["refresh_token"].as_str().unwrap().to_string();
    let exchange = || {
        form(
            "/oauth2/token",
            &[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh.as_str()),
            ],
        )
    };

    let (status, first) = send(&h.app, exchange()).await;
    assert_eq!(status, StatusCode::OK);
    assert_ne!(first["refresh_token"].as_str().unwrap(), refresh);

    let (status, second) = send(&h.app, exchange()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(second["error"], "invalid_grant");
}

/// jwt-bearer: assertion minted by the authority, exchanged for a client token
#[tokio::test]
async fn test_jwt_bearer_flow() {
    let h = harness().await;
    let assertion = mint_assertion(
        h.authority.keys(),
        ISSUER,
        "billing-svc",
        Duration::from_secs(60),
    )
    .await
    .unwrap();

    let (status, body) = send(
        &h.app,
        form(
            "/oauth2/token",
            &[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("client_id", "billing-svc"),
                ("assertion", assertion.as_str()),
            ],
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["expires_in"], 300);
    assert_eq!(body["scope"], "invoices:read");
    assert!(body.get("refresh_token").is_none());

    let (_, info) = send(&h.app, get("/userinfo", body["access_token"].as_str())).await;
    assert_eq!(info["principal_name"], "billing-svc");
    assert_eq!(info["client_id"], "billing-svc");
    let authorities: Vec<&str> = info["authorities"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap())
        .collect();
    assert!(authorities.contains(&"ROLE_BILLING_SVC"));
    assert!(authorities.contains(&"invoices:read"));
}

/// userinfo requires a valid bearer token
#[tokio::test]
async fn test_userinfo_requires_bearer() {
    let h = harness().await;

    let response = h.app.clone().oneshot(get("/userinfo", None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(response.headers().contains_key(header::WWW_AUTHENTICATE));

    let (status, body) = send(&h.app, get("/userinfo", Some("not.a.token"))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "invalid_token");

    let token = password_token(&h.app, None).await;
    let (status, info) = send(&h.app, get("/userinfo", token["access_token"].as_str())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(info["user_id"], "admin");
    assert_eq!(info["scopes"], "read write");
}

/// Introspection and revocation
#[tokio::test]
async fn test_introspect_and_revoke() {
    let h = harness().await;
    let tokens = password_token(&h.app, None).await;
    let access = tokens["access_token"].as_str().unwrap();

    // A confidential resource server introspects the user's token
    let request = with_basic(
        form("/oauth2/introspect", &[("token", access)]),
        "resource-server",
        "rs-secret",
    );
    let (status, body) = send(&h.app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["active"], true);
    assert_eq!(body["client_id"], "web-app");
    assert_eq!(body["username"], "admin");
    assert_eq!(body["token_type"], "access_token");

    // The owner revokes it
    let (status, _) = send(
        &h.app,
        form("/oauth2/revoke", &[("client_id", "web-app"), ("token", access)]),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let request = with_basic(
        form("/oauth2/introspect", &[("token", access)]),
        "resource-server",
        "rs-secret",
    );
    let (_, body) = send(&h.app, request).await;
    assert_eq!(body, serde_json::json!({"active": false}));

    // Unknown tokens revoke fine; missing token is a request error
    let (status, _) = send(
        &h.app,
        form("/oauth2/revoke", &[("client_id", "web-app"), ("token", "unknown")]),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (status, body) = send(&h.app, form("/oauth2/revoke", &[("client_id", "web-app")])).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_request");
}

/// A revoked access token no longer opens bearer-protected routes
#[tokio::test]
async fn test_revoked_token_rejected_by_userinfo() {
    let h = harness().await;

    // GIVEN: a token that works on /userinfo
    let tokens = password_token(&h.app, None).await;
    let access = tokens["access_token"].as_str().unwrap();
    let (status, _) = send(&h.app, get("/userinfo", Some(access))).await;
    assert_eq!(status, StatusCode::OK);

    // WHEN: its owner revokes it before it expires
    let (status, _) = send(
        &h.app,
        form("/oauth2/revoke", &[("client_id", "web-app"), ("token", access)]),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // THEN: the still-signed JWT is refused
    let (status, body) = send(&h.app, get("/userinfo", Some(access))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "invalid_token");
    assert_eq!(body["error_description"], "token revoked");
}

/// Discovery metadata and health
#[tokio::test]
async fn test_metadata_and_health() {
    let h = harness().await;

    let (status, meta) = send(&h.app, get("/.well-known/oauth-authorization-server", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(meta["issuer"], ISSUER);
    assert_eq!(meta["jwks_uri"], format!("{ISSUER}/oauth2/jwks"));
    assert_eq!(
        meta["grant_types_supported"],
        serde_json::json!([
            "password",
            "urn:ietf:params:oauth:grant-type:jwt-bearer",
            "refresh_token"
        ])
    );

    let (status, health) = send(&h.app, get("/health", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "healthy");
}
