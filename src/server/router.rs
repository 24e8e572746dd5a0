//! HTTP router and handlers

use std::collections::BTreeSet;
use std::sync::Arc;

use axum::{
    Extension, Form, Json, Router,
    extract::{DefaultBodyLimit, State, rejection::FormRejection},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::json;
use tower_http::{catch_panic::CatchPanicLayer, timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{debug, warn};

use super::bearer::bearer_middleware;
use crate::authority::Authority;
use crate::client::ClientCredentials;
use crate::config::ServerConfig;
use crate::grant::{OAuthError, TokenRequest};
use crate::keys::JwkSet;
use crate::token::AuthenticatedContext;

/// Shared application state
pub struct AppState {
    /// The token authority
    pub authority: Arc<Authority>,
    /// Prometheus recorder handle, when one was installed
    #[cfg(feature = "metrics")]
    pub metrics: Option<metrics_exporter_prometheus::PrometheusHandle>,
}

impl AppState {
    /// State without a metrics recorder.
    #[must_use]
    pub fn new(authority: Arc<Authority>) -> Self {
        Self {
            authority,
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    /// Attach a Prometheus handle for `GET /metrics`.
    #[cfg(feature = "metrics")]
    #[must_use]
    pub fn with_metrics(mut self, handle: metrics_exporter_prometheus::PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }
}

/// Create the router
pub fn create_router(state: Arc<AppState>, config: &ServerConfig) -> Router {
    // Bearer-protected routes
    let protected = Router::new()
        .route("/userinfo", get(userinfo_handler))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            bearer_middleware,
        ));

    Router::new()
        .route("/health", get(health_handler))
        .route("/oauth2/token", post(token_handler))
        .route("/oauth2/jwks", get(jwks_handler))
        .route("/oauth2/introspect", post(introspect_handler))
        .route("/oauth2/revoke", post(revoke_handler))
        .route(
            "/.well-known/oauth-authorization-server",
            get(metadata_handler),
        )
        .route("/metrics", get(metrics_handler))
        .merge(protected)
        .layer(DefaultBodyLimit::max(config.max_body_size))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            config.request_timeout,
        ))
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// `token` parameter of introspection and revocation requests.
#[derive(Debug, Default, Deserialize)]
struct TokenParam {
    token: Option<String>,
    #[serde(default)]
    client_id: Option<String>,
}

/// Client credentials from `Authorization: Basic`, else the form `client_id`.
///
/// A present but unparseable `Authorization` header is an error rather than
/// falling back to the body.
fn client_credentials(
    headers: &HeaderMap,
    body_client_id: Option<&str>,
) -> Result<Option<ClientCredentials>, OAuthError> {
    if let Some(value) = headers.get(header::AUTHORIZATION) {
        return value
            .to_str()
            .ok()
            .and_then(ClientCredentials::from_basic_header)
            .map(Some)
            .ok_or_else(|| OAuthError::InvalidClient("malformed Authorization header".to_string()));
    }
    Ok(body_client_id
        .filter(|id| !id.is_empty())
        .map(ClientCredentials::public))
}

fn no_store(mut response: Response) -> Response {
    let headers = response.headers_mut();
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
    response
}

/// `POST /oauth2/token`
async fn token_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    form: Result<Form<TokenRequest>, FormRejection>,
) -> Response {
    let mut request = match form {
        Ok(Form(request)) => request,
        Err(rejection) => {
            debug!(error = %rejection, "Rejected token request body");
            return OAuthError::InvalidRequest(rejection.body_text()).into_response();
        }
    };

    // The body client_id stays as a fallback for public clients
    if headers.contains_key(header::AUTHORIZATION) {
        match client_credentials(&headers, None) {
            Ok(credentials) => request.client = credentials,
            Err(e) => return e.into_response(),
        }
    }

    match state.authority.token(&request).await {
        Ok(tokens) => no_store(Json(tokens).into_response()),
        Err(e) => e.into_response(),
    }
}

/// `GET /oauth2/jwks`
async fn jwks_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.authority.keys().public_keys().await {
        Ok(keys) => Json(JwkSet { keys }).into_response(),
        Err(e) => OAuthError::from(e).into_response(),
    }
}

/// `POST /oauth2/introspect`
async fn introspect_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    form: Result<Form<TokenParam>, FormRejection>,
) -> Response {
    let params = match form {
        Ok(Form(params)) => params,
        Err(rejection) => return OAuthError::InvalidRequest(rejection.body_text()).into_response(),
    };
    let credentials = match client_credentials(&headers, params.client_id.as_deref()) {
        Ok(credentials) => credentials,
        Err(e) => return e.into_response(),
    };
    let Some(token) = params.token.filter(|t| !t.is_empty()) else {
        return OAuthError::InvalidRequest("missing required parameter 'token'".to_string())
            .into_response();
    };

    match state.authority.introspect(credentials, &token).await {
        Ok(introspection) => no_store(Json(introspection).into_response()),
        Err(e) => e.into_response(),
    }
}

/// `POST /oauth2/revoke`
async fn revoke_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    form: Result<Form<TokenParam>, FormRejection>,
) -> Response {
    let params = match form {
        Ok(Form(params)) => params,
        Err(rejection) => return OAuthError::InvalidRequest(rejection.body_text()).into_response(),
    };
    let credentials = match client_credentials(&headers, params.client_id.as_deref()) {
        Ok(credentials) => credentials,
        Err(e) => return e.into_response(),
    };
    let Some(token) = params.token.filter(|t| !t.is_empty()) else {
        return OAuthError::InvalidRequest("missing required parameter 'token'".to_string())
            .into_response();
    };

    match state.authority.revoke(credentials, &token).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => e.into_response(),
    }
}

/// `GET /.well-known/oauth-authorization-server` (RFC 8414 subset)
async fn metadata_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let authority = &state.authority;
    let issuer = authority.issuer().trim_end_matches('/');
    let grant_types: Vec<&str> = authority
        .grants()
        .grant_types()
        .into_iter()
        .map(|g| g.as_str())
        .collect();
    let scopes: BTreeSet<&str> = authority
        .clients()
        .iter()
        .flat_map(|c| c.scopes.iter())
        .collect();

    Json(json!({
        "issuer": authority.issuer(),
        "token_endpoint": format!("{issuer}/oauth2/token"),
        "jwks_uri": format!("{issuer}/oauth2/jwks"),
        "introspection_endpoint": format!("{issuer}/oauth2/introspect"),
        "revocation_endpoint": format!("{issuer}/oauth2/revoke"),
        "userinfo_endpoint": format!("{issuer}/userinfo"),
        "grant_types_supported": grant_types,
        "scopes_supported": scopes,
        "response_types_supported": ["token"],
        "token_endpoint_auth_methods_supported": ["client_secret_basic", "none"],
        "token_endpoint_auth_signing_alg_values_supported": ["RS256"],
    }))
}

/// `GET /health`
async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.authority.keys().latest_key().await {
        Ok(Some(key)) => Json(json!({
            "status": "healthy",
            "version": env!("CARGO_PKG_VERSION"),
            "active_kid": key.id,
        }))
        .into_response(),
        Ok(None) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "unhealthy", "reason": "no signing key"})),
        )
            .into_response(),
        Err(e) => {
            warn!(error = %e, "Health check could not read the key store");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({"status": "unhealthy", "reason": "key store unavailable"})),
            )
                .into_response()
        }
    }
}

/// `GET /userinfo`: the caller as seen by the bearer middleware.
async fn userinfo_handler(Extension(context): Extension<AuthenticatedContext>) -> impl IntoResponse {
    Json(context)
}

/// `GET /metrics`
#[cfg(feature = "metrics")]
async fn metrics_handler(State(state): State<Arc<AppState>>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(
                header::CONTENT_TYPE,
                "text/plain; version=0.0.4; charset=utf-8",
            )],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// `GET /metrics`
#[cfg(not(feature = "metrics"))]
async fn metrics_handler() -> Response {
    StatusCode::NOT_FOUND.into_response()
}
