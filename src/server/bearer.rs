//! Bearer-token middleware.
//!
//! Validates `Authorization: Bearer <jwt>` with the authority's
//! [`TokenValidator`](crate::token::TokenValidator) and inserts the resulting
//! [`AuthenticatedContext`](crate::token::AuthenticatedContext) as a request
//! extension. Handlers extract it with `Extension<AuthenticatedContext>`.
//! A token whose authorization was revoked is refused even while its
//! signature and `exp` are still good.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{Request, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::{debug, warn};

use super::router::AppState;
use crate::token::TokenError;

/// Authentication middleware for bearer-protected routes.
pub async fn bearer_middleware(
    State(state): State<Arc<AppState>>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let token = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| {
            v.strip_prefix("Bearer ")
                .or_else(|| v.strip_prefix("bearer "))
        })
        .map(|t| t.trim().to_string());

    let Some(token) = token else {
        let path = request.uri().path();
        warn!(path = %path, "Missing bearer token");
        return TokenError::InvalidToken("missing bearer token".to_string()).into_response();
    };

    match state.authority.validator().validate(&token).await {
        Ok(context) => {
            match state.authority.access_token_revoked(&token).await {
                Ok(false) => {}
                Ok(true) => {
                    warn!(path = %request.uri().path(), jti = %context.token_id, "Revoked bearer token");
                    return TokenError::InvalidToken("token revoked".to_string()).into_response();
                }
                Err(e) => {
                    warn!(error = %e, "Revocation lookup failed");
                    return e.into_response();
                }
            }
            debug!(
                principal = %context.principal_name,
                client_id = %context.client_id,
                path = %request.uri().path(),
                "Authenticated request"
            );
            request.extensions_mut().insert(context);
            next.run(request).await
        }
        Err(e) => {
            warn!(path = %request.uri().path(), error = %e, "Bearer token rejected");
            e.into_response()
        }
    }
}
