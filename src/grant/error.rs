//! OAuth2 error taxonomy and its wire form (RFC 6749 §5.2).

use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

use crate::error::StoreError;
use crate::keys::KeyError;

/// Errors returned by grant handlers and the token endpoint.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OAuthError {
    /// Missing parameter, malformed or mismatched assertion.
    #[error("invalid_request: {0}")]
    InvalidRequest(String),

    /// Unknown client or failed client authentication.
    #[error("invalid_client: {0}")]
    InvalidClient(String),

    /// Bad resource-owner credentials, or an unusable refresh token.
    #[error("invalid_grant: {0}")]
    InvalidGrant(String),

    /// The client may not use this grant type.
    #[error("unauthorized_client: {0}")]
    UnauthorizedClient(String),

    /// The grant type is not recognized.
    #[error("unsupported_grant_type: {0}")]
    UnsupportedGrantType(String),

    /// Requested scope exceeds what the client or original grant allows.
    #[error("invalid_scope: {0}")]
    InvalidScope(String),

    /// Expired assertion or bad bearer token.
    #[error("invalid_token: {0}")]
    InvalidToken(String),

    /// Per-client request budget exhausted.
    #[error("rate_limit_exceeded: {0}")]
    RateLimited(String),

    /// Key or storage failure; nothing was issued.
    #[error("server_error: {0}")]
    ServerError(String),
}

impl OAuthError {
    /// RFC 6749 `error` code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::InvalidClient(_) => "invalid_client",
            Self::InvalidGrant(_) => "invalid_grant",
            Self::UnauthorizedClient(_) => "unauthorized_client",
            Self::UnsupportedGrantType(_) => "unsupported_grant_type",
            Self::InvalidScope(_) => "invalid_scope",
            Self::InvalidToken(_) => "invalid_token",
            Self::RateLimited(_) => "rate_limit_exceeded",
            Self::ServerError(_) => "server_error",
        }
    }

    /// Human-readable description.
    #[must_use]
    pub fn description(&self) -> &str {
        match self {
            Self::InvalidRequest(m)
            | Self::InvalidClient(m)
            | Self::InvalidGrant(m)
            | Self::UnauthorizedClient(m)
            | Self::UnsupportedGrantType(m)
            | Self::InvalidScope(m)
            | Self::InvalidToken(m)
            | Self::RateLimited(m)
            | Self::ServerError(m) => m,
        }
    }

    /// HTTP status for the error.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidToken(_) => StatusCode::UNAUTHORIZED,
            Self::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::ServerError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

impl From<KeyError> for OAuthError {
    fn from(e: KeyError) -> Self {
        Self::ServerError(e.to_string())
    }
}

impl From<StoreError> for OAuthError {
    fn from(e: StoreError) -> Self {
        Self::ServerError(e.to_string())
    }
}

/// Wire body `{error, error_description}`.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    /// Error code.
    pub error: &'static str,
    /// Description.
    pub error_description: String,
}

impl IntoResponse for OAuthError {
    fn into_response(self) -> Response {
        let status = self.status();
        let description = if matches!(self, Self::ServerError(_)) {
            // Internal detail stays in the logs.
            tracing::error!(error = %self, "Token endpoint server error");
            "The authorization server encountered an internal error".to_string()
        } else {
            self.description().to_string()
        };
        let body = ErrorBody {
            error: self.code(),
            error_description: description,
        };

        let mut response = (status, Json(body)).into_response();
        let headers = response.headers_mut();
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
        if status == StatusCode::UNAUTHORIZED {
            headers.insert(
                header::WWW_AUTHENTICATE,
                HeaderValue::from_static("Bearer error=\"invalid_token\""),
            );
        }
        response
    }
}
