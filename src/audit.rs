//! Audit logging for token and key lifecycle events.
//!
//! Every event is emitted via `tracing::info!` with the serialized event in
//! the `audit` field, and counted in `authority_audit_events_total{event}`.
//!
//! # Events
//!
//! | Event | When |
//! |-------|------|
//! | `token.issued` | A grant succeeded and an access token was signed |
//! | `token.refreshed` | A refresh token was exchanged |
//! | `token.denied` | Client or grant authentication failed |
//! | `token.revoked` | A token was revoked via `POST /oauth2/revoke` |
//! | `key.rotated` | A signing key was created (bootstrap, scheduled or manual) |

use serde::Serialize;

/// Structured audit event.
#[derive(Debug, Serialize)]
pub struct AuditEvent {
    /// Event type string (e.g., `"token.issued"`).
    pub event: &'static str,
    /// Token subject (username or client id).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub principal: Option<String>,
    /// Client the token was requested by.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// Grant type of the request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grant_type: Option<String>,
    /// JTI of the affected access token.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_jti: Option<String>,
    /// Granted scopes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    /// Signing key id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,
    /// Denial reason or rotation trigger.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl AuditEvent {
    fn new(event: &'static str) -> Self {
        Self {
            event,
            principal: None,
            client_id: None,
            grant_type: None,
            token_jti: None,
            scope: None,
            kid: None,
            reason: None,
        }
    }

    /// Construct a `token.issued` (or `token.refreshed`) event.
    #[must_use]
    pub fn issued(
        principal: &str,
        client_id: &str,
        grant_type: &str,
        jti: &str,
        scope: &str,
        kid: &str,
    ) -> Self {
        let event = if grant_type == "refresh_token" {
            "token.refreshed"
        } else {
            "token.issued"
        };
        Self {
            principal: Some(principal.to_string()),
            client_id: Some(client_id.to_string()),
            grant_type: Some(grant_type.to_string()),
            token_jti: Some(jti.to_string()),
            scope: Some(scope.to_string()),
            kid: Some(kid.to_string()),
            ..Self::new(event)
        }
    }

    /// Construct a `token.denied` event.
    #[must_use]
    pub fn denied(
        client_id: Option<&str>,
        grant_type: Option<&str>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            client_id: client_id.map(str::to_string),
            grant_type: grant_type.map(str::to_string),
            reason: Some(reason.into()),
            ..Self::new("token.denied")
        }
    }

    /// Construct a `token.revoked` event.
    #[must_use]
    pub fn revoked(principal: &str, client_id: &str, jti: &str) -> Self {
        Self {
            principal: Some(principal.to_string()),
            client_id: Some(client_id.to_string()),
            token_jti: Some(jti.to_string()),
            ..Self::new("token.revoked")
        }
    }

    /// Construct a `key.rotated` event.
    #[must_use]
    pub fn key_rotated(kid: &str, reason: &str) -> Self {
        Self {
            kid: Some(kid.to_string()),
            reason: Some(reason.to_string()),
            ..Self::new("key.rotated")
        }
    }
}

/// Emit an audit event via `tracing::info!` with structured fields.
///
/// ```text
/// INFO token_authority::audit audit={"event":"token.issued","principal":"admin",...}
/// ```
pub fn emit(event: &AuditEvent) {
    telemetry_metrics::counter!("authority_audit_events_total", "event" => event.event).increment(1);
    match serde_json::to_string(event) {
        Ok(ref json) => tracing::info!(audit = %json, "authority audit"),
        Err(ref e) => tracing::warn!(error = %e, "Failed to serialize audit event"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issued_event_carries_token_fields() {
        // GIVEN: an issued token
        let event = AuditEvent::issued("admin", "web-app", "password", "jti-1", "read", "kid-1");

        // WHEN: serialized
        let json: serde_json::Value = serde_json::to_value(&event).unwrap();

        // THEN: every token field is present
        assert_eq!(json["event"], "token.issued");
        assert_eq!(json["principal"], "admin");
        assert_eq!(json["client_id"], "web-app");
        assert_eq!(json["token_jti"], "jti-1");
        assert_eq!(json["kid"], "kid-1");
        assert!(json.get("reason").is_none());
    }

    #[test]
    fn refresh_grant_is_reported_as_refreshed() {
        let event = AuditEvent::issued("admin", "web-app", "refresh_token", "j", "", "k");
        assert_eq!(event.event, "token.refreshed");
    }

    #[test]
    fn denied_event_omits_missing_fields() {
        let event = AuditEvent::denied(None, Some("password"), "bad credentials");
        let json: serde_json::Value = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "token.denied");
        assert_eq!(json["reason"], "bad credentials");
        assert!(json.get("client_id").is_none());
        assert!(json.get("token_jti").is_none());
    }

    #[test]
    fn key_rotated_event() {
        let event = AuditEvent::key_rotated("kid-9", "scheduled");
        assert_eq!(event.event, "key.rotated");
        assert_eq!(event.kid.as_deref(), Some("kid-9"));
    }

    #[test]
    fn emit_does_not_panic() {
        emit(&AuditEvent::revoked("admin", "web-app", "jti-1"));
    }
}
