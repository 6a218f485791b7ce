//! Audit logging for key, token and RBAC lifecycle events.
//!
//! Every event is emitted via `tracing::info!` with the whole event serialized
//! as JSON in the `audit` field, so the trail is queryable by any log
//! aggregator.
//!
//! # Events
//!
//! | Event | When |
//! |-------|------|
//! | `key.rotated` | A new signing key became active |
//! | `key.retired` | A retiring key left its overlap window |
//! | `key.purged` | A retired key's material was deleted |
//! | `token.issued` | A token pair was signed |
//! | `token.refreshed` | A refresh token was exchanged for a new pair |
//! | `token.revoked` | A token was revoked (logout or explicit) |
//! | `token.rejected` | A presented token failed validation |
//! | `rbac.changed` | An admin mutated roles, permissions or assignments |

use serde::Serialize;

/// Structured audit event.
#[derive(Debug, Serialize)]
pub struct AuditEvent {
    /// Event type string (e.g., `"token.issued"`).
    pub event: &'static str,
    /// Subject (user id) the event concerns.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    /// JTI of the affected token.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_jti: Option<String>,
    /// JTI of the token that replaced it (refresh).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replaced_by: Option<String>,
    /// Signing key id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,
    /// Previous signing key id (rotation).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_kid: Option<String>,
    /// Role snapshot embedded in an issued token.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub roles: Option<Vec<String>>,
    /// Who performed an admin action.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    /// Admin action name (e.g. `"role.create"`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    /// Target of an admin action.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Correlation id tying a rejection to the request log line.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Human-readable reason for rejections.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl AuditEvent {
    fn new(event: &'static str) -> Self {
        Self {
            event,
            subject: None,
            token_jti: None,
            replaced_by: None,
            kid: None,
            previous_kid: None,
            roles: None,
            actor: None,
            action: None,
            target: None,
            correlation_id: None,
            reason: None,
        }
    }

    /// Construct a `key.rotated` event.
    #[must_use]
    pub fn key_rotated(kid: &str, previous_kid: &str) -> Self {
        Self {
            kid: Some(kid.to_string()),
            previous_kid: Some(previous_kid.to_string()),
            ..Self::new("key.rotated")
        }
    }

    /// Construct a `key.retired` event.
    #[must_use]
    pub fn key_retired(kid: &str) -> Self {
        Self {
            kid: Some(kid.to_string()),
            ..Self::new("key.retired")
        }
    }

    /// Construct a `key.purged` event.
    #[must_use]
    pub fn key_purged(kid: &str) -> Self {
        Self {
            kid: Some(kid.to_string()),
            ..Self::new("key.purged")
        }
    }

    /// Construct a `token.issued` event.
    #[must_use]
    pub fn token_issued(subject: &str, jti: &str, kid: &str, roles: &[String]) -> Self {
        Self {
            subject: Some(subject.to_string()),
            token_jti: Some(jti.to_string()),
            kid: Some(kid.to_string()),
            roles: Some(roles.to_vec()),
            ..Self::new("token.issued")
        }
    }

    /// Construct a `token.refreshed` event.
    #[must_use]
    pub fn token_refreshed(subject: &str, old_jti: &str, new_jti: &str) -> Self {
        Self {
            subject: Some(subject.to_string()),
            token_jti: Some(old_jti.to_string()),
            replaced_by: Some(new_jti.to_string()),
            ..Self::new("token.refreshed")
        }
    }

    /// Construct a `token.revoked` event.
    #[must_use]
    pub fn token_revoked(subject: &str, jti: &str) -> Self {
        Self {
            subject: Some(subject.to_string()),
            token_jti: Some(jti.to_string()),
            ..Self::new("token.revoked")
        }
    }

    /// Construct a `token.rejected` event.
    #[must_use]
    pub fn token_rejected(reason: impl Into<String>, correlation_id: &str) -> Self {
        Self {
            reason: Some(reason.into()),
            correlation_id: Some(correlation_id.to_string()),
            ..Self::new("token.rejected")
        }
    }

    /// Construct an `rbac.changed` event.
    #[must_use]
    pub fn rbac_changed(actor: &str, action: &str, target: impl Into<String>) -> Self {
        Self {
            actor: Some(actor.to_string()),
            action: Some(action.to_string()),
            target: Some(target.into()),
            ..Self::new("rbac.changed")
        }
    }
}

/// Emit an audit event via `tracing::info!` with structured fields.
///
/// ```text
/// INFO tokenward::audit audit={"event":"token.issued","subject":...}
/// ```
pub fn emit(event: &AuditEvent) {
    match serde_json::to_string(event) {
        Ok(ref json) => tracing::info!(audit = %json, "tokenward audit"),
        Err(ref e) => tracing::warn!(error = %e, "Failed to serialize audit event"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issued_event_carries_role_snapshot() {
        // GIVEN/WHEN: build issued event
        let event = AuditEvent::token_issued("u1", "jti-1", "kid-1", &["user".to_string()]);

        // THEN: type and fields are populated
        assert_eq!(event.event, "token.issued");
        assert_eq!(event.roles.as_deref(), Some(&["user".to_string()][..]));
        assert_eq!(event.kid.as_deref(), Some("kid-1"));
    }

    #[test]
    fn rejected_event_has_reason_and_correlation() {
        let event = AuditEvent::token_rejected("TokenExpired", "c0ffee");

        assert_eq!(event.event, "token.rejected");
        assert_eq!(event.reason.as_deref(), Some("TokenExpired"));
        assert_eq!(event.correlation_id.as_deref(), Some("c0ffee"));
        assert!(event.subject.is_none());
    }

    #[test]
    fn unset_fields_are_omitted_from_json() {
        let json = serde_json::to_string(&AuditEvent::key_retired("k1")).unwrap();

        assert_eq!(json, r#"{"event":"key.retired","kid":"k1"}"#);
    }

    #[test]
    fn emit_does_not_panic() {
        emit(&AuditEvent::rbac_changed("admin-1", "role.create", "editor"));
    }
}
