//! Request authentication and role gates.
//!
//! Layering, outermost first:
//!
//! 1. [`authenticate`] reads `Authorization: Bearer <token>`, verifies it with
//!    the configured [`TokenVerifier`] and stores the [`Claims`] in the request
//!    extensions. A request without a bearer token passes through without
//!    claims; a request with a bad token is rejected with an opaque `401`.
//! 2. [`require_auth`] rejects requests that carry no claims.
//! 3. [`require_role`] additionally rejects claims that lack a role (`403`).
//!
//! Role checks only look at the claims snapshot, never at the RBAC store.

use std::sync::Arc;

use axum::{
    Json,
    body::Body,
    extract::State,
    http::{HeaderMap, Request, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, warn};

use crate::audit::{self, AuditEvent};
use crate::token::{Claims, TokenError};

/// Result of verifying a presented token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyOutcome {
    /// Signature, expiry and revocation checks passed
    Verified(Claims),
    /// Verification is disabled (fail-open with no keys); the request
    /// proceeds as unauthenticated
    Bypass,
}

/// Anything that can turn a bearer token into verified claims: the issuing
/// [`crate::token::TokenService`] or a [`crate::remote::RemoteVerifier`].
#[async_trait::async_trait]
pub trait TokenVerifier: Send + Sync + 'static {
    /// Verify `token` as a request credential. Only access tokens pass;
    /// anything else is [`TokenError::WrongTokenType`].
    async fn verify(&self, token: &str) -> Result<VerifyOutcome, TokenError>;
}

/// Authorization failures at the HTTP boundary.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// No valid token
    #[error("unauthenticated")]
    Unauthenticated,

    /// Valid token, missing role
    #[error("insufficient permissions")]
    InsufficientPermissions,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        match self {
            Self::Unauthenticated => (
                StatusCode::UNAUTHORIZED,
                [(header::WWW_AUTHENTICATE, "Bearer")],
                Json(json!({ "error": "unauthorized" })),
            )
                .into_response(),
            Self::InsufficientPermissions => (
                StatusCode::FORBIDDEN,
                Json(json!({ "error": "forbidden" })),
            )
                .into_response(),
        }
    }
}

/// Role a [`require_role`] layer demands.
#[derive(Debug, Clone)]
pub struct RequiredRole(pub Arc<str>);

impl RequiredRole {
    /// Require `role`.
    #[must_use]
    pub fn new(role: &str) -> Self {
        Self(Arc::from(role))
    }
}

/// Extract the token from an `Authorization: Bearer` header.
pub(crate) fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer ").or_else(|| v.strip_prefix("bearer ")))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Correlation id for log lines: the request id if one was assigned.
pub(crate) fn correlation_id(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map_or_else(|| uuid::Uuid::new_v4().to_string(), str::to_string)
}

/// Log a rejected token with its specific reason. The caller only ever sees
/// an opaque `401`.
pub(crate) fn log_rejection(err: &TokenError, headers: &HeaderMap, path: &str) {
    let correlation = correlation_id(headers);
    warn!(
        reason = err.kind(),
        correlation_id = %correlation,
        path = %path,
        "Rejected bearer token"
    );
    audit::emit(&AuditEvent::token_rejected(err.kind(), &correlation));
}

/// Authentication middleware.
pub async fn authenticate(
    State(verifier): State<Arc<dyn TokenVerifier>>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let Some(token) = bearer_token(request.headers()).map(str::to_owned) else {
        return next.run(request).await;
    };

    match verifier.verify(&token).await {
        Ok(VerifyOutcome::Verified(claims)) => {
            debug!(sub = %claims.sub, path = %request.uri().path(), "Authenticated request");
            request.extensions_mut().insert(claims);
            next.run(request).await
        }
        Ok(VerifyOutcome::Bypass) => next.run(request).await,
        Err(e) => {
            log_rejection(&e, request.headers(), request.uri().path());
            AuthError::Unauthenticated.into_response()
        }
    }
}

/// Reject requests without verified claims.
pub async fn require_auth(request: Request<Body>, next: Next) -> Result<Response, AuthError> {
    if request.extensions().get::<Claims>().is_none() {
        return Err(AuthError::Unauthenticated);
    }
    Ok(next.run(request).await)
}

/// Reject requests whose claims lack the configured role.
///
/// ```ignore
/// router.route_layer(middleware::from_fn_with_state(RequiredRole::new("admin"), require_role))
/// ```
pub async fn require_role(
    State(RequiredRole(role)): State<RequiredRole>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, AuthError> {
    let Some(claims) = request.extensions().get::<Claims>() else {
        return Err(AuthError::Unauthenticated);
    };
    if !claims.has_role(&role) {
        warn!(sub = %claims.sub, role = %role, "Missing required role");
        return Err(AuthError::InsufficientPermissions);
    }
    Ok(next.run(request).await)
}
