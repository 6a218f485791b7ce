//! HTTP handlers for the token endpoints.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET` | `/health` | Liveness probe (used by remote key caches) |
//! | `GET` | `/auth/keys` | Active and retiring public keys as JSON |
//! | `GET` | `/auth/public-key` | Active public key as PEM |
//! | `POST` | `/auth/validate` | 200 if the bearer token is valid and unrevoked |
//! | `GET` | `/auth/me` | Claims of the bearer token |
//! | `POST` | `/auth/refresh` | Exchange a refresh token for a new pair |
//! | `POST` | `/auth/logout` | Revoke a refresh token (and optionally an access token) |

use axum::{
    Extension, Json,
    extract::State,
    http::{HeaderMap, StatusCode, Uri, header},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use serde_json::json;
use tracing::error;

use super::AppState;
use super::auth::{AuthError, log_rejection};
use crate::keys::{KeySet, PublishedKey};
use crate::token::{Claims, TokenError};

/// `POST /auth/refresh` body.
#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    /// Refresh token to exchange
    pub refresh_token: String,
}

/// `POST /auth/logout` body.
#[derive(Debug, Deserialize)]
pub struct LogoutRequest {
    /// Refresh token to revoke
    pub refresh_token: String,
    /// Access token to revoke as well
    #[serde(default)]
    pub access_token: Option<String>,
}

/// `GET /health`
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let active = state.tokens.keys().active_key();
    Json(json!({
        "status": "ok",
        "active_kid": active.kid,
    }))
}

/// `GET /auth/keys`
pub async fn keys(State(state): State<AppState>) -> Json<KeySet> {
    let keys = state
        .tokens
        .keys()
        .verification_keys()
        .iter()
        .map(PublishedKey::from)
        .collect();
    Json(KeySet { keys })
}

/// `GET /auth/public-key`
pub async fn public_key(State(state): State<AppState>) -> Response {
    let active = state.tokens.keys().active_key();
    (
        [
            (header::CONTENT_TYPE, "application/x-pem-file".to_string()),
            (header::HeaderName::from_static("x-key-id"), active.kid),
        ],
        active.public_key_pem,
    )
        .into_response()
}

/// `POST /auth/validate`
///
/// Runs behind the authentication layer, which already verified the bearer
/// token and stored the claims.
pub async fn validate(claims: Option<Extension<Claims>>) -> Response {
    match claims {
        Some(Extension(claims)) => Json(json!({
            "valid": true,
            "sub": claims.sub,
            "roles": claims.roles,
            "typ": claims.typ,
            "exp": claims.exp,
            "jti": claims.jti,
        }))
        .into_response(),
        None => AuthError::Unauthenticated.into_response(),
    }
}

/// `GET /auth/me`
pub async fn me(Extension(claims): Extension<Claims>) -> Json<Claims> {
    Json(claims)
}

/// `POST /auth/refresh`
pub async fn refresh(
    State(state): State<AppState>,
    headers: HeaderMap,
    uri: Uri,
    Json(body): Json<RefreshRequest>,
) -> Response {
    match state.tokens.refresh_token(&body.refresh_token).await {
        Ok(pair) => (StatusCode::OK, Json(pair)).into_response(),
        Err(e) => token_failure(&e, &headers, uri.path()),
    }
}

/// `POST /auth/logout`
pub async fn logout(
    State(state): State<AppState>,
    headers: HeaderMap,
    uri: Uri,
    Json(body): Json<LogoutRequest>,
) -> Response {
    let mut tokens = vec![body.refresh_token.as_str()];
    tokens.extend(body.access_token.as_deref());
    match state.tokens.revoke_tokens(&tokens).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => token_failure(&e, &headers, uri.path()),
    }
}

/// Map a token failure to a response: backend failures are `500`, every
/// other kind is an opaque `401` with the reason logged.
fn token_failure(err: &TokenError, headers: &HeaderMap, path: &str) -> Response {
    match err {
        TokenError::Storage(_) | TokenError::Signing(_) => {
            error!(error = %err, path = %path, "Token operation failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", "internal error")
        }
        _ => {
            log_rejection(err, headers, path);
            AuthError::Unauthenticated.into_response()
        }
    }
}

/// Create a JSON error response.
pub(crate) fn error_response(status: StatusCode, error: &str, message: &str) -> Response {
    (status, Json(json!({"error": error, "message": message}))).into_response()
}
