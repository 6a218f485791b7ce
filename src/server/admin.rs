//! Admin API: RBAC CRUD and key management.
//!
//! Every route here sits behind `require_role("admin")`. Each successful
//! mutation emits one `rbac_changed` audit event attributed to the caller's
//! `sub`.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET` / `POST` | `/admin/roles` | List / create roles |
//! | `GET` / `PATCH` / `DELETE` | `/admin/roles/{id}` | Read / update / delete a role |
//! | `GET` | `/admin/roles/{id}/permissions` | Permissions granted to a role |
//! | `PUT` / `DELETE` | `/admin/roles/{id}/permissions/{permission_id}` | Grant / revoke |
//! | `GET` / `POST` | `/admin/permissions` | List / create permissions |
//! | `GET` / `PATCH` / `DELETE` | `/admin/permissions/{id}` | Read / update / delete a permission |
//! | `GET` / `PUT` | `/admin/users/{id}/roles` | A user's roles / replace them all |
//! | `PUT` / `DELETE` | `/admin/users/{id}/roles/{role_id}` | Assign / remove one role |
//! | `GET` | `/admin/keys` | All signing keys, including retired ones |
//! | `POST` | `/admin/keys/rotate` | Rotate the signing key now |

use axum::{
    Extension, Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use serde::Deserialize;
use tracing::error;
use uuid::Uuid;

use super::AppState;
use super::handlers::error_response;
use crate::audit::{self, AuditEvent};
use crate::keys::PublishedKey;
use crate::rbac::{NewPermission, NewRole, PermissionUpdate, RbacError, RoleUpdate};
use crate::token::Claims;

/// `PUT /admin/users/{id}/roles` body.
#[derive(Debug, Deserialize)]
pub struct UserRolesRequest {
    /// Complete set of role ids the user should hold
    pub role_ids: Vec<Uuid>,
}

impl IntoResponse for RbacError {
    fn into_response(self) -> Response {
        match &self {
            Self::NotFound(_) => error_response(StatusCode::NOT_FOUND, "not_found", &self.to_string()),
            Self::Conflict(_) => error_response(StatusCode::CONFLICT, "conflict", &self.to_string()),
            Self::Invalid(_) => {
                error_response(StatusCode::BAD_REQUEST, "invalid_request", &self.to_string())
            }
            Self::Storage(e) => {
                error!(error = %e, "RBAC store failure");
                error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", "internal error")
            }
        }
    }
}

/// Admin routes. The caller layers the role gate on top.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/admin/roles", get(list_roles).post(create_role))
        .route(
            "/admin/roles/{id}",
            get(get_role).patch(update_role).delete(delete_role),
        )
        .route("/admin/roles/{id}/permissions", get(role_permissions))
        .route(
            "/admin/roles/{id}/permissions/{permission_id}",
            put(grant_permission).delete(revoke_permission),
        )
        .route("/admin/permissions", get(list_permissions).post(create_permission))
        .route(
            "/admin/permissions/{id}",
            get(get_permission)
                .patch(update_permission)
                .delete(delete_permission),
        )
        .route("/admin/users/{id}/roles", get(user_roles).put(replace_user_roles))
        .route(
            "/admin/users/{id}/roles/{role_id}",
            put(assign_user_role).delete(remove_user_role),
        )
        .route("/admin/keys", get(list_keys))
        .route("/admin/keys/rotate", post(rotate_key))
}

fn changed(claims: &Claims, action: &str, target: String) {
    audit::emit(&AuditEvent::rbac_changed(&claims.sub, action, target));
}

// ── Roles ────────────────────────────────────────────────────────────────

async fn list_roles(State(state): State<AppState>) -> Result<Response, RbacError> {
    let roles = state.tokens.rbac().list_roles().await?;
    Ok(Json(roles).into_response())
}

async fn create_role(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(body): Json<NewRole>,
) -> Result<Response, RbacError> {
    let role = state.tokens.rbac().create_role(body).await?;
    changed(&claims, "role_created", format!("role:{}", role.id));
    Ok((StatusCode::CREATED, Json(role)).into_response())
}

async fn get_role(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Response, RbacError> {
    let role = state.tokens.rbac().get_role(id).await?;
    Ok(Json(role).into_response())
}

async fn update_role(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<Uuid>,
    Json(body): Json<RoleUpdate>,
) -> Result<Response, RbacError> {
    let role = state.tokens.rbac().update_role(id, body).await?;
    changed(&claims, "role_updated", format!("role:{id}"));
    Ok(Json(role).into_response())
}

async fn delete_role(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, RbacError> {
    state.tokens.rbac().delete_role(id).await?;
    changed(&claims, "role_deleted", format!("role:{id}"));
    Ok(StatusCode::NO_CONTENT)
}

async fn role_permissions(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Response, RbacError> {
    let permissions = state.tokens.rbac().role_permissions(id).await?;
    Ok(Json(permissions).into_response())
}

async fn grant_permission(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path((id, permission_id)): Path<(Uuid, Uuid)>,
) -> Result<StatusCode, RbacError> {
    state
        .tokens
        .rbac()
        .assign_permission_to_role(id, permission_id)
        .await?;
    changed(
        &claims,
        "permission_granted",
        format!("role:{id}/permission:{permission_id}"),
    );
    Ok(StatusCode::NO_CONTENT)
}

async fn revoke_permission(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path((id, permission_id)): Path<(Uuid, Uuid)>,
) -> Result<StatusCode, RbacError> {
    state
        .tokens
        .rbac()
        .remove_permission_from_role(id, permission_id)
        .await?;
    changed(
        &claims,
        "permission_revoked",
        format!("role:{id}/permission:{permission_id}"),
    );
    Ok(StatusCode::NO_CONTENT)
}

// ── Permissions ──────────────────────────────────────────────────────────

async fn list_permissions(State(state): State<AppState>) -> Result<Response, RbacError> {
    let permissions = state.tokens.rbac().list_permissions().await?;
    Ok(Json(permissions).into_response())
}

async fn create_permission(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(body): Json<NewPermission>,
) -> Result<Response, RbacError> {
    let permission = state.tokens.rbac().create_permission(body).await?;
    changed(
        &claims,
        "permission_created",
        format!("permission:{}", permission.id),
    );
    Ok((StatusCode::CREATED, Json(permission)).into_response())
}

async fn get_permission(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Response, RbacError> {
    let permission = state.tokens.rbac().get_permission(id).await?;
    Ok(Json(permission).into_response())
}

async fn update_permission(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<Uuid>,
    Json(body): Json<PermissionUpdate>,
) -> Result<Response, RbacError> {
    let permission = state.tokens.rbac().update_permission(id, body).await?;
    changed(&claims, "permission_updated", format!("permission:{id}"));
    Ok(Json(permission).into_response())
}

async fn delete_permission(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, RbacError> {
    state.tokens.rbac().delete_permission(id).await?;
    changed(&claims, "permission_deleted", format!("permission:{id}"));
    Ok(StatusCode::NO_CONTENT)
}

// ── User roles ───────────────────────────────────────────────────────────

async fn user_roles(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Response, RbacError> {
    let roles = state.tokens.rbac().user_roles(id).await?;
    Ok(Json(roles).into_response())
}

async fn replace_user_roles(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<Uuid>,
    Json(body): Json<UserRolesRequest>,
) -> Result<Response, RbacError> {
    let rbac = state.tokens.rbac();
    rbac.update_user_roles(id, body.role_ids).await?;
    changed(&claims, "user_roles_replaced", format!("user:{id}"));
    Ok(Json(rbac.user_roles(id).await?).into_response())
}

async fn assign_user_role(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path((id, role_id)): Path<(Uuid, Uuid)>,
) -> Result<StatusCode, RbacError> {
    state.tokens.rbac().assign_role_to_user(id, role_id).await?;
    changed(&claims, "role_assigned", format!("user:{id}/role:{role_id}"));
    Ok(StatusCode::NO_CONTENT)
}

async fn remove_user_role(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path((id, role_id)): Path<(Uuid, Uuid)>,
) -> Result<StatusCode, RbacError> {
    state.tokens.rbac().remove_role_from_user(id, role_id).await?;
    changed(&claims, "role_removed", format!("user:{id}/role:{role_id}"));
    Ok(StatusCode::NO_CONTENT)
}

// ── Keys ─────────────────────────────────────────────────────────────────

async fn list_keys(State(state): State<AppState>) -> Json<Vec<PublishedKey>> {
    Json(
        state
            .tokens
            .keys()
            .all_keys()
            .iter()
            .map(PublishedKey::from)
            .collect(),
    )
}

async fn rotate_key(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Response {
    match state.tokens.keys().rotate().await {
        Ok(key) => {
            changed(&claims, "key_rotated", format!("key:{}", key.kid));
            (StatusCode::CREATED, Json(PublishedKey::from(&key))).into_response()
        }
        Err(e) => {
            error!(error = %e, "Manual key rotation failed");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "rotation_failed",
                "key rotation failed",
            )
        }
    }
}
