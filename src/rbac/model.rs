//! RBAC record shapes shared by the store and the admin API.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A named role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    /// Stable role identifier
    pub id: Uuid,
    /// Unique role name, embedded in token claims
    pub name: String,
    /// Free text
    #[serde(default)]
    pub description: String,
}

/// A permission on a resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permission {
    /// Stable permission identifier
    pub id: Uuid,
    /// Unique permission name
    pub name: String,
    /// Resource the permission applies to (e.g. `"documents"`)
    pub resource: String,
    /// Action on the resource (e.g. `"read"`)
    pub action: String,
}

/// Input for creating a role.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewRole {
    /// Unique role name
    pub name: String,
    /// Free text
    #[serde(default)]
    pub description: String,
}

/// Partial update of a role. Absent fields are left unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoleUpdate {
    /// New name
    #[serde(default)]
    pub name: Option<String>,
    /// New description
    #[serde(default)]
    pub description: Option<String>,
}

/// Input for creating a permission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewPermission {
    /// Unique permission name
    pub name: String,
    /// Resource
    pub resource: String,
    /// Action
    pub action: String,
}

/// Partial update of a permission.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PermissionUpdate {
    /// New name
    #[serde(default)]
    pub name: Option<String>,
    /// New resource
    #[serde(default)]
    pub resource: Option<String>,
    /// New action
    #[serde(default)]
    pub action: Option<String>,
}
