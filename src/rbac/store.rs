//! RBAC persistence.
//!
//! [`RbacStore`] is the seam a SQL backend would implement. Each mutation is
//! its own method so callers can wrap every change in an audit event.
//! [`InMemoryRbacStore`] keeps all four tables behind one lock, which makes
//! the delete cascades atomic.

use std::collections::{BTreeSet, HashMap};

use parking_lot::RwLock;
use uuid::Uuid;

use super::RbacError;
use super::model::{NewPermission, NewRole, Permission, PermissionUpdate, Role, RoleUpdate};

/// Trait abstracting the RBAC storage backend.
#[async_trait::async_trait]
pub trait RbacStore: Send + Sync + 'static {
    /// Create a role. Names are unique.
    async fn create_role(&self, new: NewRole) -> Result<Role, RbacError>;

    /// Fetch a role by id.
    async fn get_role(&self, id: Uuid) -> Result<Role, RbacError>;

    /// Fetch a role by name.
    async fn find_role_by_name(&self, name: &str) -> Result<Option<Role>, RbacError>;

    /// All roles, ordered by name.
    async fn list_roles(&self) -> Result<Vec<Role>, RbacError>;

    /// Update a role's name and/or description.
    async fn update_role(&self, id: Uuid, update: RoleUpdate) -> Result<Role, RbacError>;

    /// Delete a role together with its permission and user assignments.
    async fn delete_role(&self, id: Uuid) -> Result<(), RbacError>;

    /// Create a permission. Names are unique.
    async fn create_permission(&self, new: NewPermission) -> Result<Permission, RbacError>;

    /// Fetch a permission by id.
    async fn get_permission(&self, id: Uuid) -> Result<Permission, RbacError>;

    /// All permissions, ordered by name.
    async fn list_permissions(&self) -> Result<Vec<Permission>, RbacError>;

    /// Update a permission.
    async fn update_permission(
        &self,
        id: Uuid,
        update: PermissionUpdate,
    ) -> Result<Permission, RbacError>;

    /// Delete a permission together with its role assignments.
    async fn delete_permission(&self, id: Uuid) -> Result<(), RbacError>;

    /// Grant a permission to a role. Granting twice is a no-op.
    async fn assign_permission_to_role(
        &self,
        role_id: Uuid,
        permission_id: Uuid,
    ) -> Result<(), RbacError>;

    /// Revoke a permission from a role.
    async fn remove_permission_from_role(
        &self,
        role_id: Uuid,
        permission_id: Uuid,
    ) -> Result<(), RbacError>;

    /// Permissions granted to a role, ordered by name.
    async fn role_permissions(&self, role_id: Uuid) -> Result<Vec<Permission>, RbacError>;

    /// Give a user a role. Assigning twice is a no-op.
    async fn assign_role_to_user(&self, user_id: Uuid, role_id: Uuid) -> Result<(), RbacError>;

    /// Take a role away from a user.
    async fn remove_role_from_user(&self, user_id: Uuid, role_id: Uuid)
    -> Result<(), RbacError>;

    /// Replace the full set of a user's roles. All ids must exist, otherwise
    /// nothing changes.
    async fn update_user_roles(&self, user_id: Uuid, role_ids: Vec<Uuid>)
    -> Result<(), RbacError>;

    /// Roles held by a user, ordered by name.
    async fn user_roles(&self, user_id: Uuid) -> Result<Vec<Role>, RbacError>;

    /// Names of the roles held by a user, ordered by name. This is what gets
    /// embedded in token claims.
    async fn user_role_names(&self, user_id: Uuid) -> Result<Vec<String>, RbacError> {
        Ok(self
            .user_roles(user_id)
            .await?
            .into_iter()
            .map(|r| r.name)
            .collect())
    }
}

#[derive(Default)]
struct Tables {
    roles: HashMap<Uuid, Role>,
    permissions: HashMap<Uuid, Permission>,
    /// (role, permission)
    role_permissions: BTreeSet<(Uuid, Uuid)>,
    /// (user, role)
    user_roles: BTreeSet<(Uuid, Uuid)>,
}

impl Tables {
    fn role_name_taken(&self, name: &str, except: Option<Uuid>) -> bool {
        self.roles
            .values()
            .any(|r| r.name == name && Some(r.id) != except)
    }

    fn permission_name_taken(&self, name: &str, except: Option<Uuid>) -> bool {
        self.permissions
            .values()
            .any(|p| p.name == name && Some(p.id) != except)
    }

    fn require_role(&self, id: Uuid) -> Result<&Role, RbacError> {
        self.roles
            .get(&id)
            .ok_or_else(|| RbacError::NotFound(format!("role {id}")))
    }

    fn require_permission(&self, id: Uuid) -> Result<&Permission, RbacError> {
        self.permissions
            .get(&id)
            .ok_or_else(|| RbacError::NotFound(format!("permission {id}")))
    }
}

fn non_empty(field: &str, value: &str) -> Result<String, RbacError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        Err(RbacError::Invalid(format!("{field} must not be empty")))
    } else {
        Ok(trimmed.to_string())
    }
}

fn sorted_by_name<T>(mut items: Vec<T>, name: impl Fn(&T) -> &str) -> Vec<T> {
    items.sort_by(|a, b| name(a).cmp(name(b)));
    items
}

/// In-memory RBAC store.
#[derive(Default)]
pub struct InMemoryRbacStore {
    tables: RwLock<Tables>,
}

impl InMemoryRbacStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl RbacStore for InMemoryRbacStore {
    async fn create_role(&self, new: NewRole) -> Result<Role, RbacError> {
        let name = non_empty("role name", &new.name)?;
        let mut t = self.tables.write();
        if t.role_name_taken(&name, None) {
            return Err(RbacError::Conflict(format!("role {name}")));
        }
        let role = Role {
            id: Uuid::new_v4(),
            name,
            description: new.description,
        };
        t.roles.insert(role.id, role.clone());
        Ok(role)
    }

    async fn get_role(&self, id: Uuid) -> Result<Role, RbacError> {
        self.tables.read().require_role(id).cloned()
    }

    async fn find_role_by_name(&self, name: &str) -> Result<Option<Role>, RbacError> {
        Ok(self
            .tables
            .read()
            .roles
            .values()
            .find(|r| r.name == name)
            .cloned())
    }

    async fn list_roles(&self) -> Result<Vec<Role>, RbacError> {
        let roles = self.tables.read().roles.values().cloned().collect();
        Ok(sorted_by_name(roles, |r: &Role| r.name.as_str()))
    }

    async fn update_role(&self, id: Uuid, update: RoleUpdate) -> Result<Role, RbacError> {
        let mut t = self.tables.write();
        t.require_role(id)?;
        let name = update
            .name
            .as_deref()
            .map(|n| non_empty("role name", n))
            .transpose()?;
        if let Some(ref n) = name {
            if t.role_name_taken(n, Some(id)) {
                return Err(RbacError::Conflict(format!("role {n}")));
            }
        }
        let role = t
            .roles
            .get_mut(&id)
            .ok_or_else(|| RbacError::NotFound(format!("role {id}")))?;
        if let Some(n) = name {
            role.name = n;
        }
        if let Some(d) = update.description {
            role.description = d;
        }
        Ok(role.clone())
    }

    async fn delete_role(&self, id: Uuid) -> Result<(), RbacError> {
        let mut t = self.tables.write();
        if t.roles.remove(&id).is_none() {
            return Err(RbacError::NotFound(format!("role {id}")));
        }
        t.role_permissions.retain(|(role, _)| *role != id);
        t.user_roles.retain(|(_, role)| *role != id);
        Ok(())
    }

    async fn create_permission(&self, new: NewPermission) -> Result<Permission, RbacError> {
        let name = non_empty("permission name", &new.name)?;
        let resource = non_empty("resource", &new.resource)?;
        let action = non_empty("action", &new.action)?;
        let mut t = self.tables.write();
        if t.permission_name_taken(&name, None) {
            return Err(RbacError::Conflict(format!("permission {name}")));
        }
        let permission = Permission {
            id: Uuid::new_v4(),
            name,
            resource,
            action,
        };
        t.permissions.insert(permission.id, permission.clone());
        Ok(permission)
    }

    async fn get_permission(&self, id: Uuid) -> Result<Permission, RbacError> {
        self.tables.read().require_permission(id).cloned()
    }

    async fn list_permissions(&self) -> Result<Vec<Permission>, RbacError> {
        let permissions = self.tables.read().permissions.values().cloned().collect();
        Ok(sorted_by_name(permissions, |p: &Permission| p.name.as_str()))
    }

    async fn update_permission(
        &self,
        id: Uuid,
        update: PermissionUpdate,
    ) -> Result<Permission, RbacError> {
        let mut t = self.tables.write();
        t.require_permission(id)?;
        let name = update
            .name
            .as_deref()
            .map(|n| non_empty("permission name", n))
            .transpose()?;
        let resource = update
            .resource
            .as_deref()
            .map(|r| non_empty("resource", r))
            .transpose()?;
        let action = update
            .action
            .as_deref()
            .map(|a| non_empty("action", a))
            .transpose()?;
        if let Some(ref n) = name {
            if t.permission_name_taken(n, Some(id)) {
                return Err(RbacError::Conflict(format!("permission {n}")));
            }
        }
        let permission = t
            .permissions
            .get_mut(&id)
            .ok_or_else(|| RbacError::NotFound(format!("permission {id}")))?;
        if let Some(n) = name {
            permission.name = n;
        }
        if let Some(r) = resource {
            permission.resource = r;
        }
        if let Some(a) = action {
            permission.action = a;
        }
        Ok(permission.clone())
    }

    async fn delete_permission(&self, id: Uuid) -> Result<(), RbacError> {
        let mut t = self.tables.write();
        if t.permissions.remove(&id).is_none() {
            return Err(RbacError::NotFound(format!("permission {id}")));
        }
        t.role_permissions.retain(|(_, perm)| *perm != id);
        Ok(())
    }

    async fn assign_permission_to_role(
        &self,
        role_id: Uuid,
        permission_id: Uuid,
    ) -> Result<(), RbacError> {
        let mut t = self.tables.write();
        t.require_role(role_id)?;
        t.require_permission(permission_id)?;
        t.role_permissions.insert((role_id, permission_id));
        Ok(())
    }

    async fn remove_permission_from_role(
        &self,
        role_id: Uuid,
        permission_id: Uuid,
    ) -> Result<(), RbacError> {
        if self
            .tables
            .write()
            .role_permissions
            .remove(&(role_id, permission_id))
        {
            Ok(())
        } else {
            Err(RbacError::NotFound(format!(
                "permission {permission_id} on role {role_id}"
            )))
        }
    }

    async fn role_permissions(&self, role_id: Uuid) -> Result<Vec<Permission>, RbacError> {
        let t = self.tables.read();
        t.require_role(role_id)?;
        let permissions = t
            .role_permissions
            .iter()
            .filter(|(role, _)| *role == role_id)
            .filter_map(|(_, perm)| t.permissions.get(perm).cloned())
            .collect();
        Ok(sorted_by_name(permissions, |p: &Permission| p.name.as_str()))
    }

    async fn assign_role_to_user(&self, user_id: Uuid, role_id: Uuid) -> Result<(), RbacError> {
        let mut t = self.tables.write();
        t.require_role(role_id)?;
        t.user_roles.insert((user_id, role_id));
        Ok(())
    }

    async fn remove_role_from_user(
        &self,
        user_id: Uuid,
        role_id: Uuid,
    ) -> Result<(), RbacError> {
        if self.tables.write().user_roles.remove(&(user_id, role_id)) {
            Ok(())
        } else {
            Err(RbacError::NotFound(format!("role {role_id} on user {user_id}")))
        }
    }

    async fn update_user_roles(
        &self,
        user_id: Uuid,
        role_ids: Vec<Uuid>,
    ) -> Result<(), RbacError> {
        let mut t = self.tables.write();
        for id in &role_ids {
            t.require_role(*id)?;
        }
        t.user_roles.retain(|(user, _)| *user != user_id);
        t.user_roles
            .extend(role_ids.into_iter().map(|role| (user_id, role)));
        Ok(())
    }

    async fn user_roles(&self, user_id: Uuid) -> Result<Vec<Role>, RbacError> {
        let t = self.tables.read();
        let roles = t
            .user_roles
            .range((user_id, Uuid::nil())..=(user_id, Uuid::max()))
            .filter_map(|(_, role)| t.roles.get(role).cloned())
            .collect();
        Ok(sorted_by_name(roles, |r: &Role| r.name.as_str()))
    }
}
