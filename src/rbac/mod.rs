//! Role-based access control: roles, permissions and their assignments.
//!
//! The store is the source of truth for who holds which role. Tokens carry a
//! snapshot of the holder's role names taken at issuance (and re-read at
//! refresh), and the request middleware in [`crate::server::auth`] only ever
//! looks at that snapshot. A role change therefore takes effect for a user
//! once they obtain a new token, at the latest one access-token lifetime
//! later.

pub mod model;
pub mod store;

use thiserror::Error;

pub use model::{NewPermission, NewRole, Permission, PermissionUpdate, Role, RoleUpdate};
pub use store::{InMemoryRbacStore, RbacStore};

use crate::error::StorageError;

/// RBAC store errors
#[derive(Error, Debug)]
pub enum RbacError {
    /// Role, permission or assignment does not exist
    #[error("{0} not found")]
    NotFound(String),

    /// A role or permission with this name already exists
    #[error("{0} already exists")]
    Conflict(String),

    /// Input rejected (e.g. empty name)
    #[error("invalid input: {0}")]
    Invalid(String),

    /// Backend failure
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}
