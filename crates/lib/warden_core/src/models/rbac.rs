//! RBAC graph entities and their department-scoped join relations.
//!
//! Every join is a standalone record keyed by the two (or three) foreign ids;
//! traversal happens through store queries, never through back-pointers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::uuid::uuidv7;
use crate::values::EntityName;

// =============================================================================
// Entities
// =============================================================================

/// Organizational department, the scope of every grant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Department {
    pub id: Uuid,
    pub name: EntityName,
    pub created_at: DateTime<Utc>,
}

impl Department {
    pub fn new(name: EntityName) -> Self {
        Self {
            id: uuidv7(),
            name,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Role {
    pub id: Uuid,
    pub name: EntityName,
    pub description: Option<String>,
}

impl Role {
    pub fn new(name: EntityName, description: Option<String>) -> Self {
        Self {
            id: uuidv7(),
            name,
            description,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Permission {
    pub id: Uuid,
    pub name: EntityName,
    pub description: Option<String>,
}

impl Permission {
    pub fn new(name: EntityName, description: Option<String>) -> Self {
        Self {
            id: uuidv7(),
            name,
            description,
        }
    }
}

// =============================================================================
// Relations
// =============================================================================

/// A user's membership in a role, independent of department.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct UserRole {
    pub id: Uuid,
    pub user_id: Uuid,
    pub role_id: Uuid,
}

impl UserRole {
    pub fn new(user_id: Uuid, role_id: Uuid) -> Self {
        Self {
            id: uuidv7(),
            user_id,
            role_id,
        }
    }
}

/// Scopes a [`UserRole`] to a department. Without such a row the membership
/// grants nothing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct UserRoleInDepartment {
    pub id: Uuid,
    pub user_role_id: Uuid,
    pub department_id: Uuid,
}

impl UserRoleInDepartment {
    pub fn new(user_role_id: Uuid, department_id: Uuid) -> Self {
        Self {
            id: uuidv7(),
            user_role_id,
            department_id,
        }
    }
}

/// Department-scoped grant of a permission to a role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct RolePermission {
    pub id: Uuid,
    pub role_id: Uuid,
    pub permission_id: Uuid,
    pub department_id: Uuid,
}

impl RolePermission {
    pub fn new(role_id: Uuid, permission_id: Uuid, department_id: Uuid) -> Self {
        Self {
            id: uuidv7(),
            role_id,
            permission_id,
            department_id,
        }
    }
}

/// Department-scoped grant of a permission directly to a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct UserPermission {
    pub id: Uuid,
    pub user_id: Uuid,
    pub permission_id: Uuid,
    pub department_id: Uuid,
}

impl UserPermission {
    pub fn new(user_id: Uuid, permission_id: Uuid, department_id: Uuid) -> Self {
        Self {
            id: uuidv7(),
            user_id,
            permission_id,
            department_id,
        }
    }
}

/// Every grant scoped to one department.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DepartmentGrants {
    pub department_id: Uuid,
    pub role_permissions: Vec<RolePermission>,
    pub user_permissions: Vec<UserPermission>,
}

/// Every grant, in any department, that references one permission.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PermissionGrants {
    pub role_permissions: Vec<RolePermission>,
    pub user_permissions: Vec<UserPermission>,
}
