//! Durable entity store boundary.
//!
//! Reads are plain async queries split by concern ([`UserStore`],
//! [`RbacStore`], [`TokenStore`]). Writes are staged into a [`UnitOfWork`]
//! and applied by [`Transactional::commit`] as one atomic transaction. Both
//! adapters enforce the same unique and foreign-key constraints, so a racing
//! duplicate insert fails at commit even if it passed the existence check.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{
    Department, DepartmentGrants, Permission, PermissionGrants, RefreshToken, Role,
    RolePermission, User, UserPermission, UserRole, UserRoleInDepartment,
};
use crate::values::Email;

pub use memory::InMemoryStore;
pub use postgres::PgStore;

/// Store adapter errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A unique constraint rejected the write (constraint name).
    #[error("Unique constraint violated: {0}")]
    UniqueViolation(String),

    /// A write referenced a row that does not exist.
    #[error("Foreign key violated: {0}")]
    ForeignKeyViolation(String),

    /// An update or delete targeted a missing row.
    #[error("Row not found: {0}")]
    RowNotFound(String),

    /// Persisted data failed value-object validation.
    #[error("Corrupt row: {0}")]
    Corrupt(String),

    #[error("Database error: {0}")]
    Backend(String),
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// One staged write.
#[derive(Debug, Clone)]
pub enum Mutation {
    InsertUser(User),
    UpdateUser(User),
    SetActiveDepartment {
        user_id: Uuid,
        department_id: Option<Uuid>,
    },

    InsertDepartment(Department),
    UpdateDepartment(Department),
    DeleteDepartment(Uuid),

    InsertRole(Role),
    UpdateRole(Role),
    DeleteRole(Uuid),

    InsertPermission(Permission),
    UpdatePermission(Permission),
    DeletePermission(Uuid),

    InsertUserRole(UserRole),
    DeleteUserRole(Uuid),

    InsertUserRoleDepartment(UserRoleInDepartment),
    DeleteUserRoleDepartment(Uuid),

    InsertRolePermission(RolePermission),
    UpdateRolePermission(RolePermission),
    DeleteRolePermission(Uuid),

    InsertUserPermission(UserPermission),
    UpdateUserPermission(UserPermission),
    DeleteUserPermission(Uuid),

    InsertRefreshToken(RefreshToken),
    RevokeRefreshToken {
        id: Uuid,
        revoked_at: DateTime<Utc>,
        reason: String,
    },
}

/// Ordered set of mutations committed together.
#[derive(Debug, Clone, Default)]
pub struct UnitOfWork {
    mutations: Vec<Mutation>,
}

impl UnitOfWork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage a single mutation.
    pub fn stage(&mut self, mutation: Mutation) -> &mut Self {
        self.mutations.push(mutation);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.mutations.len()
    }

    pub fn into_mutations(self) -> Vec<Mutation> {
        self.mutations
    }
}

impl From<Mutation> for UnitOfWork {
    fn from(mutation: Mutation) -> Self {
        Self {
            mutations: vec![mutation],
        }
    }
}

// =============================================================================
// Read traits
// =============================================================================

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn find_user(&self, id: Uuid) -> StoreResult<Option<User>>;

    async fn find_user_by_email(&self, email: &Email) -> StoreResult<Option<User>>;

    async fn email_exists(&self, email: &Email) -> StoreResult<bool>;

    /// Users whose active department pointer is `department_id`.
    async fn users_with_active_department(&self, department_id: Uuid) -> StoreResult<Vec<User>>;
}

#[async_trait]
pub trait RbacStore: Send + Sync {
    async fn find_department(&self, id: Uuid) -> StoreResult<Option<Department>>;

    async fn list_departments(&self) -> StoreResult<Vec<Department>>;

    async fn find_role(&self, id: Uuid) -> StoreResult<Option<Role>>;

    async fn list_roles(&self) -> StoreResult<Vec<Role>>;

    async fn find_permission(&self, id: Uuid) -> StoreResult<Option<Permission>>;

    async fn list_permissions(&self) -> StoreResult<Vec<Permission>>;

    /// Whether another permission already uses `name` (optionally ignoring one id).
    async fn permission_name_exists(&self, name: &str, excluding: Option<Uuid>)
    -> StoreResult<bool>;

    async fn find_user_role(&self, id: Uuid) -> StoreResult<Option<UserRole>>;

    async fn find_user_role_by_pair(
        &self,
        user_id: Uuid,
        role_id: Uuid,
    ) -> StoreResult<Option<UserRole>>;

    async fn user_roles_for_user(&self, user_id: Uuid) -> StoreResult<Vec<UserRole>>;

    async fn find_user_role_department(
        &self,
        id: Uuid,
    ) -> StoreResult<Option<UserRoleInDepartment>>;

    async fn user_role_department_exists(
        &self,
        user_role_id: Uuid,
        department_id: Uuid,
    ) -> StoreResult<bool>;

    async fn user_role_departments(
        &self,
        user_role_id: Uuid,
    ) -> StoreResult<Vec<UserRoleInDepartment>>;

    /// Distinct roles a user holds within a department.
    async fn roles_in_department(
        &self,
        user_id: Uuid,
        department_id: Uuid,
    ) -> StoreResult<Vec<Role>>;

    /// Departments in which the user holds at least one role, ordered by name then id.
    async fn departments_for_user(&self, user_id: Uuid) -> StoreResult<Vec<Department>>;

    async fn find_role_permission(&self, id: Uuid) -> StoreResult<Option<RolePermission>>;

    async fn role_permission_exists(
        &self,
        role_id: Uuid,
        permission_id: Uuid,
        department_id: Uuid,
        excluding: Option<Uuid>,
    ) -> StoreResult<bool>;

    /// Permissions granted to a role within a department.
    async fn permissions_for_role(
        &self,
        role_id: Uuid,
        department_id: Uuid,
    ) -> StoreResult<Vec<Permission>>;

    async fn find_user_permission(&self, id: Uuid) -> StoreResult<Option<UserPermission>>;

    async fn user_permission_exists(
        &self,
        user_id: Uuid,
        permission_id: Uuid,
        department_id: Uuid,
        excluding: Option<Uuid>,
    ) -> StoreResult<bool>;

    /// Permissions granted directly to a user within a department.
    async fn permissions_for_user(
        &self,
        user_id: Uuid,
        department_id: Uuid,
    ) -> StoreResult<Vec<Permission>>;

    async fn department_grants(&self, department_id: Uuid) -> StoreResult<DepartmentGrants>;

    async fn grants_for_permission(&self, permission_id: Uuid) -> StoreResult<PermissionGrants>;

    /// Whether any grant row references the permission.
    async fn permission_in_use(&self, permission_id: Uuid) -> StoreResult<bool>;

    /// Whether any membership or grant row references the role.
    async fn role_in_use(&self, role_id: Uuid) -> StoreResult<bool>;

    /// Whether any scoping or grant row references the department.
    async fn department_in_use(&self, department_id: Uuid) -> StoreResult<bool>;
}

#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Look up a refresh token row by the SHA-256 hex digest of the token.
    async fn find_refresh_token(&self, token_hash: &str) -> StoreResult<Option<RefreshToken>>;

    /// Unrevoked, unexpired refresh tokens of a user.
    async fn active_refresh_tokens(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<RefreshToken>>;

    async fn refresh_tokens_for_user(&self, user_id: Uuid) -> StoreResult<Vec<RefreshToken>>;

    /// Delete rows that are both revoked and expired; returns the count.
    async fn delete_reapable_refresh_tokens(&self, now: DateTime<Utc>) -> StoreResult<u64>;
}

#[async_trait]
pub trait Transactional: Send + Sync {
    /// Apply every staged mutation atomically, or none of them.
    async fn commit(&self, work: UnitOfWork) -> StoreResult<()>;
}

/// Full store: every read concern plus commit.
pub trait Store: UserStore + RbacStore + TokenStore + Transactional {}

impl<T> Store for T where T: UserStore + RbacStore + TokenStore + Transactional + ?Sized {}
