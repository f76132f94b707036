//! In-process store used by tests and local development.
//!
//! Tables are plain maps behind one `RwLock`. Every mutation checks all of its
//! constraints before it writes anything, so a single mutation is applied in
//! place. A unit of several mutations is applied to a copy of the tables that
//! is swapped in only if every mutation succeeded; that copy costs time
//! proportional to the total row count, which is fine for tests and local
//! development but not for bulk data. Unique and foreign-key rules mirror the
//! Postgres schema.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{
    Mutation, RbacStore, StoreError, StoreResult, TokenStore, Transactional, UnitOfWork,
    UserStore,
};
use crate::models::{
    Department, DepartmentGrants, Permission, PermissionGrants, RefreshToken, Role,
    RolePermission, User, UserPermission, UserRole, UserRoleInDepartment,
};
use crate::values::Email;

#[derive(Debug, Clone, Default)]
struct Tables {
    users: HashMap<Uuid, User>,
    departments: HashMap<Uuid, Department>,
    roles: HashMap<Uuid, Role>,
    permissions: HashMap<Uuid, Permission>,
    user_roles: HashMap<Uuid, UserRole>,
    user_role_departments: HashMap<Uuid, UserRoleInDepartment>,
    role_permissions: HashMap<Uuid, RolePermission>,
    user_permissions: HashMap<Uuid, UserPermission>,
    refresh_tokens: HashMap<Uuid, RefreshToken>,
}

/// Map-backed [`Store`](super::Store) implementation.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn unique(constraint: &str) -> StoreError {
    StoreError::UniqueViolation(constraint.to_string())
}

fn foreign_key(constraint: &str) -> StoreError {
    StoreError::ForeignKeyViolation(constraint.to_string())
}

fn missing(table: &str, id: Uuid) -> StoreError {
    StoreError::RowNotFound(format!("{table}:{id}"))
}

impl Tables {
    fn apply(&mut self, mutation: Mutation) -> StoreResult<()> {
        match mutation {
            // -----------------------------------------------------------------
            // users
            // -----------------------------------------------------------------
            Mutation::InsertUser(user) => {
                if self.users.values().any(|u| u.email == user.email) {
                    return Err(unique("users_email_key"));
                }
                self.users.insert(user.id, user);
            }
            Mutation::UpdateUser(user) => {
                if !self.users.contains_key(&user.id) {
                    return Err(missing("users", user.id));
                }
                if self
                    .users
                    .values()
                    .any(|u| u.id != user.id && u.email == user.email)
                {
                    return Err(unique("users_email_key"));
                }
                self.users.insert(user.id, user);
            }
            Mutation::SetActiveDepartment {
                user_id,
                department_id,
            } => {
                if let Some(dept) = department_id
                    && !self.departments.contains_key(&dept)
                {
                    return Err(foreign_key("users_active_department_id_fkey"));
                }
                let user = self
                    .users
                    .get_mut(&user_id)
                    .ok_or_else(|| missing("users", user_id))?;
                user.active_department_id = department_id;
            }

            // -----------------------------------------------------------------
            // departments / roles / permissions
            // -----------------------------------------------------------------
            Mutation::InsertDepartment(dept) => {
                self.departments.insert(dept.id, dept);
            }
            Mutation::UpdateDepartment(dept) => {
                if !self.departments.contains_key(&dept.id) {
                    return Err(missing("departments", dept.id));
                }
                self.departments.insert(dept.id, dept);
            }
            Mutation::DeleteDepartment(id) => {
                if self.department_referenced(id) {
                    return Err(foreign_key("departments_referenced"));
                }
                self.departments
                    .remove(&id)
                    .ok_or_else(|| missing("departments", id))?;
                for user in self.users.values_mut() {
                    if user.active_department_id == Some(id) {
                        user.active_department_id = None;
                    }
                }
            }
            Mutation::InsertRole(role) => {
                self.roles.insert(role.id, role);
            }
            Mutation::UpdateRole(role) => {
                if !self.roles.contains_key(&role.id) {
                    return Err(missing("roles", role.id));
                }
                self.roles.insert(role.id, role);
            }
            Mutation::DeleteRole(id) => {
                if self.role_referenced(id) {
                    return Err(foreign_key("roles_referenced"));
                }
                self.roles.remove(&id).ok_or_else(|| missing("roles", id))?;
            }
            Mutation::InsertPermission(perm) => {
                if self.permissions.values().any(|p| p.name == perm.name) {
                    return Err(unique("permissions_name_key"));
                }
                self.permissions.insert(perm.id, perm);
            }
            Mutation::UpdatePermission(perm) => {
                if !self.permissions.contains_key(&perm.id) {
                    return Err(missing("permissions", perm.id));
                }
                if self
                    .permissions
                    .values()
                    .any(|p| p.id != perm.id && p.name == perm.name)
                {
                    return Err(unique("permissions_name_key"));
                }
                self.permissions.insert(perm.id, perm);
            }
            Mutation::DeletePermission(id) => {
                if self.permission_referenced(id) {
                    return Err(foreign_key("permissions_referenced"));
                }
                self.permissions
                    .remove(&id)
                    .ok_or_else(|| missing("permissions", id))?;
            }

            // -----------------------------------------------------------------
            // memberships
            // -----------------------------------------------------------------
            Mutation::InsertUserRole(row) => {
                if !self.users.contains_key(&row.user_id) {
                    return Err(foreign_key("user_roles_user_id_fkey"));
                }
                if !self.roles.contains_key(&row.role_id) {
                    return Err(foreign_key("user_roles_role_id_fkey"));
                }
                if self
                    .user_roles
                    .values()
                    .any(|r| r.user_id == row.user_id && r.role_id == row.role_id)
                {
                    return Err(unique("user_roles_user_id_role_id_key"));
                }
                self.user_roles.insert(row.id, row);
            }
            Mutation::DeleteUserRole(id) => {
                self.user_roles
                    .remove(&id)
                    .ok_or_else(|| missing("user_roles", id))?;
                // ON DELETE CASCADE
                self.user_role_departments
                    .retain(|_, urd| urd.user_role_id != id);
            }
            Mutation::InsertUserRoleDepartment(row) => {
                if !self.user_roles.contains_key(&row.user_role_id) {
                    return Err(foreign_key("user_role_departments_user_role_id_fkey"));
                }
                if !self.departments.contains_key(&row.department_id) {
                    return Err(foreign_key("user_role_departments_department_id_fkey"));
                }
                if self.user_role_departments.values().any(|r| {
                    r.user_role_id == row.user_role_id && r.department_id == row.department_id
                }) {
                    return Err(unique("user_role_departments_user_role_id_department_id_key"));
                }
                self.user_role_departments.insert(row.id, row);
            }
            Mutation::DeleteUserRoleDepartment(id) => {
                self.user_role_departments
                    .remove(&id)
                    .ok_or_else(|| missing("user_role_departments", id))?;
            }

            // -----------------------------------------------------------------
            // grants
            // -----------------------------------------------------------------
            Mutation::InsertRolePermission(row) => {
                self.check_role_permission(&row)?;
                self.role_permissions.insert(row.id, row);
            }
            Mutation::UpdateRolePermission(row) => {
                if !self.role_permissions.contains_key(&row.id) {
                    return Err(missing("role_permissions", row.id));
                }
                self.check_role_permission(&row)?;
                self.role_permissions.insert(row.id, row);
            }
            Mutation::DeleteRolePermission(id) => {
                self.role_permissions
                    .remove(&id)
                    .ok_or_else(|| missing("role_permissions", id))?;
            }
            Mutation::InsertUserPermission(row) => {
                self.check_user_permission(&row)?;
                self.user_permissions.insert(row.id, row);
            }
            Mutation::UpdateUserPermission(row) => {
                if !self.user_permissions.contains_key(&row.id) {
                    return Err(missing("user_permissions", row.id));
                }
                self.check_user_permission(&row)?;
                self.user_permissions.insert(row.id, row);
            }
            Mutation::DeleteUserPermission(id) => {
                self.user_permissions
                    .remove(&id)
                    .ok_or_else(|| missing("user_permissions", id))?;
            }

            // -----------------------------------------------------------------
            // refresh tokens
            // -----------------------------------------------------------------
            Mutation::InsertRefreshToken(token) => {
                if !self.users.contains_key(&token.user_id) {
                    return Err(foreign_key("refresh_tokens_user_id_fkey"));
                }
                if self
                    .refresh_tokens
                    .values()
                    .any(|t| t.token_hash == token.token_hash)
                {
                    return Err(unique("refresh_tokens_token_hash_key"));
                }
                self.refresh_tokens.insert(token.id, token);
            }
            Mutation::RevokeRefreshToken {
                id,
                revoked_at,
                reason,
            } => {
                let token = self
                    .refresh_tokens
                    .get_mut(&id)
                    .ok_or_else(|| missing("refresh_tokens", id))?;
                token.revoked_at = Some(revoked_at);
                token.revoked_by = Some(reason);
            }
        }
        Ok(())
    }

    fn check_role_permission(&self, row: &RolePermission) -> StoreResult<()> {
        if !self.roles.contains_key(&row.role_id) {
            return Err(foreign_key("role_permissions_role_id_fkey"));
        }
        if !self.permissions.contains_key(&row.permission_id) {
            return Err(foreign_key("role_permissions_permission_id_fkey"));
        }
        if !self.departments.contains_key(&row.department_id) {
            return Err(foreign_key("role_permissions_department_id_fkey"));
        }
        if self.role_permissions.values().any(|r| {
            r.id != row.id
                && r.role_id == row.role_id
                && r.permission_id == row.permission_id
                && r.department_id == row.department_id
        }) {
            return Err(unique("role_permissions_role_id_permission_id_department_id_key"));
        }
        Ok(())
    }

    fn check_user_permission(&self, row: &UserPermission) -> StoreResult<()> {
        if !self.users.contains_key(&row.user_id) {
            return Err(foreign_key("user_permissions_user_id_fkey"));
        }
        if !self.permissions.contains_key(&row.permission_id) {
            return Err(foreign_key("user_permissions_permission_id_fkey"));
        }
        if !self.departments.contains_key(&row.department_id) {
            return Err(foreign_key("user_permissions_department_id_fkey"));
        }
        if self.user_permissions.values().any(|r| {
            r.id != row.id
                && r.user_id == row.user_id
                && r.permission_id == row.permission_id
                && r.department_id == row.department_id
        }) {
            return Err(unique("user_permissions_user_id_permission_id_department_id_key"));
        }
        Ok(())
    }

    fn department_referenced(&self, id: Uuid) -> bool {
        self.user_role_departments
            .values()
            .any(|r| r.department_id == id)
            || self.role_permissions.values().any(|r| r.department_id == id)
            || self.user_permissions.values().any(|r| r.department_id == id)
    }

    fn role_referenced(&self, id: Uuid) -> bool {
        self.user_roles.values().any(|r| r.role_id == id)
            || self.role_permissions.values().any(|r| r.role_id == id)
    }

    fn permission_referenced(&self, id: Uuid) -> bool {
        self.role_permissions.values().any(|r| r.permission_id == id)
            || self.user_permissions.values().any(|r| r.permission_id == id)
    }

    fn permissions_by_ids(&self, ids: impl IntoIterator<Item = Uuid>) -> Vec<Permission> {
        let ids: BTreeSet<Uuid> = ids.into_iter().collect();
        let mut perms: Vec<Permission> = ids
            .into_iter()
            .filter_map(|id| self.permissions.get(&id).cloned())
            .collect();
        perms.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        perms
    }

    /// Role ids the user holds, scoped to `department_id`.
    fn role_ids_in_department(&self, user_id: Uuid, department_id: Uuid) -> BTreeSet<Uuid> {
        self.user_roles
            .values()
            .filter(|ur| ur.user_id == user_id)
            .filter(|ur| {
                self.user_role_departments
                    .values()
                    .any(|urd| urd.user_role_id == ur.id && urd.department_id == department_id)
            })
            .map(|ur| ur.role_id)
            .collect()
    }
}

#[async_trait]
impl Transactional for InMemoryStore {
    async fn commit(&self, work: UnitOfWork) -> StoreResult<()> {
        let mut mutations = work.into_mutations();
        let mut guard = self.tables.write().await;
        if mutations.len() <= 1 {
            return match mutations.pop() {
                Some(mutation) => guard.apply(mutation),
                None => Ok(()),
            };
        }
        let mut staged = guard.clone();
        for mutation in mutations {
            staged.apply(mutation)?;
        }
        *guard = staged;
        Ok(())
    }
}

#[async_trait]
impl UserStore for InMemoryStore {
    async fn find_user(&self, id: Uuid) -> StoreResult<Option<User>> {
        Ok(self.tables.read().await.users.get(&id).cloned())
    }

    async fn find_user_by_email(&self, email: &Email) -> StoreResult<Option<User>> {
        let tables = self.tables.read().await;
        Ok(tables.users.values().find(|u| &u.email == email).cloned())
    }

    async fn email_exists(&self, email: &Email) -> StoreResult<bool> {
        let tables = self.tables.read().await;
        Ok(tables.users.values().any(|u| &u.email == email))
    }

    async fn users_with_active_department(&self, department_id: Uuid) -> StoreResult<Vec<User>> {
        let tables = self.tables.read().await;
        let mut users: Vec<_> = tables
            .users
            .values()
            .filter(|u| u.active_department_id == Some(department_id))
            .cloned()
            .collect();
        users.sort_by_key(|u| u.id);
        Ok(users)
    }
}

#[async_trait]
impl RbacStore for InMemoryStore {
    async fn find_department(&self, id: Uuid) -> StoreResult<Option<Department>> {
        Ok(self.tables.read().await.departments.get(&id).cloned())
    }

    async fn list_departments(&self) -> StoreResult<Vec<Department>> {
        let mut all: Vec<_> = self
            .tables
            .read()
            .await
            .departments
            .values()
            .cloned()
            .collect();
        all.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        Ok(all)
    }

    async fn find_role(&self, id: Uuid) -> StoreResult<Option<Role>> {
        Ok(self.tables.read().await.roles.get(&id).cloned())
    }

    async fn list_roles(&self) -> StoreResult<Vec<Role>> {
        let mut all: Vec<_> = self.tables.read().await.roles.values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        Ok(all)
    }

    async fn find_permission(&self, id: Uuid) -> StoreResult<Option<Permission>> {
        Ok(self.tables.read().await.permissions.get(&id).cloned())
    }

    async fn list_permissions(&self) -> StoreResult<Vec<Permission>> {
        let tables = self.tables.read().await;
        Ok(tables.permissions_by_ids(tables.permissions.keys().copied()))
    }

    async fn permission_name_exists(
        &self,
        name: &str,
        excluding: Option<Uuid>,
    ) -> StoreResult<bool> {
        let tables = self.tables.read().await;
        Ok(tables
            .permissions
            .values()
            .any(|p| Some(p.id) != excluding && p.name.as_str() == name))
    }

    async fn find_user_role(&self, id: Uuid) -> StoreResult<Option<UserRole>> {
        Ok(self.tables.read().await.user_roles.get(&id).cloned())
    }

    async fn find_user_role_by_pair(
        &self,
        user_id: Uuid,
        role_id: Uuid,
    ) -> StoreResult<Option<UserRole>> {
        let tables = self.tables.read().await;
        Ok(tables
            .user_roles
            .values()
            .find(|r| r.user_id == user_id && r.role_id == role_id)
            .cloned())
    }

    async fn user_roles_for_user(&self, user_id: Uuid) -> StoreResult<Vec<UserRole>> {
        let tables = self.tables.read().await;
        let mut rows: Vec<_> = tables
            .user_roles
            .values()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.id);
        Ok(rows)
    }

    async fn find_user_role_department(
        &self,
        id: Uuid,
    ) -> StoreResult<Option<UserRoleInDepartment>> {
        Ok(self
            .tables
            .read()
            .await
            .user_role_departments
            .get(&id)
            .cloned())
    }

    async fn user_role_department_exists(
        &self,
        user_role_id: Uuid,
        department_id: Uuid,
    ) -> StoreResult<bool> {
        let tables = self.tables.read().await;
        Ok(tables
            .user_role_departments
            .values()
            .any(|r| r.user_role_id == user_role_id && r.department_id == department_id))
    }

    async fn user_role_departments(
        &self,
        user_role_id: Uuid,
    ) -> StoreResult<Vec<UserRoleInDepartment>> {
        let tables = self.tables.read().await;
        let mut rows: Vec<_> = tables
            .user_role_departments
            .values()
            .filter(|r| r.user_role_id == user_role_id)
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.id);
        Ok(rows)
    }

    async fn roles_in_department(
        &self,
        user_id: Uuid,
        department_id: Uuid,
    ) -> StoreResult<Vec<Role>> {
        let tables = self.tables.read().await;
        let mut roles: Vec<Role> = tables
            .role_ids_in_department(user_id, department_id)
            .into_iter()
            .filter_map(|id| tables.roles.get(&id).cloned())
            .collect();
        roles.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        Ok(roles)
    }

    async fn departments_for_user(&self, user_id: Uuid) -> StoreResult<Vec<Department>> {
        let tables = self.tables.read().await;
        let dept_ids: BTreeSet<Uuid> = tables
            .user_roles
            .values()
            .filter(|ur| ur.user_id == user_id)
            .flat_map(|ur| {
                tables
                    .user_role_departments
                    .values()
                    .filter(move |urd| urd.user_role_id == ur.id)
                    .map(|urd| urd.department_id)
            })
            .collect();
        let mut depts: Vec<Department> = dept_ids
            .into_iter()
            .filter_map(|id| tables.departments.get(&id).cloned())
            .collect();
        depts.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        Ok(depts)
    }

    async fn find_role_permission(&self, id: Uuid) -> StoreResult<Option<RolePermission>> {
        Ok(self.tables.read().await.role_permissions.get(&id).cloned())
    }

    async fn role_permission_exists(
        &self,
        role_id: Uuid,
        permission_id: Uuid,
        department_id: Uuid,
        excluding: Option<Uuid>,
    ) -> StoreResult<bool> {
        let tables = self.tables.read().await;
        Ok(tables.role_permissions.values().any(|r| {
            Some(r.id) != excluding
                && r.role_id == role_id
                && r.permission_id == permission_id
                && r.department_id == department_id
        }))
    }

    async fn permissions_for_role(
        &self,
        role_id: Uuid,
        department_id: Uuid,
    ) -> StoreResult<Vec<Permission>> {
        let tables = self.tables.read().await;
        Ok(tables.permissions_by_ids(
            tables
                .role_permissions
                .values()
                .filter(|r| r.role_id == role_id && r.department_id == department_id)
                .map(|r| r.permission_id),
        ))
    }

    async fn find_user_permission(&self, id: Uuid) -> StoreResult<Option<UserPermission>> {
        Ok(self.tables.read().await.user_permissions.get(&id).cloned())
    }

    async fn user_permission_exists(
        &self,
        user_id: Uuid,
        permission_id: Uuid,
        department_id: Uuid,
        excluding: Option<Uuid>,
    ) -> StoreResult<bool> {
        let tables = self.tables.read().await;
        Ok(tables.user_permissions.values().any(|r| {
            Some(r.id) != excluding
                && r.user_id == user_id
                && r.permission_id == permission_id
                && r.department_id == department_id
        }))
    }

    async fn permissions_for_user(
        &self,
        user_id: Uuid,
        department_id: Uuid,
    ) -> StoreResult<Vec<Permission>> {
        let tables = self.tables.read().await;
        Ok(tables.permissions_by_ids(
            tables
                .user_permissions
                .values()
                .filter(|r| r.user_id == user_id && r.department_id == department_id)
                .map(|r| r.permission_id),
        ))
    }

    async fn department_grants(&self, department_id: Uuid) -> StoreResult<DepartmentGrants> {
        let tables = self.tables.read().await;
        let mut role_permissions: Vec<_> = tables
            .role_permissions
            .values()
            .filter(|r| r.department_id == department_id)
            .cloned()
            .collect();
        role_permissions.sort_by_key(|r| r.id);
        let mut user_permissions: Vec<_> = tables
            .user_permissions
            .values()
            .filter(|r| r.department_id == department_id)
            .cloned()
            .collect();
        user_permissions.sort_by_key(|r| r.id);
        Ok(DepartmentGrants {
            department_id,
            role_permissions,
            user_permissions,
        })
    }

    async fn grants_for_permission(&self, permission_id: Uuid) -> StoreResult<PermissionGrants> {
        let tables = self.tables.read().await;
        let mut role_permissions: Vec<_> = tables
            .role_permissions
            .values()
            .filter(|r| r.permission_id == permission_id)
            .cloned()
            .collect();
        role_permissions.sort_by_key(|r| r.id);
        let mut user_permissions: Vec<_> = tables
            .user_permissions
            .values()
            .filter(|r| r.permission_id == permission_id)
            .cloned()
            .collect();
        user_permissions.sort_by_key(|r| r.id);
        Ok(PermissionGrants {
            role_permissions,
            user_permissions,
        })
    }

    async fn permission_in_use(&self, permission_id: Uuid) -> StoreResult<bool> {
        Ok(self.tables.read().await.permission_referenced(permission_id))
    }

    async fn role_in_use(&self, role_id: Uuid) -> StoreResult<bool> {
        Ok(self.tables.read().await.role_referenced(role_id))
    }

    async fn department_in_use(&self, department_id: Uuid) -> StoreResult<bool> {
        Ok(self.tables.read().await.department_referenced(department_id))
    }
}

#[async_trait]
impl TokenStore for InMemoryStore {
    async fn find_refresh_token(&self, token_hash: &str) -> StoreResult<Option<RefreshToken>> {
        let tables = self.tables.read().await;
        Ok(tables
            .refresh_tokens
            .values()
            .find(|t| t.token_hash == token_hash)
            .cloned())
    }

    async fn active_refresh_tokens(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<RefreshToken>> {
        let tables = self.tables.read().await;
        let mut rows: Vec<_> = tables
            .refresh_tokens
            .values()
            .filter(|t| t.user_id == user_id && t.is_active(now))
            .cloned()
            .collect();
        rows.sort_by_key(|t| t.created_at);
        Ok(rows)
    }

    async fn refresh_tokens_for_user(&self, user_id: Uuid) -> StoreResult<Vec<RefreshToken>> {
        let tables = self.tables.read().await;
        let mut rows: Vec<_> = tables
            .refresh_tokens
            .values()
            .filter(|t| t.user_id == user_id)
            .cloned()
            .collect();
        rows.sort_by_key(|t| t.created_at);
        Ok(rows)
    }

    async fn delete_reapable_refresh_tokens(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        let mut tables = self.tables.write().await;
        let before = tables.refresh_tokens.len();
        tables.refresh_tokens.retain(|_, t| !t.is_reapable(now));
        Ok((before - tables.refresh_tokens.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::auth::password::HashedPassword;
    use crate::models::ProfileDetails;
    use crate::values::{EntityName, PersonName, Phone};

    fn user(email: &str) -> User {
        User::new(
            PersonName::parse("Test User").unwrap(),
            Email::parse(email).unwrap(),
            HashedPassword::from_stored("$2b$10$x".into(), "c2FsdA==".into()),
            Phone::parse("5550102030").unwrap(),
            ProfileDetails::default(),
        )
    }

    fn name(raw: &str) -> EntityName {
        EntityName::parse(raw).unwrap()
    }

    #[tokio::test]
    async fn duplicate_email_fails_at_commit() {
        let store = InMemoryStore::new();
        store
            .commit(Mutation::InsertUser(user("a@example.com")).into())
            .await
            .unwrap();
        let err = store
            .commit(Mutation::InsertUser(user("a@example.com")).into())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::UniqueViolation(_)));
    }

    #[tokio::test]
    async fn failed_commit_leaves_no_partial_writes() {
        let store = InMemoryStore::new();
        let dept = Department::new(name("Ops"));
        let mut work = UnitOfWork::new();
        work.stage(Mutation::InsertDepartment(dept.clone()))
            // role does not exist, so this fails
            .stage(Mutation::InsertRolePermission(RolePermission::new(
                Uuid::now_v7(),
                Uuid::now_v7(),
                dept.id,
            )));
        let err = store.commit(work).await.unwrap_err();
        assert!(matches!(err, StoreError::ForeignKeyViolation(_)));
        assert!(store.find_department(dept.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rejected_single_mutation_changes_nothing() {
        let store = InMemoryStore::new();
        let alice = user("alice@example.com");
        let dept = Department::new(name("Ops"));
        let mut work = UnitOfWork::new();
        work.stage(Mutation::InsertUser(alice.clone()))
            .stage(Mutation::InsertDepartment(dept.clone()))
            .stage(Mutation::SetActiveDepartment {
                user_id: alice.id,
                department_id: Some(dept.id),
            })
            .stage(Mutation::InsertUserPermission(UserPermission::new(
                alice.id,
                Uuid::now_v7(),
                dept.id,
            )));
        // unknown permission: the whole unit is rejected
        assert!(store.commit(work).await.is_err());
        assert!(store.find_user(alice.id).await.unwrap().is_none());

        let mut work = UnitOfWork::new();
        work.stage(Mutation::InsertUser(alice.clone()))
            .stage(Mutation::InsertDepartment(dept.clone()))
            .stage(Mutation::SetActiveDepartment {
                user_id: alice.id,
                department_id: Some(dept.id),
            });
        store.commit(work).await.unwrap();

        let err = store
            .commit(
                Mutation::SetActiveDepartment {
                    user_id: Uuid::now_v7(),
                    department_id: Some(dept.id),
                }
                .into(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::RowNotFound(_)));
        let err = store
            .commit(Mutation::DeleteDepartment(Uuid::now_v7()).into())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::RowNotFound(_)));

        let stored = store.find_user(alice.id).await.unwrap().unwrap();
        assert_eq!(stored.active_department_id, Some(dept.id));
        assert!(store.find_department(dept.id).await.unwrap().is_some());
        assert!(store.commit(UnitOfWork::new()).await.is_ok());
    }

    #[tokio::test]
    async fn grant_triple_is_unique() {
        let store = InMemoryStore::new();
        let dept = Department::new(name("Ops"));
        let role = Role::new(name("Editor"), None);
        let perm = Permission::new(name("docs.write"), None);
        let mut work = UnitOfWork::new();
        work.stage(Mutation::InsertDepartment(dept.clone()))
            .stage(Mutation::InsertRole(role.clone()))
            .stage(Mutation::InsertPermission(perm.clone()))
            .stage(Mutation::InsertRolePermission(RolePermission::new(
                role.id, perm.id, dept.id,
            )));
        store.commit(work).await.unwrap();

        let err = store
            .commit(
                Mutation::InsertRolePermission(RolePermission::new(role.id, perm.id, dept.id))
                    .into(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::UniqueViolation(_)));
        assert_eq!(
            store.department_grants(dept.id).await.unwrap().role_permissions.len(),
            1
        );
    }

    #[tokio::test]
    async fn roles_are_scoped_by_department() {
        let store = InMemoryStore::new();
        let alice = user("alice@example.com");
        let ops = Department::new(name("Ops"));
        let sales = Department::new(name("Sales"));
        let role = Role::new(name("Editor"), None);
        let membership = UserRole::new(alice.id, role.id);
        let mut work = UnitOfWork::new();
        work.stage(Mutation::InsertUser(alice.clone()))
            .stage(Mutation::InsertDepartment(ops.clone()))
            .stage(Mutation::InsertDepartment(sales.clone()))
            .stage(Mutation::InsertRole(role.clone()))
            .stage(Mutation::InsertUserRole(membership.clone()))
            .stage(Mutation::InsertUserRoleDepartment(UserRoleInDepartment::new(
                membership.id,
                sales.id,
            )));
        store.commit(work).await.unwrap();

        assert!(store.roles_in_department(alice.id, ops.id).await.unwrap().is_empty());
        assert_eq!(
            store.roles_in_department(alice.id, sales.id).await.unwrap(),
            vec![role]
        );
        assert_eq!(store.departments_for_user(alice.id).await.unwrap(), vec![sales]);
    }

    #[tokio::test]
    async fn reaper_query_only_removes_revoked_and_expired() {
        let store = InMemoryStore::new();
        let alice = user("alice@example.com");
        let now = Utc::now();
        let expired_unrevoked =
            RefreshToken::issue(alice.id, "a".repeat(64), now - Duration::days(1));
        let live = RefreshToken::issue(alice.id, "b".repeat(64), now + Duration::days(1));
        let doomed = RefreshToken::issue(alice.id, "c".repeat(64), now - Duration::days(1));
        let mut work = UnitOfWork::new();
        work.stage(Mutation::InsertUser(alice.clone()))
            .stage(Mutation::InsertRefreshToken(expired_unrevoked.clone()))
            .stage(Mutation::InsertRefreshToken(live.clone()))
            .stage(Mutation::InsertRefreshToken(doomed.clone()))
            .stage(Mutation::RevokeRefreshToken {
                id: doomed.id,
                revoked_at: now - Duration::hours(2),
                reason: "logout".into(),
            })
            .stage(Mutation::RevokeRefreshToken {
                id: live.id,
                revoked_at: now,
                reason: "logout".into(),
            });
        store.commit(work).await.unwrap();

        assert_eq!(store.delete_reapable_refresh_tokens(now).await.unwrap(), 1);
        let left = store.refresh_tokens_for_user(alice.id).await.unwrap();
        assert_eq!(left.len(), 2);
        assert!(left.iter().all(|t| t.id != doomed.id));
    }

    #[tokio::test]
    async fn deleting_referenced_role_is_rejected() {
        let store = InMemoryStore::new();
        let alice = user("alice@example.com");
        let role = Role::new(name("Editor"), None);
        let mut work = UnitOfWork::new();
        work.stage(Mutation::InsertUser(alice.clone()))
            .stage(Mutation::InsertRole(role.clone()))
            .stage(Mutation::InsertUserRole(UserRole::new(alice.id, role.id)));
        store.commit(work).await.unwrap();

        assert!(store.role_in_use(role.id).await.unwrap());
        let err = store
            .commit(Mutation::DeleteRole(role.id).into())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ForeignKeyViolation(_)));
    }
}
