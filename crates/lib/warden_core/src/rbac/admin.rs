//! Administrative mutations of the RBAC graph.
//!
//! Every write follows the same order: validate input, check that each
//! referenced row exists, reject duplicates, commit one unit of work, then
//! invalidate the affected cache buckets. The existence and duplicate checks
//! are fast paths; the store constraints remain the real guard, and a
//! constraint violation at commit is reported the same way.

use std::sync::Arc;

use tracing::info;
use uuid::Uuid;

use super::invalidation::{CacheInvalidator, InvalidationTarget};
use crate::error::{CoreError, CoreResult};
use crate::models::{
    Department, Permission, Role, RolePermission, User, UserPermission, UserRole,
    UserRoleInDepartment,
};
use crate::store::{Mutation, RbacStore, Store, StoreError, Transactional, UserStore};
use crate::values::{
    EntityName, InvalidValue, MAX_DESCRIPTION_LENGTH, bounded_text, collect_errors,
};

/// Partial update of a role grant; `None` keeps the current value.
#[derive(Debug, Clone, Copy, Default)]
pub struct RolePermissionPatch {
    pub role_id: Option<Uuid>,
    pub permission_id: Option<Uuid>,
    pub department_id: Option<Uuid>,
}

/// Partial update of a direct user grant; `None` keeps the current value.
#[derive(Debug, Clone, Copy, Default)]
pub struct UserPermissionPatch {
    pub user_id: Option<Uuid>,
    pub permission_id: Option<Uuid>,
    pub department_id: Option<Uuid>,
}

pub struct RbacAdmin {
    store: Arc<dyn Store>,
    invalidator: Arc<CacheInvalidator>,
}

fn parse_name(raw: &str) -> CoreResult<EntityName> {
    EntityName::parse(raw).map_err(|e| CoreError::validation([e.to_string()]))
}

fn parse_named(
    raw_name: &str,
    raw_description: Option<&str>,
) -> CoreResult<(EntityName, Option<String>)> {
    match (
        EntityName::parse(raw_name),
        bounded_text("description", raw_description, MAX_DESCRIPTION_LENGTH),
    ) {
        (Ok(name), Ok(description)) => Ok((name, description)),
        (name, description) => Err(CoreError::Validation(collect_errors([
            name.err(),
            description.err(),
        ]))),
    }
}

fn parse_description(raw: Option<&str>) -> CoreResult<Option<String>> {
    bounded_text("description", raw, MAX_DESCRIPTION_LENGTH)
        .map_err(|e: InvalidValue| CoreError::validation([e.to_string()]))
}

/// Report a store-level unique violation as a duplicate grant.
fn as_already_assigned(what: &'static str) -> impl FnOnce(StoreError) -> CoreError {
    move |e| match e {
        StoreError::UniqueViolation(_) => CoreError::AlreadyAssigned(what.into()),
        other => CoreError::Store(other),
    }
}

impl RbacAdmin {
    pub fn new(store: Arc<dyn Store>, invalidator: Arc<CacheInvalidator>) -> Self {
        Self { store, invalidator }
    }

    // -------------------------------------------------------------------------
    // Existence helpers
    // -------------------------------------------------------------------------

    async fn require_user(&self, id: Uuid) -> CoreResult<User> {
        self.store
            .find_user(id)
            .await?
            .ok_or_else(|| CoreError::not_found("User"))
    }

    async fn require_role(&self, id: Uuid) -> CoreResult<Role> {
        self.store
            .find_role(id)
            .await?
            .ok_or_else(|| CoreError::not_found("Role"))
    }

    async fn require_permission(&self, id: Uuid) -> CoreResult<Permission> {
        self.store
            .find_permission(id)
            .await?
            .ok_or_else(|| CoreError::not_found("Permission"))
    }

    async fn require_department(&self, id: Uuid) -> CoreResult<Department> {
        self.store
            .find_department(id)
            .await?
            .ok_or_else(|| CoreError::not_found("Department"))
    }

    // =========================================================================
    // Departments
    // =========================================================================

    pub async fn create_department(&self, name: &str) -> CoreResult<Department> {
        let dept = Department::new(parse_name(name)?);
        self.store
            .commit(Mutation::InsertDepartment(dept.clone()).into())
            .await?;
        info!(department_id = %dept.id, name = %dept.name, "department created");
        Ok(dept)
    }

    pub async fn rename_department(&self, id: Uuid, name: &str) -> CoreResult<Department> {
        let name = parse_name(name)?;
        let mut dept = self.require_department(id).await?;
        dept.name = name;
        self.store
            .commit(Mutation::UpdateDepartment(dept.clone()).into())
            .await?;
        Ok(dept)
    }

    /// Delete an unreferenced department. Users whose active department it
    /// was lose the pointer in the store, so their cached sessions go too.
    pub async fn delete_department(&self, id: Uuid) -> CoreResult<()> {
        self.require_department(id).await?;
        if self.store.department_in_use(id).await? {
            return Err(CoreError::Conflict("Department is still referenced".into()));
        }
        let pointing = self.store.users_with_active_department(id).await?;
        self.store.commit(Mutation::DeleteDepartment(id).into()).await?;

        let mut targets = vec![InvalidationTarget::Department { department_id: id }];
        targets.extend(pointing.iter().map(|user| InvalidationTarget::UserSession {
            user_id: user.id,
            email: user.email.as_str().to_string(),
        }));
        self.invalidator.invalidate(&targets).await;
        info!(department_id = %id, "department deleted");
        Ok(())
    }

    pub async fn get_department(&self, id: Uuid) -> CoreResult<Department> {
        self.require_department(id).await
    }

    pub async fn list_departments(&self) -> CoreResult<Vec<Department>> {
        Ok(self.store.list_departments().await?)
    }

    // =========================================================================
    // Roles
    // =========================================================================

    pub async fn create_role(&self, name: &str, description: Option<&str>) -> CoreResult<Role> {
        let (name, description) = parse_named(name, description)?;
        let role = Role::new(name, description);
        self.store
            .commit(Mutation::InsertRole(role.clone()).into())
            .await?;
        info!(role_id = %role.id, name = %role.name, "role created");
        Ok(role)
    }

    pub async fn update_role(
        &self,
        id: Uuid,
        name: Option<&str>,
        description: Option<&str>,
    ) -> CoreResult<Role> {
        let name = name.map(parse_name).transpose()?;
        let description = description.map(|d| parse_description(Some(d))).transpose()?;
        let mut role = self.require_role(id).await?;
        if let Some(name) = name {
            role.name = name;
        }
        if let Some(description) = description {
            role.description = description;
        }
        self.store
            .commit(Mutation::UpdateRole(role.clone()).into())
            .await?;
        Ok(role)
    }

    pub async fn delete_role(&self, id: Uuid) -> CoreResult<()> {
        self.require_role(id).await?;
        if self.store.role_in_use(id).await? {
            return Err(CoreError::Conflict("Role is still referenced".into()));
        }
        self.store.commit(Mutation::DeleteRole(id).into()).await?;
        info!(role_id = %id, "role deleted");
        Ok(())
    }

    pub async fn get_role(&self, id: Uuid) -> CoreResult<Role> {
        self.require_role(id).await
    }

    pub async fn list_roles(&self) -> CoreResult<Vec<Role>> {
        Ok(self.store.list_roles().await?)
    }

    // =========================================================================
    // Permissions
    // =========================================================================

    pub async fn create_permission(
        &self,
        name: &str,
        description: Option<&str>,
    ) -> CoreResult<Permission> {
        let (name, description) = parse_named(name, description)?;
        if self.store.permission_name_exists(name.as_str(), None).await? {
            return Err(CoreError::AlreadyExists("Permission name".into()));
        }
        let perm = Permission::new(name, description);
        self.store
            .commit(Mutation::InsertPermission(perm.clone()).into())
            .await
            .map_err(|e| match e {
                StoreError::UniqueViolation(_) => CoreError::AlreadyExists("Permission name".into()),
                other => CoreError::Store(other),
            })?;
        info!(permission_id = %perm.id, name = %perm.name, "permission created");
        Ok(perm)
    }

    pub async fn update_permission(
        &self,
        id: Uuid,
        name: Option<&str>,
        description: Option<&str>,
    ) -> CoreResult<Permission> {
        let name = name.map(parse_name).transpose()?;
        let description = description.map(|d| parse_description(Some(d))).transpose()?;
        let mut perm = self.require_permission(id).await?;
        if let Some(name) = name {
            if self.store.permission_name_exists(name.as_str(), Some(id)).await? {
                return Err(CoreError::AlreadyExists("Permission name".into()));
            }
            perm.name = name;
        }
        if let Some(description) = description {
            perm.description = description;
        }
        let grants = self.store.grants_for_permission(id).await?;
        self.store
            .commit(Mutation::UpdatePermission(perm.clone()).into())
            .await
            .map_err(|e| match e {
                StoreError::UniqueViolation(_) => CoreError::AlreadyExists("Permission name".into()),
                other => CoreError::Store(other),
            })?;

        // Cached buckets embed the permission's name and description.
        let targets: Vec<_> = grants
            .role_permissions
            .iter()
            .map(|g| InvalidationTarget::RoleGrants {
                role_id: g.role_id,
                department_id: g.department_id,
            })
            .chain(
                grants
                    .user_permissions
                    .iter()
                    .map(|g| InvalidationTarget::UserGrants {
                        user_id: g.user_id,
                        department_id: g.department_id,
                    }),
            )
            .collect();
        self.invalidator.invalidate(&targets).await;
        Ok(perm)
    }

    pub async fn delete_permission(&self, id: Uuid) -> CoreResult<()> {
        self.require_permission(id).await?;
        if self.store.permission_in_use(id).await? {
            return Err(CoreError::Conflict("Permission is still referenced".into()));
        }
        self.store.commit(Mutation::DeletePermission(id).into()).await?;
        info!(permission_id = %id, "permission deleted");
        Ok(())
    }

    pub async fn get_permission(&self, id: Uuid) -> CoreResult<Permission> {
        self.require_permission(id).await
    }

    pub async fn list_permissions(&self) -> CoreResult<Vec<Permission>> {
        Ok(self.store.list_permissions().await?)
    }

    // =========================================================================
    // Role membership
    // =========================================================================

    pub async fn assign_role(&self, user_id: Uuid, role_id: Uuid) -> CoreResult<UserRole> {
        let user = self.require_user(user_id).await?;
        self.require_role(role_id).await?;
        if self
            .store
            .find_user_role_by_pair(user_id, role_id)
            .await?
            .is_some()
        {
            return Err(CoreError::AlreadyAssigned("Role already assigned to user".into()));
        }
        let row = UserRole::new(user_id, role_id);
        self.store
            .commit(Mutation::InsertUserRole(row.clone()).into())
            .await
            .map_err(as_already_assigned("Role already assigned to user"))?;
        self.invalidate_identity(&user).await;
        info!(%user_id, %role_id, "role assigned");
        Ok(row)
    }

    /// Remove a membership together with its department scoping.
    pub async fn revoke_role(&self, user_id: Uuid, role_id: Uuid) -> CoreResult<()> {
        let user = self.require_user(user_id).await?;
        let row = self
            .store
            .find_user_role_by_pair(user_id, role_id)
            .await?
            .ok_or_else(|| CoreError::not_found("User role"))?;
        self.store.commit(Mutation::DeleteUserRole(row.id).into()).await?;
        self.invalidate_identity(&user).await;
        info!(%user_id, %role_id, "role revoked");
        Ok(())
    }

    pub async fn list_user_roles(&self, user_id: Uuid) -> CoreResult<Vec<UserRole>> {
        self.require_user(user_id).await?;
        Ok(self.store.user_roles_for_user(user_id).await?)
    }

    /// Make a membership effective in a department.
    pub async fn scope_user_role(
        &self,
        user_role_id: Uuid,
        department_id: Uuid,
    ) -> CoreResult<UserRoleInDepartment> {
        let membership = self
            .store
            .find_user_role(user_role_id)
            .await?
            .ok_or_else(|| CoreError::not_found("User role"))?;
        self.require_department(department_id).await?;
        if self
            .store
            .user_role_department_exists(user_role_id, department_id)
            .await?
        {
            return Err(CoreError::AlreadyAssigned(
                "User role already scoped to department".into(),
            ));
        }
        let row = UserRoleInDepartment::new(user_role_id, department_id);
        self.store
            .commit(Mutation::InsertUserRoleDepartment(row.clone()).into())
            .await
            .map_err(as_already_assigned("User role already scoped to department"))?;
        if let Some(user) = self.store.find_user(membership.user_id).await? {
            self.invalidate_identity(&user).await;
        }
        Ok(row)
    }

    pub async fn unscope_user_role(&self, user_role_department_id: Uuid) -> CoreResult<()> {
        let row = self
            .store
            .find_user_role_department(user_role_department_id)
            .await?
            .ok_or_else(|| CoreError::not_found("User role department"))?;
        self.store
            .commit(Mutation::DeleteUserRoleDepartment(row.id).into())
            .await?;
        if let Some(membership) = self.store.find_user_role(row.user_role_id).await?
            && let Some(user) = self.store.find_user(membership.user_id).await?
        {
            self.invalidate_identity(&user).await;
        }
        Ok(())
    }

    /// Distinct roles the user holds in the department.
    pub async fn user_roles_in_department(
        &self,
        user_id: Uuid,
        department_id: Uuid,
    ) -> CoreResult<Vec<Role>> {
        self.require_user(user_id).await?;
        self.require_department(department_id).await?;
        Ok(self.store.roles_in_department(user_id, department_id).await?)
    }

    // =========================================================================
    // Role grants
    // =========================================================================

    pub async fn assign_role_permission(
        &self,
        role_id: Uuid,
        permission_id: Uuid,
        department_id: Uuid,
    ) -> CoreResult<RolePermission> {
        self.require_role(role_id).await?;
        self.require_permission(permission_id).await?;
        self.require_department(department_id).await?;
        if self
            .store
            .role_permission_exists(role_id, permission_id, department_id, None)
            .await?
        {
            return Err(CoreError::AlreadyAssigned(
                "Permission already assigned to role".into(),
            ));
        }
        let row = RolePermission::new(role_id, permission_id, department_id);
        self.store
            .commit(Mutation::InsertRolePermission(row.clone()).into())
            .await
            .map_err(as_already_assigned("Permission already assigned to role"))?;
        self.invalidator
            .invalidate(&[InvalidationTarget::RoleGrants {
                role_id,
                department_id,
            }])
            .await;
        info!(%role_id, %permission_id, %department_id, "permission granted to role");
        Ok(row)
    }

    pub async fn update_role_permission(
        &self,
        id: Uuid,
        patch: RolePermissionPatch,
    ) -> CoreResult<RolePermission> {
        let old = self
            .store
            .find_role_permission(id)
            .await?
            .ok_or_else(|| CoreError::not_found("Role permission"))?;
        let new = RolePermission {
            id,
            role_id: patch.role_id.unwrap_or(old.role_id),
            permission_id: patch.permission_id.unwrap_or(old.permission_id),
            department_id: patch.department_id.unwrap_or(old.department_id),
        };
        if let Some(role_id) = patch.role_id {
            self.require_role(role_id).await?;
        }
        if let Some(permission_id) = patch.permission_id {
            self.require_permission(permission_id).await?;
        }
        if let Some(department_id) = patch.department_id {
            self.require_department(department_id).await?;
        }
        if self
            .store
            .role_permission_exists(new.role_id, new.permission_id, new.department_id, Some(id))
            .await?
        {
            return Err(CoreError::AlreadyAssigned(
                "Permission already assigned to role".into(),
            ));
        }
        self.store
            .commit(Mutation::UpdateRolePermission(new.clone()).into())
            .await
            .map_err(as_already_assigned("Permission already assigned to role"))?;
        self.invalidator
            .invalidate(&[
                InvalidationTarget::RoleGrants {
                    role_id: old.role_id,
                    department_id: old.department_id,
                },
                InvalidationTarget::RoleGrants {
                    role_id: new.role_id,
                    department_id: new.department_id,
                },
            ])
            .await;
        Ok(new)
    }

    pub async fn revoke_role_permission(&self, id: Uuid) -> CoreResult<()> {
        let row = self
            .store
            .find_role_permission(id)
            .await?
            .ok_or_else(|| CoreError::not_found("Role permission"))?;
        self.store
            .commit(Mutation::DeleteRolePermission(id).into())
            .await?;
        self.invalidator
            .invalidate(&[InvalidationTarget::RoleGrants {
                role_id: row.role_id,
                department_id: row.department_id,
            }])
            .await;
        info!(role_id = %row.role_id, permission_id = %row.permission_id, "role grant revoked");
        Ok(())
    }

    // =========================================================================
    // Direct user grants
    // =========================================================================

    pub async fn assign_user_permission(
        &self,
        user_id: Uuid,
        permission_id: Uuid,
        department_id: Uuid,
    ) -> CoreResult<UserPermission> {
        self.require_user(user_id).await?;
        self.require_permission(permission_id).await?;
        self.require_department(department_id).await?;
        if self
            .store
            .user_permission_exists(user_id, permission_id, department_id, None)
            .await?
        {
            return Err(CoreError::AlreadyAssigned(
                "Permission already assigned to user".into(),
            ));
        }
        let row = UserPermission::new(user_id, permission_id, department_id);
        self.store
            .commit(Mutation::InsertUserPermission(row.clone()).into())
            .await
            .map_err(as_already_assigned("Permission already assigned to user"))?;
        self.invalidator
            .invalidate(&[InvalidationTarget::UserGrants {
                user_id,
                department_id,
            }])
            .await;
        info!(%user_id, %permission_id, %department_id, "permission granted to user");
        Ok(row)
    }

    pub async fn update_user_permission(
        &self,
        id: Uuid,
        patch: UserPermissionPatch,
    ) -> CoreResult<UserPermission> {
        let old = self
            .store
            .find_user_permission(id)
            .await?
            .ok_or_else(|| CoreError::not_found("User permission"))?;
        let new = UserPermission {
            id,
            user_id: patch.user_id.unwrap_or(old.user_id),
            permission_id: patch.permission_id.unwrap_or(old.permission_id),
            department_id: patch.department_id.unwrap_or(old.department_id),
        };
        if let Some(user_id) = patch.user_id {
            self.require_user(user_id).await?;
        }
        if let Some(permission_id) = patch.permission_id {
            self.require_permission(permission_id).await?;
        }
        if let Some(department_id) = patch.department_id {
            self.require_department(department_id).await?;
        }
        if self
            .store
            .user_permission_exists(new.user_id, new.permission_id, new.department_id, Some(id))
            .await?
        {
            return Err(CoreError::AlreadyAssigned(
                "Permission already assigned to user".into(),
            ));
        }
        self.store
            .commit(Mutation::UpdateUserPermission(new.clone()).into())
            .await
            .map_err(as_already_assigned("Permission already assigned to user"))?;
        self.invalidator
            .invalidate(&[
                InvalidationTarget::UserGrants {
                    user_id: old.user_id,
                    department_id: old.department_id,
                },
                InvalidationTarget::UserGrants {
                    user_id: new.user_id,
                    department_id: new.department_id,
                },
            ])
            .await;
        Ok(new)
    }

    pub async fn revoke_user_permission(&self, id: Uuid) -> CoreResult<()> {
        let row = self
            .store
            .find_user_permission(id)
            .await?
            .ok_or_else(|| CoreError::not_found("User permission"))?;
        self.store
            .commit(Mutation::DeleteUserPermission(id).into())
            .await?;
        self.invalidator
            .invalidate(&[InvalidationTarget::UserGrants {
                user_id: row.user_id,
                department_id: row.department_id,
            }])
            .await;
        info!(user_id = %row.user_id, permission_id = %row.permission_id, "user grant revoked");
        Ok(())
    }

    // Role claims in the cached access bundle go stale when membership changes.
    async fn invalidate_identity(&self, user: &User) {
        self.invalidator
            .invalidate(&[InvalidationTarget::UserIdentity {
                user_id: user.id,
                email: user.email.as_str().to_string(),
            }])
            .await;
    }
}
