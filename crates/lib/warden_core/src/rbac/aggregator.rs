//! Department-scoped permission aggregation.
//!
//! Two facets are kept apart: permissions a user gets through roles held in
//! the department, and permissions granted to the user directly in it.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};
use uuid::Uuid;

use super::active_department::ActiveDepartmentResolver;
use crate::cache::{Cache, CacheExt, keys};
use crate::error::{CoreError, CoreResult};
use crate::models::{DepartmentGrants, Permission, Role};
use crate::store::{RbacStore, StoreResult};

pub struct PermissionAggregator {
    store: Arc<dyn RbacStore>,
    cache: Arc<dyn Cache>,
    active: Arc<ActiveDepartmentResolver>,
    ttl: Duration,
}

impl PermissionAggregator {
    pub fn new(
        store: Arc<dyn RbacStore>,
        cache: Arc<dyn Cache>,
        active: Arc<ActiveDepartmentResolver>,
        ttl: Duration,
    ) -> Self {
        Self {
            store,
            cache,
            active,
            ttl,
        }
    }

    /// Distinct roles the user holds in the department.
    pub async fn effective_roles(&self, user_id: Uuid, department_id: Uuid) -> CoreResult<Vec<Role>> {
        Ok(self.store.roles_in_department(user_id, department_id).await?)
    }

    /// Union of the grants of every effective role, de-duplicated by id and
    /// ordered by name.
    pub async fn role_permissions(
        &self,
        user_id: Uuid,
        department_id: Uuid,
    ) -> CoreResult<Vec<Permission>> {
        let roles = self.effective_roles(user_id, department_id).await?;
        let mut merged: BTreeMap<Uuid, Permission> = BTreeMap::new();
        for role in roles {
            let store = Arc::clone(&self.store);
            let perms = self
                .read_through(keys::role_permissions(role.id, department_id), || async move {
                    store.permissions_for_role(role.id, department_id).await
                })
                .await?;
            for perm in perms {
                merged.entry(perm.id).or_insert(perm);
            }
        }
        let mut perms: Vec<Permission> = merged.into_values().collect();
        perms.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        Ok(perms)
    }

    /// Permissions granted to the user directly in the department.
    pub async fn direct_permissions(
        &self,
        user_id: Uuid,
        department_id: Uuid,
    ) -> CoreResult<Vec<Permission>> {
        let store = Arc::clone(&self.store);
        self.read_through(keys::user_permissions(user_id, department_id), || async move {
            store.permissions_for_user(user_id, department_id).await
        })
        .await
    }

    /// Every grant row scoped to the department.
    pub async fn department_grants(&self, department_id: Uuid) -> CoreResult<DepartmentGrants> {
        if self.store.find_department(department_id).await?.is_none() {
            return Err(CoreError::not_found("Department"));
        }
        let store = Arc::clone(&self.store);
        self.read_through(keys::department_permissions(department_id), || async move {
            store.department_grants(department_id).await
        })
        .await
    }

    /// Direct permissions of the caller; defaults to the active department.
    pub async fn my_permissions(
        &self,
        user_id: Uuid,
        department_id: Option<Uuid>,
    ) -> CoreResult<Vec<Permission>> {
        let department_id = self.resolve_department(user_id, department_id).await?;
        self.direct_permissions(user_id, department_id).await
    }

    /// Role-derived permissions of the caller; defaults to the active department.
    pub async fn my_role_permissions(
        &self,
        user_id: Uuid,
        department_id: Option<Uuid>,
    ) -> CoreResult<Vec<Permission>> {
        let department_id = self.resolve_department(user_id, department_id).await?;
        self.role_permissions(user_id, department_id).await
    }

    async fn resolve_department(
        &self,
        user_id: Uuid,
        department_id: Option<Uuid>,
    ) -> CoreResult<Uuid> {
        match department_id {
            Some(id) => Ok(id),
            None => self
                .active
                .get(user_id)
                .await?
                .ok_or_else(|| CoreError::not_found("Active department")),
        }
    }

    async fn read_through<T, F, Fut>(&self, key: String, load: F) -> CoreResult<T>
    where
        T: Serialize + DeserializeOwned + Send + Sync,
        F: FnOnce() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        match self.cache.get_json::<T>(&key).await {
            Ok(Some(hit)) => return Ok(hit),
            Ok(None) => debug!(key = %key, "permission cache miss"),
            Err(e) => warn!(key = %key, error = %e, "permission cache read failed"),
        }
        let fresh = load().await?;
        if let Err(e) = self.cache.set_json(&key, &fresh, self.ttl).await {
            warn!(key = %key, error = %e, "permission cache write failed");
        }
        Ok(fresh)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::password::HashedPassword;
    use crate::cache::MemoryCache;
    use crate::models::{
        Department, ProfileDetails, RolePermission, User, UserPermission, UserRole,
        UserRoleInDepartment,
    };
    use crate::store::{InMemoryStore, Mutation, Transactional, UnitOfWork};
    use crate::values::{Email, EntityName, PersonName, Phone};

    struct Graph {
        store: Arc<InMemoryStore>,
        cache: Arc<MemoryCache>,
        aggregator: PermissionAggregator,
        active: Arc<ActiveDepartmentResolver>,
        user: User,
        ops: Department,
        sales: Department,
        editor: Role,
        viewer: Role,
        read: Permission,
        write: Permission,
    }

    fn name(raw: &str) -> EntityName {
        EntityName::parse(raw).unwrap()
    }

    /// alice holds `editor` and `viewer` in ops; both roles grant `docs.read`
    /// there and `editor` also grants `docs.write`.
    async fn graph() -> Graph {
        let store = Arc::new(InMemoryStore::new());
        let cache = Arc::new(MemoryCache::new());
        let user = User::new(
            PersonName::parse("Alice").unwrap(),
            Email::parse("alice@example.com").unwrap(),
            HashedPassword::from_stored("h".into(), "s".into()),
            Phone::parse("5550102030").unwrap(),
            ProfileDetails::default(),
        );
        let ops = Department::new(name("Ops"));
        let sales = Department::new(name("Sales"));
        let editor = Role::new(name("editor"), None);
        let viewer = Role::new(name("viewer"), None);
        let read = Permission::new(name("docs.read"), None);
        let write = Permission::new(name("docs.write"), None);
        let editor_membership = UserRole::new(user.id, editor.id);
        let viewer_membership = UserRole::new(user.id, viewer.id);

        let mut work = UnitOfWork::new();
        work.stage(Mutation::InsertUser(user.clone()))
            .stage(Mutation::InsertDepartment(ops.clone()))
            .stage(Mutation::InsertDepartment(sales.clone()))
            .stage(Mutation::InsertRole(editor.clone()))
            .stage(Mutation::InsertRole(viewer.clone()))
            .stage(Mutation::InsertPermission(read.clone()))
            .stage(Mutation::InsertPermission(write.clone()))
            .stage(Mutation::InsertUserRole(editor_membership.clone()))
            .stage(Mutation::InsertUserRole(viewer_membership.clone()))
            .stage(Mutation::InsertUserRoleDepartment(UserRoleInDepartment::new(
                editor_membership.id,
                ops.id,
            )))
            .stage(Mutation::InsertUserRoleDepartment(UserRoleInDepartment::new(
                viewer_membership.id,
                ops.id,
            )))
            .stage(Mutation::InsertRolePermission(RolePermission::new(
                editor.id, read.id, ops.id,
            )))
            .stage(Mutation::InsertRolePermission(RolePermission::new(
                editor.id, write.id, ops.id,
            )))
            .stage(Mutation::InsertRolePermission(RolePermission::new(
                viewer.id, read.id, ops.id,
            )))
            // same grant in another department must not leak into ops
            .stage(Mutation::InsertRolePermission(RolePermission::new(
                viewer.id, write.id, sales.id,
            )));
        store.commit(work).await.unwrap();

        let active = Arc::new(ActiveDepartmentResolver::new(
            store.clone(),
            store.clone(),
            cache.clone(),
            Duration::from_secs(60),
        ));
        let aggregator = PermissionAggregator::new(
            store.clone(),
            cache.clone(),
            active.clone(),
            Duration::from_secs(60),
        );
        Graph {
            store,
            cache,
            aggregator,
            active,
            user,
            ops,
            sales,
            editor,
            viewer,
            read,
            write,
        }
    }

    #[tokio::test]
    async fn role_permissions_are_deduplicated_and_sorted() {
        let g = graph().await;
        let perms = g.aggregator.role_permissions(g.user.id, g.ops.id).await.unwrap();
        assert_eq!(perms, vec![g.read.clone(), g.write.clone()]);
        let roles = g.aggregator.effective_roles(g.user.id, g.ops.id).await.unwrap();
        assert_eq!(roles, vec![g.editor.clone(), g.viewer.clone()]);
    }

    #[tokio::test]
    async fn roles_without_department_scope_grant_nothing() {
        let g = graph().await;
        // alice holds no role scoped to sales, so the sales grant is unreachable
        let perms = g.aggregator.role_permissions(g.user.id, g.sales.id).await.unwrap();
        assert!(perms.is_empty());
    }

    #[tokio::test]
    async fn facets_stay_separate() {
        let g = graph().await;
        assert!(
            g.aggregator
                .direct_permissions(g.user.id, g.ops.id)
                .await
                .unwrap()
                .is_empty()
        );

        g.store
            .commit(
                Mutation::InsertUserPermission(UserPermission::new(
                    g.user.id, g.write.id, g.ops.id,
                ))
                .into(),
            )
            .await
            .unwrap();
        g.cache
            .remove(&keys::user_permissions(g.user.id, g.ops.id))
            .await
            .unwrap();

        let direct = g.aggregator.direct_permissions(g.user.id, g.ops.id).await.unwrap();
        assert_eq!(direct, vec![g.write.clone()]);
        let via_roles = g.aggregator.role_permissions(g.user.id, g.ops.id).await.unwrap();
        assert_eq!(via_roles.len(), 2);
    }

    #[tokio::test]
    async fn cached_bucket_is_served_until_invalidated() {
        let g = graph().await;
        let first = g.aggregator.role_permissions(g.user.id, g.ops.id).await.unwrap();
        assert_eq!(first.len(), 2);

        // drop editor's write grant behind the cache's back
        let grants = g.store.department_grants(g.ops.id).await.unwrap();
        let write_grant = grants
            .role_permissions
            .iter()
            .find(|rp| rp.role_id == g.editor.id && rp.permission_id == g.write.id)
            .unwrap();
        g.store
            .commit(Mutation::DeleteRolePermission(write_grant.id).into())
            .await
            .unwrap();
        assert_eq!(
            g.aggregator.role_permissions(g.user.id, g.ops.id).await.unwrap().len(),
            2
        );

        g.cache
            .remove(&keys::role_permissions(g.editor.id, g.ops.id))
            .await
            .unwrap();
        assert_eq!(
            g.aggregator.role_permissions(g.user.id, g.ops.id).await.unwrap(),
            vec![g.read.clone()]
        );
    }

    #[tokio::test]
    async fn missing_active_department_is_not_found() {
        let g = graph().await;
        let err = g.aggregator.my_role_permissions(g.user.id, None).await.unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));

        g.active.set(g.user.id, g.ops.id).await.unwrap();
        let perms = g.aggregator.my_role_permissions(g.user.id, None).await.unwrap();
        assert_eq!(perms.len(), 2);
    }

    #[tokio::test]
    async fn department_grants_require_existing_department() {
        let g = graph().await;
        let grants = g.aggregator.department_grants(g.ops.id).await.unwrap();
        assert_eq!(grants.role_permissions.len(), 3);
        let err = g.aggregator.department_grants(Uuid::now_v7()).await.unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
    }
}
