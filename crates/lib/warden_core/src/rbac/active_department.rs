//! Cache-backed pointer from a user to the department they operate in.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cache::{Cache, CacheExt, keys};
use crate::error::{CoreError, CoreResult};
use crate::models::ActiveDepartmentEntry;
use crate::store::{Mutation, Transactional, UserStore};

pub struct ActiveDepartmentResolver {
    users: Arc<dyn UserStore>,
    tx: Arc<dyn Transactional>,
    cache: Arc<dyn Cache>,
    ttl: Duration,
}

impl ActiveDepartmentResolver {
    pub fn new(
        users: Arc<dyn UserStore>,
        tx: Arc<dyn Transactional>,
        cache: Arc<dyn Cache>,
        ttl: Duration,
    ) -> Self {
        Self {
            users,
            tx,
            cache,
            ttl,
        }
    }

    /// Current department of `user_id`: cache first, then the persisted pointer.
    pub async fn get(&self, user_id: Uuid) -> CoreResult<Option<Uuid>> {
        let key = keys::active_department(user_id);
        match self.cache.get_json::<ActiveDepartmentEntry>(&key).await {
            Ok(Some(entry)) => return Ok(Some(entry.department_id)),
            Ok(None) => debug!(%user_id, "active department cache miss"),
            Err(e) => warn!(%user_id, error = %e, "active department cache read failed"),
        }

        let Some(user) = self.users.find_user(user_id).await? else {
            return Ok(None);
        };
        if let Some(department_id) = user.active_department_id {
            self.write_through(user_id, department_id).await;
        }
        Ok(user.active_department_id)
    }

    /// Persist the pointer, then refresh the cache. Unknown users are rejected
    /// before anything is written.
    pub async fn set(&self, user_id: Uuid, department_id: Uuid) -> CoreResult<()> {
        if self.users.find_user(user_id).await?.is_none() {
            return Err(CoreError::not_found("User"));
        }
        self.tx
            .commit(
                Mutation::SetActiveDepartment {
                    user_id,
                    department_id: Some(department_id),
                }
                .into(),
            )
            .await?;
        self.write_through(user_id, department_id).await;
        Ok(())
    }

    /// Evict the cached pointer and clear the persisted one.
    ///
    /// Eviction happens first and unconditionally.
    pub async fn remove(&self, user_id: Uuid) -> CoreResult<()> {
        if let Err(e) = self.cache.remove(&keys::active_department(user_id)).await {
            warn!(%user_id, error = %e, "active department eviction failed");
        }
        if self.users.find_user(user_id).await?.is_some() {
            self.tx
                .commit(
                    Mutation::SetActiveDepartment {
                        user_id,
                        department_id: None,
                    }
                    .into(),
                )
                .await?;
        }
        Ok(())
    }

    /// Whether a pointer is currently cached. Does not consult the store.
    pub async fn has_active(&self, user_id: Uuid) -> CoreResult<bool> {
        Ok(self.cache.exists(&keys::active_department(user_id)).await?)
    }

    async fn write_through(&self, user_id: Uuid, department_id: Uuid) {
        let entry = ActiveDepartmentEntry {
            department_id,
            updated_at: Utc::now(),
        };
        if let Err(e) = self
            .cache
            .set_json(&keys::active_department(user_id), &entry, self.ttl)
            .await
        {
            warn!(%user_id, error = %e, "active department cache write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::auth::password::HashedPassword;
    use crate::cache::MemoryCache;
    use crate::models::{Department, ProfileDetails, User};
    use crate::store::{InMemoryStore, StoreResult, UnitOfWork};
    use crate::values::{Email, EntityName, PersonName, Phone};

    /// Counts user lookups on top of an in-memory store.
    struct CountingUsers {
        inner: Arc<InMemoryStore>,
        lookups: AtomicUsize,
    }

    #[async_trait]
    impl UserStore for CountingUsers {
        async fn find_user(&self, id: Uuid) -> StoreResult<Option<User>> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            self.inner.find_user(id).await
        }
        async fn find_user_by_email(&self, email: &Email) -> StoreResult<Option<User>> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            self.inner.find_user_by_email(email).await
        }
        async fn email_exists(&self, email: &Email) -> StoreResult<bool> {
            self.inner.email_exists(email).await
        }
        async fn users_with_active_department(&self, department_id: Uuid) -> StoreResult<Vec<User>> {
            self.inner.users_with_active_department(department_id).await
        }
    }

    struct Fixture {
        store: Arc<InMemoryStore>,
        users: Arc<CountingUsers>,
        cache: Arc<MemoryCache>,
        resolver: ActiveDepartmentResolver,
        user: User,
        dept: Department,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let user = User::new(
            PersonName::parse("Alice").unwrap(),
            Email::parse("alice@example.com").unwrap(),
            HashedPassword::from_stored("h".into(), "s".into()),
            Phone::parse("5550102030").unwrap(),
            ProfileDetails::default(),
        );
        let dept = Department::new(EntityName::parse("Ops").unwrap());
        let mut work = UnitOfWork::new();
        work.stage(Mutation::InsertUser(user.clone()))
            .stage(Mutation::InsertDepartment(dept.clone()));
        store.commit(work).await.unwrap();

        let users = Arc::new(CountingUsers {
            inner: store.clone(),
            lookups: AtomicUsize::new(0),
        });
        let cache = Arc::new(MemoryCache::new());
        let resolver = ActiveDepartmentResolver::new(
            users.clone(),
            store.clone(),
            cache.clone(),
            Duration::from_secs(60),
        );
        Fixture {
            store,
            users,
            cache,
            resolver,
            user,
            dept,
        }
    }

    #[tokio::test]
    async fn set_then_get_needs_no_further_lookup() {
        let f = fixture().await;
        f.resolver.set(f.user.id, f.dept.id).await.unwrap();
        let after_set = f.users.lookups.load(Ordering::SeqCst);

        assert_eq!(f.resolver.get(f.user.id).await.unwrap(), Some(f.dept.id));
        assert_eq!(f.users.lookups.load(Ordering::SeqCst), after_set);
    }

    #[tokio::test]
    async fn get_falls_back_to_store_and_writes_through() {
        let f = fixture().await;
        f.resolver.set(f.user.id, f.dept.id).await.unwrap();
        f.cache
            .remove(&keys::active_department(f.user.id))
            .await
            .unwrap();

        assert_eq!(f.resolver.get(f.user.id).await.unwrap(), Some(f.dept.id));
        assert!(f.resolver.has_active(f.user.id).await.unwrap());
    }

    #[tokio::test]
    async fn set_for_unknown_user_has_no_side_effects() {
        let f = fixture().await;
        let ghost = Uuid::now_v7();
        let err = f.resolver.set(ghost, f.dept.id).await.unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
        assert!(!f.resolver.has_active(ghost).await.unwrap());
    }

    #[tokio::test]
    async fn remove_clears_cache_and_store() {
        let f = fixture().await;
        f.resolver.set(f.user.id, f.dept.id).await.unwrap();
        f.resolver.remove(f.user.id).await.unwrap();

        assert!(!f.resolver.has_active(f.user.id).await.unwrap());
        let stored = f.store.find_user(f.user.id).await.unwrap().unwrap();
        assert_eq!(stored.active_department_id, None);
        assert_eq!(f.resolver.get(f.user.id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn has_active_ignores_the_store() {
        let f = fixture().await;
        f.resolver.set(f.user.id, f.dept.id).await.unwrap();
        f.cache
            .remove(&keys::active_department(f.user.id))
            .await
            .unwrap();
        assert!(!f.resolver.has_active(f.user.id).await.unwrap());
    }
}
