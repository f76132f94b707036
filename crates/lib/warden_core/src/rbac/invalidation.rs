//! Post-commit cache eviction.
//!
//! Called only after a unit of work has been committed. Eviction failures are
//! logged and counted but never propagated: the commit already happened, and
//! a stale entry ages out with its TTL.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, warn};
use uuid::Uuid;

use crate::cache::{Cache, keys};

/// A group of cache entries derived from one piece of durable state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidationTarget {
    /// `User:{id}`, `UserEmail:{email}` and `AccessToken:{email}`.
    UserIdentity { user_id: Uuid, email: String },
    /// Identity plus `UserActiveDepartment:{id}`.
    UserSession { user_id: Uuid, email: String },
    /// A role's grant bucket in one department, plus the department bucket.
    RoleGrants { role_id: Uuid, department_id: Uuid },
    /// A user's direct grant bucket in one department, plus the department bucket.
    UserGrants { user_id: Uuid, department_id: Uuid },
    Department { department_id: Uuid },
}

impl InvalidationTarget {
    fn keys(&self) -> Vec<String> {
        match self {
            InvalidationTarget::UserIdentity { user_id, email } => vec![
                keys::user(*user_id),
                keys::user_email(email),
                keys::access_token(email),
            ],
            InvalidationTarget::UserSession { user_id, email } => vec![
                keys::user(*user_id),
                keys::user_email(email),
                keys::access_token(email),
                keys::active_department(*user_id),
            ],
            InvalidationTarget::RoleGrants {
                role_id,
                department_id,
            } => vec![
                keys::role_permissions(*role_id, *department_id),
                keys::department_permissions(*department_id),
            ],
            InvalidationTarget::UserGrants {
                user_id,
                department_id,
            } => vec![
                keys::user_permissions(*user_id, *department_id),
                keys::department_permissions(*department_id),
            ],
            InvalidationTarget::Department { department_id } => {
                vec![keys::department_permissions(*department_id)]
            }
        }
    }
}

pub struct CacheInvalidator {
    cache: Arc<dyn Cache>,
    failures: AtomicU64,
}

impl CacheInvalidator {
    pub fn new(cache: Arc<dyn Cache>) -> Self {
        Self {
            cache,
            failures: AtomicU64::new(0),
        }
    }

    /// Evict every key of every target once, best effort.
    pub async fn invalidate(&self, targets: &[InvalidationTarget]) {
        let keys: BTreeSet<String> = targets.iter().flat_map(|t| t.keys()).collect();
        for key in keys {
            match self.cache.remove(&key).await {
                Ok(()) => debug!(key = %key, "cache entry invalidated"),
                Err(e) => {
                    self.failures.fetch_add(1, Ordering::Relaxed);
                    warn!(key = %key, error = %e, "cache invalidation failed");
                }
            }
        }
    }

    /// Total evictions that failed since construction.
    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::cache::{CacheError, CacheResult, MemoryCache};

    struct BrokenCache;

    #[async_trait]
    impl Cache for BrokenCache {
        async fn get(&self, _key: &str) -> CacheResult<Option<String>> {
            Err(CacheError::Connection("down".into()))
        }
        async fn set(&self, _key: &str, _value: String, _ttl: Duration) -> CacheResult<()> {
            Err(CacheError::Connection("down".into()))
        }
        async fn remove(&self, _key: &str) -> CacheResult<()> {
            Err(CacheError::Connection("down".into()))
        }
        async fn exists(&self, _key: &str) -> CacheResult<bool> {
            Err(CacheError::Connection("down".into()))
        }
    }

    #[tokio::test]
    async fn role_grants_evict_role_and_department_buckets() {
        let cache = Arc::new(MemoryCache::new());
        let role = Uuid::from_u128(1);
        let dept = Uuid::from_u128(2);
        let ttl = Duration::from_secs(60);
        for key in [
            keys::role_permissions(role, dept),
            keys::department_permissions(dept),
            keys::user_permissions(role, dept),
        ] {
            cache.set(&key, "[]".into(), ttl).await.unwrap();
        }

        let invalidator = CacheInvalidator::new(cache.clone());
        invalidator
            .invalidate(&[InvalidationTarget::RoleGrants {
                role_id: role,
                department_id: dept,
            }])
            .await;

        assert!(!cache.exists(&keys::role_permissions(role, dept)).await.unwrap());
        assert!(!cache.exists(&keys::department_permissions(dept)).await.unwrap());
        // unrelated bucket stays
        assert!(cache.exists(&keys::user_permissions(role, dept)).await.unwrap());
    }

    #[tokio::test]
    async fn failures_are_counted_not_raised() {
        let invalidator = CacheInvalidator::new(Arc::new(BrokenCache));
        invalidator
            .invalidate(&[
                InvalidationTarget::UserGrants {
                    user_id: Uuid::from_u128(1),
                    department_id: Uuid::from_u128(9),
                },
                InvalidationTarget::Department {
                    department_id: Uuid::from_u128(9),
                },
            ])
            .await;
        // the shared department key is evicted once
        assert_eq!(invalidator.failure_count(), 2);
    }

    #[test]
    fn session_covers_identity_and_active_department() {
        let user_id = Uuid::from_u128(7);
        let evicted = InvalidationTarget::UserSession {
            user_id,
            email: "a@example.com".into(),
        }
        .keys();
        assert!(evicted.contains(&keys::active_department(user_id)));
        assert!(evicted.contains(&keys::access_token("a@example.com")));
    }
}
