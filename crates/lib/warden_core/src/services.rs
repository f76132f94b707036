//! Wiring of every core service over one store and one cache.

use std::sync::Arc;

use crate::auth::{CredentialService, JwtSigner, Reaper, TokenLifecycle, TokenService};
use crate::cache::Cache;
use crate::config::AuthConfig;
use crate::rbac::{ActiveDepartmentResolver, CacheInvalidator, PermissionAggregator, RbacAdmin};
use crate::store::Store;

/// Shared handles to all core services.
#[derive(Clone)]
pub struct Services {
    pub store: Arc<dyn Store>,
    pub cache: Arc<dyn Cache>,
    pub config: Arc<AuthConfig>,
    pub credentials: Arc<CredentialService>,
    pub tokens: Arc<TokenService>,
    pub active_departments: Arc<ActiveDepartmentResolver>,
    pub permissions: Arc<PermissionAggregator>,
    pub admin: Arc<RbacAdmin>,
    pub invalidator: Arc<CacheInvalidator>,
}

impl Services {
    pub fn new(store: Arc<dyn Store>, cache: Arc<dyn Cache>, config: AuthConfig) -> Self {
        let invalidator = Arc::new(CacheInvalidator::new(cache.clone()));
        let active_departments = Arc::new(ActiveDepartmentResolver::new(
            store.clone(),
            store.clone(),
            cache.clone(),
            config.user_cache_ttl,
        ));
        let lifecycle = Arc::new(TokenLifecycle::new(store.clone(), cache.clone()));
        let tokens = Arc::new(TokenService::new(
            store.clone(),
            cache.clone(),
            JwtSigner::new(&config),
            lifecycle,
            active_departments.clone(),
            config.refresh_token_ttl,
        ));
        let credentials = Arc::new(CredentialService::new(
            store.clone(),
            cache.clone(),
            invalidator.clone(),
            config.user_cache_ttl,
        ));
        let permissions = Arc::new(PermissionAggregator::new(
            store.clone(),
            cache.clone(),
            active_departments.clone(),
            config.permission_cache_ttl,
        ));
        let admin = Arc::new(RbacAdmin::new(store.clone(), invalidator.clone()));

        Self {
            store,
            cache,
            config: Arc::new(config),
            credentials,
            tokens,
            active_departments,
            permissions,
            admin,
            invalidator,
        }
    }

    /// Reaper over this store, ticking at the configured interval.
    pub fn reaper(&self) -> Reaper {
        Reaper::new(self.store.clone(), self.config.reaper_interval)
    }
}
