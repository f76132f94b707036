//! Login, rotation, blocking, logout and bearer authentication.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use super::CallerContext;
use super::jwt::{JwtSigner, generate_refresh_token, looks_like_jwt, looks_like_refresh_token};
use super::lifecycle::TokenLifecycle;
use crate::cache::{Cache, keys};
use crate::error::{CoreError, CoreResult};
use crate::models::{AccessClaims, AuthUser, TokenBundle, TokenType, User};
use crate::rbac::ActiveDepartmentResolver;
use crate::store::{RbacStore, Store, Transactional, UnitOfWork, UserStore};
use crate::values::Email;

/// What a successful `block_token` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockOutcome {
    pub token_type: TokenType,
    /// Whether a stored refresh token row was revoked.
    pub revoked: bool,
}

pub struct TokenService {
    store: Arc<dyn Store>,
    cache: Arc<dyn Cache>,
    signer: JwtSigner,
    lifecycle: Arc<TokenLifecycle>,
    active: Arc<ActiveDepartmentResolver>,
    refresh_ttl: Duration,
}

impl TokenService {
    pub fn new(
        store: Arc<dyn Store>,
        cache: Arc<dyn Cache>,
        signer: JwtSigner,
        lifecycle: Arc<TokenLifecycle>,
        active: Arc<ActiveDepartmentResolver>,
        refresh_ttl: Duration,
    ) -> Self {
        Self {
            store,
            cache,
            signer,
            lifecycle,
            active,
            refresh_ttl,
        }
    }

    pub fn signer(&self) -> &JwtSigner {
        &self.signer
    }

    /// Verify credentials and issue a token pair for the active department.
    ///
    /// Unknown emails and wrong passwords fail identically.
    pub async fn login(&self, email: &str, password: &str) -> CoreResult<TokenBundle> {
        let email = Email::parse(email).map_err(|_| CoreError::invalid_credentials())?;
        let Some(user) = self.store.find_user_by_email(&email).await? else {
            return Err(CoreError::invalid_credentials());
        };
        if !user.password.verify_blocking(password.to_string()).await? {
            return Err(CoreError::invalid_credentials());
        }

        let department_id = self.resolve_department(user.id).await?;
        let bundle = self
            .issue_bundle(&user, department_id, UnitOfWork::new())
            .await?;
        info!(user_id = %user.id, %department_id, "login succeeded");
        Ok(bundle)
    }

    /// Exchange a live refresh token for a new pair. The old token is
    /// revoked in the same commit that stores its replacement.
    pub async fn refresh(&self, refresh_token: &str) -> CoreResult<TokenBundle> {
        let rejected = || CoreError::Unauthorized("Invalid refresh token".into());
        if !looks_like_refresh_token(refresh_token) {
            return Err(rejected());
        }
        if self.lifecycle.is_blacklisted(refresh_token).await? {
            return Err(rejected());
        }
        let now = Utc::now();
        let row = match self.lifecycle.find_refresh(refresh_token).await? {
            Some(row) if row.is_active(now) => row,
            _ => return Err(rejected()),
        };
        let Some(user) = self.store.find_user(row.user_id).await? else {
            return Err(rejected());
        };

        let department_id = self.resolve_department(user.id).await?;
        let mut work = UnitOfWork::new();
        work.stage(TokenLifecycle::revocation(&row, "rotated", now));
        let bundle = self.issue_bundle(&user, department_id, work).await?;
        self.lifecycle.evict_mirror(refresh_token).await;
        info!(user_id = %user.id, "refresh token rotated");
        Ok(bundle)
    }

    /// Block a single access or refresh token.
    pub async fn block_token(&self, token: &str, reason: Option<&str>) -> CoreResult<BlockOutcome> {
        let token = token.trim();
        let access_expiry = if looks_like_jwt(token) {
            let Some(claims) = self.signer.verify_ignoring_expiry(token) else {
                return Err(CoreError::validation(["token: Token is not a valid access token"]));
            };
            Some(claims_expiry(&claims, self.signer.ttl()))
        } else if looks_like_refresh_token(token) {
            None
        } else {
            return Err(CoreError::validation(["token: Token format is invalid"]));
        };

        if self.lifecycle.is_blacklisted(token).await? {
            return Err(CoreError::AlreadyBlocked);
        }

        if access_expiry.is_none()
            && let Some(row) = self.lifecycle.find_refresh(token).await?
        {
            if row.is_revoked() {
                return Err(CoreError::AlreadyBlocked);
            }
            let reason_text = reason.unwrap_or("blocked");
            self.store
                .commit(TokenLifecycle::revocation(&row, reason_text, Utc::now()).into())
                .await?;
            self.lifecycle.evict_mirror(token).await;
            self.lifecycle.blacklist_row(&row, reason).await?;
            info!(user_id = %row.user_id, "refresh token blocked");
            return Ok(BlockOutcome {
                token_type: TokenType::Refresh,
                revoked: true,
            });
        }

        let expires_at = access_expiry.unwrap_or_else(|| fallback_expiry(self.signer.ttl()));
        self.lifecycle
            .blacklist(token, TokenType::Access, reason, expires_at)
            .await?;
        info!("access token blocked");
        Ok(BlockOutcome {
            token_type: TokenType::Access,
            revoked: false,
        })
    }

    /// Revoke and blacklist every active refresh token of a user.
    pub async fn block_all_user_tokens(&self, user_id: Uuid, reason: Option<&str>) -> CoreResult<u64> {
        if self.store.find_user(user_id).await?.is_none() {
            return Err(CoreError::not_found("User"));
        }
        let rows = self.lifecycle.active_for_user(user_id).await?;
        if rows.is_empty() {
            return Ok(0);
        }
        self.lifecycle
            .revoke_all(&rows, reason.unwrap_or("blocked"))
            .await?;
        for row in &rows {
            self.lifecycle.blacklist_row(row, reason).await?;
        }
        if let Err(e) = self.lifecycle.evict_user_mirrors(user_id).await {
            warn!(%user_id, error = %e, "refresh token mirror eviction failed");
        }
        info!(%user_id, count = rows.len(), "all user tokens blocked");
        Ok(rows.len() as u64)
    }

    /// End the caller's session.
    ///
    /// Refresh token rows stay valid so other sessions of the same user
    /// survive; only their cache mirrors are dropped. Every step runs even if
    /// an earlier one failed; any failure is reported as a single `Logout`
    /// error.
    pub async fn logout(&self, caller: &CallerContext) -> CoreResult<()> {
        let user_id = caller.require_user()?;
        let mut failed = false;

        let mut evict = vec![keys::user(user_id), keys::active_department(user_id)];
        match self.store.find_user(user_id).await {
            Ok(Some(user)) => {
                evict.push(keys::user_email(user.email.as_str()));
                evict.push(keys::access_token(user.email.as_str()));
            }
            Ok(None) => {}
            Err(e) => {
                warn!(%user_id, error = %e, "logout user lookup failed");
                failed = true;
            }
        }
        for key in &evict {
            if let Err(e) = self.cache.remove(key).await {
                warn!(%user_id, %key, error = %e, "logout cache eviction failed");
                failed = true;
            }
        }

        if let Some(bearer) = caller.bearer_token.as_deref() {
            let expires_at = self
                .signer
                .verify_ignoring_expiry(bearer)
                .map(|claims| claims_expiry(&claims, self.signer.ttl()))
                .unwrap_or_else(|| fallback_expiry(self.signer.ttl()));
            if let Err(e) = self
                .lifecycle
                .blacklist(bearer, TokenType::Access, Some("logout"), expires_at)
                .await
            {
                warn!(%user_id, error = %e, "logout blacklist failed");
                failed = true;
            }
        }

        if let Err(e) = self.lifecycle.evict_user_mirrors(user_id).await {
            warn!(%user_id, error = %e, "logout mirror eviction failed");
            failed = true;
        }

        if failed {
            return Err(CoreError::Logout);
        }
        info!(%user_id, "logout");
        Ok(())
    }

    /// Verify a bearer access token and reject blacklisted ones.
    pub async fn authenticate(&self, access_token: &str) -> CoreResult<AccessClaims> {
        let Some(claims) = self.signer.verify(access_token) else {
            return Err(CoreError::Unauthorized("Invalid or expired token".into()));
        };
        if self.lifecycle.is_blacklisted(access_token).await? {
            return Err(CoreError::Unauthorized("Token has been revoked".into()));
        }
        Ok(claims)
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    /// Active department, seeded with the first department that carries one
    /// of the user's roles when none is set.
    async fn resolve_department(&self, user_id: Uuid) -> CoreResult<Uuid> {
        if let Some(department_id) = self.active.get(user_id).await? {
            return Ok(department_id);
        }
        let Some(first) = self.store.departments_for_user(user_id).await?.into_iter().next()
        else {
            return Err(CoreError::NoValidDepartment);
        };
        self.active.set(user_id, first.id).await?;
        Ok(first.id)
    }

    async fn issue_bundle(
        &self,
        user: &User,
        department_id: Uuid,
        work: UnitOfWork,
    ) -> CoreResult<TokenBundle> {
        let roles: Vec<String> = self
            .store
            .roles_in_department(user.id, department_id)
            .await?
            .into_iter()
            .map(|role| role.name.as_str().to_string())
            .collect();
        if roles.is_empty() {
            return Err(CoreError::NoRolesInDepartment);
        }

        let (access_token, claims) = self.signer.issue(
            &user.id.to_string(),
            user.full_name.as_str(),
            user.email.as_str(),
            &roles,
        )?;
        let refresh_expires_at = expiry_after(self.refresh_ttl).ok_or_else(|| {
            CoreError::Token(format!("refresh ttl out of range: {:?}", self.refresh_ttl))
        })?;
        let refresh_token = generate_refresh_token();
        let refresh = self
            .lifecycle
            .persist_refresh(
                work,
                user.id,
                user.email.as_str(),
                &refresh_token,
                refresh_expires_at,
            )
            .await?;

        let ttl = self.signer.ttl();
        let bundle = TokenBundle {
            access_token,
            refresh_token,
            token_type: "Bearer".into(),
            expires_in: ttl.as_secs() as i64,
            access_expires_at: claims_expiry(&claims, ttl),
            refresh_expires_at: refresh.expires_at,
            user: AuthUser {
                id: user.id,
                email: user.email.as_str().to_string(),
                name: user.full_name.as_str().to_string(),
                roles,
                department_id,
            },
        };
        self.lifecycle.cache_access_bundle(&bundle, ttl).await;
        Ok(bundle)
    }
}

/// `now + ttl`, or `None` when the instant is not representable.
fn expiry_after(ttl: Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| Utc::now().checked_add_signed(ttl))
}

fn fallback_expiry(ttl: Duration) -> DateTime<Utc> {
    expiry_after(ttl).unwrap_or_else(Utc::now)
}

fn claims_expiry(claims: &AccessClaims, ttl: Duration) -> DateTime<Utc> {
    claims.expires_at().unwrap_or_else(|| fallback_expiry(ttl))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::password::HashedPassword;
    use crate::cache::{CacheExt, MemoryCache};
    use crate::config::AuthConfig;
    use crate::models::{
        Department, ProfileDetails, RefreshTokenMirror, Role, UserRole, UserRoleInDepartment,
    };
    use crate::store::{InMemoryStore, Mutation, TokenStore};
    use crate::values::{EntityName, PersonName, Phone};

    struct Fixture {
        store: Arc<InMemoryStore>,
        cache: Arc<MemoryCache>,
        tokens: TokenService,
        user: User,
        department: Department,
    }

    async fn fixture(with_role: bool) -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let cache = Arc::new(MemoryCache::new());
        let config = AuthConfig::with_secret("token-service-test-secret-0123456789");

        let user = User::new(
            PersonName::parse("Alice Liddell").unwrap(),
            Email::parse("alice@example.com").unwrap(),
            HashedPassword::create("Secr3tPass").unwrap(),
            Phone::parse("5550102030").unwrap(),
            ProfileDetails::default(),
        );
        let department = Department::new(EntityName::parse("Engineering").unwrap());
        let mut work = UnitOfWork::new();
        work.stage(Mutation::InsertUser(user.clone()))
            .stage(Mutation::InsertDepartment(department.clone()));
        if with_role {
            let role = Role::new(EntityName::parse("Editor").unwrap(), None);
            let user_role = UserRole::new(user.id, role.id);
            work.stage(Mutation::InsertRole(role))
                .stage(Mutation::InsertUserRole(user_role.clone()))
                .stage(Mutation::InsertUserRoleDepartment(UserRoleInDepartment::new(
                    user_role.id,
                    department.id,
                )));
        }
        store.commit(work).await.unwrap();

        let lifecycle = Arc::new(TokenLifecycle::new(store.clone(), cache.clone()));
        let active = Arc::new(ActiveDepartmentResolver::new(
            store.clone(),
            store.clone(),
            cache.clone(),
            config.user_cache_ttl,
        ));
        let tokens = TokenService::new(
            store.clone(),
            cache.clone(),
            JwtSigner::new(&config),
            lifecycle,
            active,
            config.refresh_token_ttl,
        );
        Fixture {
            store,
            cache,
            tokens,
            user,
            department,
        }
    }

    async fn login(f: &Fixture) -> TokenBundle {
        f.tokens
            .login("Alice@Example.com", "Secr3tPass")
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn wrong_password_and_unknown_email_look_the_same() {
        let f = fixture(true).await;
        let wrong = f
            .tokens
            .login("alice@example.com", "nope")
            .await
            .unwrap_err();
        let unknown = f
            .tokens
            .login("bob@example.com", "Secr3tPass")
            .await
            .unwrap_err();
        assert_eq!(wrong.to_string(), "Auth: Invalid credentials");
        assert_eq!(unknown.to_string(), wrong.to_string());
    }

    #[tokio::test]
    async fn login_without_departments_fails() {
        let f = fixture(false).await;
        let err = f
            .tokens
            .login("alice@example.com", "Secr3tPass")
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::NoValidDepartment));
    }

    #[tokio::test]
    async fn login_seeds_active_department_and_caches() {
        let f = fixture(true).await;
        let bundle = login(&f).await;

        assert_eq!(bundle.user.department_id, f.department.id);
        assert_eq!(bundle.user.roles, vec!["Editor".to_string()]);
        assert_eq!(bundle.refresh_token.len(), 64);
        let stored = f.store.find_user(f.user.id).await.unwrap().unwrap();
        assert_eq!(stored.active_department_id, Some(f.department.id));

        let mirror: RefreshTokenMirror = f
            .cache
            .get_json(&keys::refresh_token(&bundle.refresh_token))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(mirror.user_id, f.user.id);
        let cached: TokenBundle = f
            .cache
            .get_json(&keys::access_token("alice@example.com"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cached, bundle);

        let claims = f.tokens.authenticate(&bundle.access_token).await.unwrap();
        assert_eq!(claims.user_id(), Some(f.user.id));
    }

    #[tokio::test]
    async fn active_department_without_roles_is_rejected() {
        let f = fixture(true).await;
        let other = Department::new(EntityName::parse("Sales").unwrap());
        f.store
            .commit(Mutation::InsertDepartment(other.clone()).into())
            .await
            .unwrap();
        f.store
            .commit(
                Mutation::SetActiveDepartment {
                    user_id: f.user.id,
                    department_id: Some(other.id),
                }
                .into(),
            )
            .await
            .unwrap();
        let err = f
            .tokens
            .login("alice@example.com", "Secr3tPass")
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::NoRolesInDepartment));
    }

    #[tokio::test]
    async fn refresh_rotates_once() {
        let f = fixture(true).await;
        let first = login(&f).await;

        let second = f.tokens.refresh(&first.refresh_token).await.unwrap();
        assert_ne!(second.refresh_token, first.refresh_token);

        let old = f
            .store
            .find_refresh_token(&keys::token_digest(&first.refresh_token))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(old.revoked_by.as_deref(), Some("rotated"));
        assert!(
            !f.cache
                .exists(&keys::refresh_token(&first.refresh_token))
                .await
                .unwrap()
        );

        let err = f.tokens.refresh(&first.refresh_token).await.unwrap_err();
        assert!(matches!(err, CoreError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn block_token_twice_is_already_blocked() {
        let f = fixture(true).await;
        let bundle = login(&f).await;

        let outcome = f
            .tokens
            .block_token(&bundle.refresh_token, Some("stolen"))
            .await
            .unwrap();
        assert_eq!(outcome.token_type, TokenType::Refresh);
        assert!(outcome.revoked);

        let err = f
            .tokens
            .block_token(&bundle.refresh_token, Some("stolen"))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::AlreadyBlocked));
        assert!(f.tokens.refresh(&bundle.refresh_token).await.is_err());

        let blacklisted = f.cache.keys_with_prefix("TokenBlacklist:");
        assert_eq!(blacklisted, vec![keys::token_blacklist(&bundle.refresh_token)]);
    }

    #[tokio::test]
    async fn blocked_access_token_no_longer_authenticates() {
        let f = fixture(true).await;
        let bundle = login(&f).await;
        let outcome = f
            .tokens
            .block_token(&bundle.access_token, None)
            .await
            .unwrap();
        assert_eq!(outcome.token_type, TokenType::Access);
        assert!(f.tokens.authenticate(&bundle.access_token).await.is_err());
    }

    #[tokio::test]
    async fn malformed_tokens_fail_validation() {
        let f = fixture(true).await;
        let almost = "x".repeat(63);
        for token in ["", "short", "a.b.c", almost.as_str()] {
            let err = f.tokens.block_token(token, None).await.unwrap_err();
            assert!(matches!(err, CoreError::Validation(_)), "{token:?}");
        }
    }

    #[tokio::test]
    async fn block_all_user_tokens_counts_active_rows() {
        let f = fixture(true).await;
        assert_eq!(f.tokens.block_all_user_tokens(f.user.id, None).await.unwrap(), 0);

        login(&f).await;
        login(&f).await;
        let count = f
            .tokens
            .block_all_user_tokens(f.user.id, Some("compromised"))
            .await
            .unwrap();
        assert_eq!(count, 2);
        assert!(
            f.store
                .active_refresh_tokens(f.user.id, Utc::now())
                .await
                .unwrap()
                .is_empty()
        );
        assert_eq!(f.cache.keys_with_prefix("TokenBlacklist:").len(), 2);
        assert!(f.cache.keys_with_prefix("RefreshToken:").is_empty());

        let err = f
            .tokens
            .block_all_user_tokens(Uuid::now_v7(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn logout_clears_session_state() {
        let f = fixture(true).await;
        let bundle = login(&f).await;
        let caller = CallerContext::authenticated(f.user.id, bundle.access_token.clone());

        f.tokens.logout(&caller).await.unwrap();

        assert!(f.tokens.authenticate(&bundle.access_token).await.is_err());
        assert!(
            !f.cache
                .exists(&keys::active_department(f.user.id))
                .await
                .unwrap()
        );
        assert!(
            !f.cache
                .exists(&keys::access_token("alice@example.com"))
                .await
                .unwrap()
        );
        assert!(
            !f.cache
                .exists(&keys::refresh_token(&bundle.refresh_token))
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn logout_leaves_other_sessions_refreshable() {
        let f = fixture(true).await;
        let laptop = login(&f).await;
        let phone = login(&f).await;
        let caller = CallerContext::authenticated(f.user.id, laptop.access_token.clone());

        f.tokens.logout(&caller).await.unwrap();

        assert!(f.tokens.authenticate(&laptop.access_token).await.is_err());
        let rotated = f.tokens.refresh(&phone.refresh_token).await.unwrap();
        assert_ne!(rotated.refresh_token, phone.refresh_token);
        assert!(f.tokens.authenticate(&rotated.access_token).await.is_ok());
    }

    #[tokio::test]
    async fn logout_requires_a_caller() {
        let f = fixture(true).await;
        let err = f
            .tokens
            .logout(&CallerContext::anonymous())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Unauthorized(_)));
    }
}
