//! Hybrid persistence of refresh tokens and blacklist markers.
//!
//! The store holds the authoritative refresh token rows, keyed by the
//! SHA-256 digest of the token. The cache holds a mirror of each live refresh
//! token, a per-user list of the mirrored raw tokens, and a blacklist marker
//! per blocked token. Blacklist entries live exactly as long as the token
//! they block.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cache::{Cache, CacheExt, keys};
use crate::error::CoreResult;
use crate::models::{
    BlacklistEntry, MirroredRefreshToken, RefreshToken, RefreshTokenMirror, TokenBundle,
    TokenType,
};
use crate::store::{Mutation, Store, TokenStore, Transactional, UnitOfWork};

/// Blacklist markers are kept for at least this long.
const MIN_BLACKLIST_TTL: Duration = Duration::from_secs(1);

/// Remaining lifetime until `expires_at`, zero if already past.
pub fn remaining(expires_at: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (expires_at - now).to_std().unwrap_or(Duration::ZERO)
}

pub struct TokenLifecycle {
    store: Arc<dyn Store>,
    cache: Arc<dyn Cache>,
}

impl TokenLifecycle {
    pub fn new(store: Arc<dyn Store>, cache: Arc<dyn Cache>) -> Self {
        Self { store, cache }
    }

    /// Stage a new refresh token into `work`, commit it, then mirror it.
    ///
    /// `work` may already carry other mutations (e.g. the revocation of the
    /// token being rotated) so both land in one transaction. Only the digest
    /// of `token` is stored.
    pub async fn persist_refresh(
        &self,
        mut work: UnitOfWork,
        user_id: Uuid,
        email: &str,
        token: &str,
        expires_at: DateTime<Utc>,
    ) -> CoreResult<RefreshToken> {
        let row = RefreshToken::issue(user_id, keys::token_digest(token), expires_at);
        work.stage(Mutation::InsertRefreshToken(row.clone()));
        self.store.commit(work).await?;

        let mirror = RefreshTokenMirror {
            user_id,
            email: email.to_string(),
            created_at: row.created_at,
            expires_at,
        };
        let now = Utc::now();
        if let Err(e) = self
            .cache
            .set_json(&keys::refresh_token(token), &mirror, remaining(expires_at, now))
            .await
        {
            warn!(%user_id, error = %e, "refresh token mirror write failed");
        }
        self.track_mirror(user_id, token, expires_at, now).await;
        Ok(row)
    }

    /// Remember a mirrored token so [`Self::evict_user_mirrors`] can find it.
    async fn track_mirror(
        &self,
        user_id: Uuid,
        token: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) {
        let key = keys::user_refresh_tokens(user_id);
        let mut entries: Vec<MirroredRefreshToken> = match self.cache.get_json(&key).await {
            Ok(entries) => entries.unwrap_or_default(),
            Err(e) => {
                warn!(%user_id, error = %e, "mirror list read failed");
                return;
            }
        };
        entries.retain(|entry| entry.expires_at > now);
        entries.push(MirroredRefreshToken {
            token: token.to_string(),
            expires_at,
        });
        let ttl = entries
            .iter()
            .map(|entry| remaining(entry.expires_at, now))
            .max()
            .unwrap_or(Duration::ZERO);
        if let Err(e) = self.cache.set_json(&key, &entries, ttl).await {
            warn!(%user_id, error = %e, "mirror list write failed");
        }
    }

    /// Mutation that marks `row` revoked.
    pub fn revocation(row: &RefreshToken, reason: &str, now: DateTime<Utc>) -> Mutation {
        Mutation::RevokeRefreshToken {
            id: row.id,
            revoked_at: now,
            reason: reason.to_string(),
        }
    }

    /// Revoke every row in one commit.
    pub async fn revoke_all(&self, rows: &[RefreshToken], reason: &str) -> CoreResult<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let now = Utc::now();
        let mut work = UnitOfWork::new();
        for row in rows {
            work.stage(Self::revocation(row, reason, now));
        }
        self.store.commit(work).await?;
        Ok(())
    }

    /// Stored row of a raw refresh token.
    pub async fn find_refresh(&self, token: &str) -> CoreResult<Option<RefreshToken>> {
        Ok(self
            .store
            .find_refresh_token(&keys::token_digest(token))
            .await?)
    }

    pub async fn active_for_user(&self, user_id: Uuid) -> CoreResult<Vec<RefreshToken>> {
        Ok(self.store.active_refresh_tokens(user_id, Utc::now()).await?)
    }

    /// Cached metadata of a refresh token, if mirrored.
    pub async fn mirror(&self, token: &str) -> CoreResult<Option<RefreshTokenMirror>> {
        Ok(self.cache.get_json(&keys::refresh_token(token)).await?)
    }

    pub async fn evict_mirror(&self, token: &str) {
        if let Err(e) = self.cache.remove(&keys::refresh_token(token)).await {
            warn!(error = %e, "refresh token mirror eviction failed");
        }
    }

    /// Evict the mirror of every refresh token tracked for the user, then
    /// the list itself.
    pub async fn evict_user_mirrors(&self, user_id: Uuid) -> CoreResult<()> {
        let key = keys::user_refresh_tokens(user_id);
        let entries: Vec<MirroredRefreshToken> =
            self.cache.get_json(&key).await?.unwrap_or_default();
        for entry in &entries {
            self.cache.remove(&keys::refresh_token(&entry.token)).await?;
        }
        self.cache.remove(&key).await?;
        Ok(())
    }

    /// Write a blacklist marker for a raw token that expires with it.
    pub async fn blacklist(
        &self,
        token: &str,
        token_type: TokenType,
        reason: Option<&str>,
        expires_at: DateTime<Utc>,
    ) -> CoreResult<()> {
        self.write_blacklist(keys::token_blacklist(token), token_type, reason, expires_at)
            .await
    }

    /// Blacklist a stored refresh token by its digest.
    pub async fn blacklist_row(&self, row: &RefreshToken, reason: Option<&str>) -> CoreResult<()> {
        self.write_blacklist(
            keys::token_blacklist_digest(&row.token_hash),
            TokenType::Refresh,
            reason,
            row.expires_at,
        )
        .await
    }

    async fn write_blacklist(
        &self,
        key: String,
        token_type: TokenType,
        reason: Option<&str>,
        expires_at: DateTime<Utc>,
    ) -> CoreResult<()> {
        let now = Utc::now();
        let entry = BlacklistEntry {
            blacklisted: true,
            blacklisted_at: now,
            reason: reason.map(str::to_string),
            token_type,
        };
        let ttl = remaining(expires_at, now).max(MIN_BLACKLIST_TTL);
        self.cache.set_json(&key, &entry, ttl).await?;
        debug!(?token_type, "token blacklisted");
        Ok(())
    }

    pub async fn is_blacklisted(&self, token: &str) -> CoreResult<bool> {
        Ok(self.cache.exists(&keys::token_blacklist(token)).await?)
    }

    /// Cache the issued bundle under `AccessToken:{email}`.
    pub async fn cache_access_bundle(&self, bundle: &TokenBundle, ttl: Duration) {
        let key = keys::access_token(&bundle.user.email);
        if let Err(e) = self.cache.set_json(&key, bundle, ttl).await {
            warn!(user_id = %bundle.user.id, error = %e, "access bundle cache write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;

    use super::*;
    use crate::auth::password::HashedPassword;
    use crate::cache::MemoryCache;
    use crate::models::{ProfileDetails, User};
    use crate::store::InMemoryStore;
    use crate::values::{Email, PersonName, Phone};

    async fn setup() -> (Arc<InMemoryStore>, Arc<MemoryCache>, TokenLifecycle, User) {
        let store = Arc::new(InMemoryStore::new());
        let cache = Arc::new(MemoryCache::new());
        let user = User::new(
            PersonName::parse("Alice").unwrap(),
            Email::parse("alice@example.com").unwrap(),
            HashedPassword::from_stored("h".into(), "s".into()),
            Phone::parse("5550102030").unwrap(),
            ProfileDetails::default(),
        );
        store
            .commit(Mutation::InsertUser(user.clone()).into())
            .await
            .unwrap();
        let lifecycle = TokenLifecycle::new(store.clone(), cache.clone());
        (store, cache, lifecycle, user)
    }

    #[tokio::test]
    async fn persisted_token_is_stored_hashed_and_mirrored() {
        let (store, _cache, lifecycle, user) = setup().await;
        let expires = Utc::now() + ChronoDuration::days(1);
        let raw = "t".repeat(64);
        let row = lifecycle
            .persist_refresh(UnitOfWork::new(), user.id, "alice@example.com", &raw, expires)
            .await
            .unwrap();

        assert_eq!(row.token_hash, keys::token_digest(&raw));
        assert_ne!(row.token_hash, raw);
        assert!(store.find_refresh_token(&raw).await.unwrap().is_none());
        assert_eq!(lifecycle.find_refresh(&raw).await.unwrap(), Some(row.clone()));
        let mirror = lifecycle.mirror(&raw).await.unwrap().unwrap();
        assert_eq!(mirror.user_id, user.id);
        assert_eq!(mirror.email, "alice@example.com");
    }

    #[tokio::test]
    async fn revoke_all_marks_every_row() {
        let (_store, _cache, lifecycle, user) = setup().await;
        let expires = Utc::now() + ChronoDuration::days(1);
        let a = lifecycle
            .persist_refresh(UnitOfWork::new(), user.id, "a", &"a".repeat(64), expires)
            .await
            .unwrap();
        let b = lifecycle
            .persist_refresh(UnitOfWork::new(), user.id, "a", &"b".repeat(64), expires)
            .await
            .unwrap();

        lifecycle.revoke_all(&[a, b], "compromised").await.unwrap();
        assert!(lifecycle.active_for_user(user.id).await.unwrap().is_empty());
        let stored = lifecycle.find_refresh(&"b".repeat(64)).await.unwrap().unwrap();
        assert_eq!(stored.revoked_by.as_deref(), Some("compromised"));
    }

    #[tokio::test]
    async fn user_mirrors_are_evicted_from_the_tracked_list() {
        let (_store, cache, lifecycle, user) = setup().await;
        let expires = Utc::now() + ChronoDuration::days(1);
        let tokens = ["a".repeat(64), "b".repeat(64)];
        for token in &tokens {
            lifecycle
                .persist_refresh(UnitOfWork::new(), user.id, "a", token, expires)
                .await
                .unwrap();
        }
        let tracked: Vec<MirroredRefreshToken> = cache
            .get_json(&keys::user_refresh_tokens(user.id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(tracked.len(), 2);

        lifecycle.evict_user_mirrors(user.id).await.unwrap();
        for token in &tokens {
            assert!(lifecycle.mirror(token).await.unwrap().is_none());
        }
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn row_blacklist_matches_raw_token_lookup() {
        let (_store, _cache, lifecycle, user) = setup().await;
        let raw = "r".repeat(64);
        let row = lifecycle
            .persist_refresh(
                UnitOfWork::new(),
                user.id,
                "a",
                &raw,
                Utc::now() + ChronoDuration::days(1),
            )
            .await
            .unwrap();
        lifecycle.blacklist_row(&row, Some("bulk")).await.unwrap();
        assert!(lifecycle.is_blacklisted(&raw).await.unwrap());
    }

    #[tokio::test]
    async fn blacklist_uses_hashed_key() {
        let (_store, cache, lifecycle, _user) = setup().await;
        let expires = Utc::now() + ChronoDuration::minutes(5);
        lifecycle
            .blacklist("raw-token", TokenType::Access, Some("test"), expires)
            .await
            .unwrap();
        assert!(lifecycle.is_blacklisted("raw-token").await.unwrap());
        assert!(cache.get("TokenBlacklist:raw-token").await.unwrap().is_none());

        let entry: BlacklistEntry = cache
            .get_json(&keys::token_blacklist("raw-token"))
            .await
            .unwrap()
            .unwrap();
        assert!(entry.blacklisted);
        assert_eq!(entry.reason.as_deref(), Some("test"));
    }

    #[test]
    fn remaining_is_zero_for_past_instants() {
        let now = Utc::now();
        assert_eq!(remaining(now - ChronoDuration::seconds(5), now), Duration::ZERO);
        assert_eq!(
            remaining(now + ChronoDuration::seconds(5), now),
            Duration::from_secs(5)
        );
    }
}
