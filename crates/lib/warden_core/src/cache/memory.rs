//! In-process TTL cache.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use super::{Cache, CacheError, CacheResult};

#[derive(Debug, Clone)]
struct CacheEntry {
    value: String,
    expires_at: DateTime<Utc>,
}

impl CacheEntry {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

/// Concurrent map cache; expired entries read as absent and are purged
/// lazily or by [`MemoryCache::spawn_cleanup_task`].
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: DashMap<String, CacheEntry>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every expired entry.
    pub fn cleanup(&self) {
        let now = Utc::now();
        self.entries.retain(|_, e| e.is_live(now));
    }

    /// Number of stored entries, expired ones included until purged.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Live keys starting with `prefix`, sorted.
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let now = Utc::now();
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.key().starts_with(prefix) && entry.value().is_live(now))
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        keys
    }

    /// Spawn a background task that purges expired entries every `every`.
    pub fn spawn_cleanup_task(
        self: &Arc<Self>,
        every: Duration,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every.max(Duration::from_millis(1)));
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => cache.cleanup(),
                }
            }
        })
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        let now = Utc::now();
        let live = self.entries.get(key).map(|e| e.is_live(now).then(|| e.value.clone()));
        match live {
            Some(Some(value)) => Ok(Some(value)),
            Some(None) => {
                self.entries.remove_if(key, |_, e| !e.is_live(now));
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> CacheResult<()> {
        let expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| Utc::now().checked_add_signed(ttl))
            .ok_or_else(|| CacheError::Command(format!("ttl out of range: {ttl:?}")))?;
        self.entries
            .insert(key.to_string(), CacheEntry { value, expires_at });
        Ok(())
    }

    async fn remove(&self, key: &str) -> CacheResult<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> CacheResult<bool> {
        Ok(self.get(key).await?.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheExt;

    #[tokio::test]
    async fn get_returns_none_for_missing_key() {
        let cache = MemoryCache::new();
        assert!(cache.get("nope").await.unwrap().is_none());
        assert!(!cache.exists("nope").await.unwrap());
    }

    #[tokio::test]
    async fn set_then_get() {
        let cache = MemoryCache::new();
        cache
            .set("k", "v".into(), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("v"));
        cache.remove("k").await.unwrap();
        assert!(cache.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn zero_ttl_entry_is_never_visible() {
        let cache = MemoryCache::new();
        cache.set("k", "v".into(), Duration::ZERO).await.unwrap();
        assert!(cache.get("k").await.unwrap().is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn prefix_listing_skips_expired_and_foreign_keys() {
        let cache = MemoryCache::new();
        let ttl = Duration::from_secs(60);
        cache.set("A:2", "v".into(), ttl).await.unwrap();
        cache.set("A:1", "v".into(), ttl).await.unwrap();
        cache.set("B:1", "v".into(), ttl).await.unwrap();
        cache.set("A:dead", "v".into(), Duration::ZERO).await.unwrap();
        assert_eq!(cache.keys_with_prefix("A:"), vec!["A:1", "A:2"]);
    }

    #[tokio::test]
    async fn unrepresentable_ttl_is_an_error() {
        let cache = MemoryCache::new();
        let err = cache
            .set("k", "v".into(), Duration::from_secs(u64::MAX))
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Command(_)));
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn cleanup_removes_expired() {
        let cache = MemoryCache::new();
        cache.set("dead", "v".into(), Duration::ZERO).await.unwrap();
        cache
            .set("alive", "v".into(), Duration::from_secs(60))
            .await
            .unwrap();
        cache.cleanup();
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn json_helpers_round_trip_and_tolerate_garbage() {
        let cache = MemoryCache::new();
        cache
            .set_json("n", &vec![1, 2, 3], Duration::from_secs(60))
            .await
            .unwrap();
        let back: Option<Vec<i32>> = cache.get_json("n").await.unwrap();
        assert_eq!(back, Some(vec![1, 2, 3]));

        cache
            .set("bad", "{not json".into(), Duration::from_secs(60))
            .await
            .unwrap();
        let bad: Option<Vec<i32>> = cache.get_json("bad").await.unwrap();
        assert!(bad.is_none());
    }

    #[tokio::test]
    async fn cleanup_task_stops_on_cancel() {
        let cache = Arc::new(MemoryCache::new());
        let shutdown = CancellationToken::new();
        let handle = cache.spawn_cleanup_task(Duration::from_millis(10), shutdown.clone());
        shutdown.cancel();
        handle.await.unwrap();
    }
}
