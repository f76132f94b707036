//! Redis-backed cache (`redis` feature).

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;

use super::{Cache, CacheError, CacheResult};

/// Cache over a shared multiplexed Redis connection.
#[derive(Clone)]
pub struct RedisCache {
    conn: MultiplexedConnection,
}

impl std::fmt::Debug for RedisCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCache").finish_non_exhaustive()
    }
}

impl RedisCache {
    /// Connect to `redis_url` (e.g. `redis://localhost:6379`).
    pub async fn connect(redis_url: impl AsRef<str>) -> CacheResult<Self> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| CacheError::Connection(e.to_string()))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| CacheError::Connection(e.to_string()))?;
        Ok(Self { conn })
    }
}

fn command_error(e: redis::RedisError) -> CacheError {
    CacheError::Command(e.to_string())
}

#[async_trait]
impl Cache for RedisCache {
    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        let mut conn = self.conn.clone();
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(command_error)
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> CacheResult<()> {
        // Redis rejects EX 0; an already-expired entry is simply not written.
        let secs = ttl.as_secs();
        if secs == 0 {
            return self.remove(key).await;
        }
        let mut conn = self.conn.clone();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(secs)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(command_error)
    }

    async fn remove(&self, key: &str) -> CacheResult<()> {
        let mut conn = self.conn.clone();
        redis::cmd("DEL")
            .arg(key)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(command_error)
    }

    async fn exists(&self, key: &str) -> CacheResult<bool> {
        let mut conn = self.conn.clone();
        redis::cmd("EXISTS")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(command_error)
    }
}
