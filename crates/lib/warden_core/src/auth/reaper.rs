//! Periodic deletion of refresh token rows that are revoked and expired.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::CoreResult;
use crate::store::TokenStore;

/// Shortest sweep period; `tokio::time::interval` rejects zero.
const MIN_INTERVAL: Duration = Duration::from_secs(1);

pub struct Reaper {
    store: Arc<dyn TokenStore>,
    interval: Duration,
}

impl Reaper {
    pub fn new(store: Arc<dyn TokenStore>, interval: Duration) -> Self {
        if interval < MIN_INTERVAL {
            warn!(?interval, "reaper interval raised to the minimum");
        }
        Self {
            store,
            interval: interval.max(MIN_INTERVAL),
        }
    }

    /// Delete every reapable row once. Unrevoked rows are never touched,
    /// however old.
    pub async fn sweep_once(&self) -> CoreResult<u64> {
        let deleted = self.store.delete_reapable_refresh_tokens(Utc::now()).await?;
        if deleted > 0 {
            info!(deleted, "reaped refresh tokens");
        } else {
            debug!("no refresh tokens to reap");
        }
        Ok(deleted)
    }

    /// Sweep on every tick until `cancel` fires. A failed sweep is logged and
    /// retried on the next tick.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(interval_secs = self.interval.as_secs(), "token reaper started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep_once().await {
                        warn!(error = %e, "token reaper sweep failed");
                    }
                }
            }
        }
        info!("token reaper stopped");
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }
}
