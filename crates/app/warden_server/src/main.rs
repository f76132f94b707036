//! Warden API server binary.
//!
//! Connects to Postgres, applies migrations, picks a cache backend, starts
//! the token reaper and serves the command API until interrupted.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use warden_api::AppState;
use warden_api::config::ApiConfig;
use warden_core::cache::{Cache, MemoryCache};
use warden_core::store::PgStore;
use warden_core::{AuthConfig, Services};

/// How often expired entries are purged from the in-process cache.
const MEMORY_CACHE_SWEEP: Duration = Duration::from_secs(60);

/// CLI arguments; each falls back to its environment variable.
#[derive(Parser, Debug)]
#[command(name = "warden_server", about = "Warden RBAC and token API server")]
struct Args {
    /// Address to bind the HTTP listener.
    #[arg(long, env = "BIND_ADDR")]
    bind_addr: Option<String>,

    /// PostgreSQL connection URL.
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Redis URL. Without it an in-process cache is used.
    #[arg(long, env = "REDIS_URL")]
    redis_url: Option<String>,

    /// Maximum number of database connections in the pool.
    #[arg(long, default_value_t = 5)]
    max_connections: u32,

    /// Skip running embedded migrations on startup.
    #[arg(long, default_value_t = false)]
    skip_migrations: bool,
}

impl Args {
    fn into_config(self) -> ApiConfig {
        let defaults = ApiConfig::from_env();
        ApiConfig {
            bind_addr: self.bind_addr.unwrap_or(defaults.bind_addr),
            database_url: self.database_url.unwrap_or(defaults.database_url),
            redis_url: self.redis_url.or(defaults.redis_url),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,warden_api=debug,warden_core=debug".into()),
        )
        .init();

    let args = Args::parse();
    let max_connections = args.max_connections;
    let skip_migrations = args.skip_migrations;
    let config = args.into_config();
    let auth = AuthConfig::from_env();
    info!(bind_addr = %config.bind_addr, ?auth, "starting warden_server");

    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(30))
        .connect(&config.database_url)
        .await?;
    let store = PgStore::new(pool);
    if !skip_migrations {
        info!("running database migrations");
        store.migrate().await?;
    }

    let shutdown = CancellationToken::new();
    let cache = build_cache(config.redis_url.as_deref(), &shutdown).await?;

    let services = Services::new(Arc::new(store), cache, auth);
    let reaper = services.reaper().spawn(shutdown.child_token());

    let app = warden_api::router(AppState::new(services));
    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!(addr = %listener.local_addr()?, "API listening");

    let signal = shutdown.clone();
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for shutdown signal");
            }
            info!("shutdown requested");
            signal.cancel();
        })
        .await;

    shutdown.cancel();
    if let Err(e) = reaper.await {
        warn!(error = %e, "token reaper task failed");
    }
    served?;
    info!("stopped");
    Ok(())
}

#[cfg(feature = "redis")]
async fn build_cache(
    redis_url: Option<&str>,
    shutdown: &CancellationToken,
) -> Result<Arc<dyn Cache>, Box<dyn std::error::Error>> {
    if let Some(url) = redis_url {
        info!("using redis cache");
        let cache = warden_core::cache::RedisCache::connect(url).await?;
        return Ok(Arc::new(cache));
    }
    Ok(memory_cache(shutdown))
}

#[cfg(not(feature = "redis"))]
async fn build_cache(
    redis_url: Option<&str>,
    shutdown: &CancellationToken,
) -> Result<Arc<dyn Cache>, Box<dyn std::error::Error>> {
    if redis_url.is_some() {
        warn!("REDIS_URL is set but redis support is not compiled in; using in-process cache");
    }
    Ok(memory_cache(shutdown))
}

fn memory_cache(shutdown: &CancellationToken) -> Arc<dyn Cache> {
    info!("using in-process cache");
    let cache = Arc::new(MemoryCache::new());
    cache.spawn_cleanup_task(MEMORY_CACHE_SWEEP, shutdown.child_token());
    cache
}
