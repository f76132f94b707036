//! API server configuration.

/// Configuration for the API server process.
#[derive(Clone, Debug)]
pub struct ApiConfig {
    /// Address to bind the HTTP listener (e.g. "127.0.0.1:3100").
    pub bind_addr: String,
    /// PostgreSQL connection URL.
    pub database_url: String,
    /// Redis URL; the in-process cache is used when absent.
    pub redis_url: Option<String>,
}

impl ApiConfig {
    /// Reads configuration from environment variables with sensible defaults.
    ///
    /// | Variable       | Default                            |
    /// |----------------|------------------------------------|
    /// | `BIND_ADDR`    | `127.0.0.1:3100`                   |
    /// | `DATABASE_URL` | `postgres://localhost:5432/warden` |
    /// | `REDIS_URL`    | unset (in-process cache)           |
    pub fn from_env() -> Self {
        Self {
            bind_addr: std::env::var("BIND_ADDR").unwrap_or_else(|_| "127.0.0.1:3100".into()),
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgres://localhost:5432/warden".into()),
            redis_url: std::env::var("REDIS_URL").ok().filter(|url| !url.is_empty()),
        }
    }
}
