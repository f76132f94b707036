//! Token and cache configuration.

use std::path::PathBuf;
use std::time::Duration;

use rand::distr::Alphanumeric;
use rand::{Rng, rng};
use tracing::{info, warn};

/// Access token lifetime: 15 minutes.
pub const DEFAULT_ACCESS_TOKEN_TTL_SECS: u64 = 15 * 60;

/// Refresh token lifetime: 30 days.
pub const DEFAULT_REFRESH_TOKEN_TTL_DAYS: u64 = 30;

/// Identity and active-department cache lifetime: 30 minutes.
pub const DEFAULT_USER_CACHE_TTL_SECS: u64 = 30 * 60;

/// Permission bucket lifetime: 5 minutes.
pub const DEFAULT_PERMISSION_CACHE_TTL_SECS: u64 = 5 * 60;

/// Reaper sweep interval: 1 hour.
pub const DEFAULT_REAPER_INTERVAL_SECS: u64 = 60 * 60;

/// Upper bound for any configured lifetime or interval: 10 years.
pub const MAX_LIFETIME_SECS: u64 = 10 * 365 * SECS_PER_DAY;

const SECS_PER_DAY: u64 = 24 * 60 * 60;

const DEFAULT_ISSUER: &str = "warden";
const DEFAULT_AUDIENCE: &str = "warden-clients";

/// Settings shared by the token, credential and permission services.
#[derive(Clone)]
pub struct AuthConfig {
    /// HS256 signing secret.
    pub jwt_secret: String,
    pub issuer: String,
    pub audience: String,
    pub access_token_ttl: Duration,
    pub refresh_token_ttl: Duration,
    pub user_cache_ttl: Duration,
    pub permission_cache_ttl: Duration,
    pub reaper_interval: Duration,
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("jwt_secret", &"<redacted>")
            .field("issuer", &self.issuer)
            .field("audience", &self.audience)
            .field("access_token_ttl", &self.access_token_ttl)
            .field("refresh_token_ttl", &self.refresh_token_ttl)
            .field("user_cache_ttl", &self.user_cache_ttl)
            .field("permission_cache_ttl", &self.permission_cache_ttl)
            .field("reaper_interval", &self.reaper_interval)
            .finish()
    }
}

impl AuthConfig {
    /// Defaults with an explicit secret.
    pub fn with_secret(secret: impl Into<String>) -> Self {
        Self {
            jwt_secret: secret.into(),
            issuer: DEFAULT_ISSUER.into(),
            audience: DEFAULT_AUDIENCE.into(),
            access_token_ttl: Duration::from_secs(DEFAULT_ACCESS_TOKEN_TTL_SECS),
            refresh_token_ttl: Duration::from_secs(DEFAULT_REFRESH_TOKEN_TTL_DAYS * SECS_PER_DAY),
            user_cache_ttl: Duration::from_secs(DEFAULT_USER_CACHE_TTL_SECS),
            permission_cache_ttl: Duration::from_secs(DEFAULT_PERMISSION_CACHE_TTL_SECS),
            reaper_interval: Duration::from_secs(DEFAULT_REAPER_INTERVAL_SECS),
        }
    }

    /// Reads configuration from environment variables.
    ///
    /// | Variable                     | Default                       |
    /// |------------------------------|-------------------------------|
    /// | `JWT_SECRET` / `AUTH_SECRET` | generated & persisted to file |
    /// | `JWT_ISSUER`                 | `warden`                      |
    /// | `JWT_AUDIENCE`               | `warden-clients`              |
    /// | `ACCESS_TOKEN_TTL_SECS`      | `900`                         |
    /// | `REFRESH_TOKEN_TTL_DAYS`     | `30`                          |
    /// | `USER_CACHE_TTL_SECS`        | `1800`                        |
    /// | `PERMISSION_CACHE_TTL_SECS`  | `300`                         |
    /// | `TOKEN_REAPER_INTERVAL_SECS` | `3600`                        |
    pub fn from_env() -> Self {
        let mut config = Self::with_secret(resolve_jwt_secret());
        if let Ok(issuer) = std::env::var("JWT_ISSUER")
            && !issuer.is_empty()
        {
            config.issuer = issuer;
        }
        if let Ok(audience) = std::env::var("JWT_AUDIENCE")
            && !audience.is_empty()
        {
            config.audience = audience;
        }
        config.access_token_ttl = Duration::from_secs(env_secs(
            "ACCESS_TOKEN_TTL_SECS",
            DEFAULT_ACCESS_TOKEN_TTL_SECS,
            1,
        ));
        config.refresh_token_ttl = Duration::from_secs(env_secs(
            "REFRESH_TOKEN_TTL_DAYS",
            DEFAULT_REFRESH_TOKEN_TTL_DAYS,
            SECS_PER_DAY,
        ));
        config.user_cache_ttl = Duration::from_secs(env_secs(
            "USER_CACHE_TTL_SECS",
            DEFAULT_USER_CACHE_TTL_SECS,
            1,
        ));
        config.permission_cache_ttl = Duration::from_secs(env_secs(
            "PERMISSION_CACHE_TTL_SECS",
            DEFAULT_PERMISSION_CACHE_TTL_SECS,
            1,
        ));
        config.reaper_interval = Duration::from_secs(env_secs(
            "TOKEN_REAPER_INTERVAL_SECS",
            DEFAULT_REAPER_INTERVAL_SECS,
            1,
        ));
        config
    }
}

/// Reads a positive duration given in multiples of `unit_secs`; returns seconds.
///
/// Zero, unparsable and out-of-range values fall back to `default` with a
/// warning.
fn env_secs(name: &str, default: u64, unit_secs: u64) -> u64 {
    let fallback = default * unit_secs;
    let Ok(raw) = std::env::var(name) else {
        return fallback;
    };
    parse_secs(&raw, unit_secs).unwrap_or_else(|| {
        warn!(var = name, value = %raw, max_secs = MAX_LIFETIME_SECS, "ignoring invalid setting");
        fallback
    })
}

fn parse_secs(raw: &str, unit_secs: u64) -> Option<u64> {
    let units: u64 = raw.trim().parse().ok()?;
    let secs = units.checked_mul(unit_secs)?;
    (1..=MAX_LIFETIME_SECS).contains(&secs).then_some(secs)
}

/// Resolve the JWT secret: env var `JWT_SECRET` → `AUTH_SECRET` → persisted file.
pub fn resolve_jwt_secret() -> String {
    for var in ["JWT_SECRET", "AUTH_SECRET"] {
        if let Ok(secret) = std::env::var(var)
            && !secret.is_empty()
        {
            return secret;
        }
    }
    let secret_path = jwt_secret_path();
    if let Ok(existing) = std::fs::read_to_string(&secret_path) {
        let trimmed = existing.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }
    let secret: String = rng()
        .sample_iter(&Alphanumeric)
        .take(64)
        .map(char::from)
        .collect();
    if let Some(parent) = secret_path.parent()
        && let Err(e) = std::fs::create_dir_all(parent)
    {
        warn!(path = %parent.display(), error = %e, "cannot create secret directory");
    }
    match std::fs::write(&secret_path, &secret) {
        Ok(()) => info!(path = %secret_path.display(), "generated new JWT secret"),
        Err(e) => warn!(error = %e, "JWT secret not persisted; tokens will not survive restart"),
    }
    secret
}

fn jwt_secret_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("warden")
        .join("jwt-secret")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_lifetimes() {
        let config = AuthConfig::with_secret("s");
        assert_eq!(config.access_token_ttl, Duration::from_secs(900));
        assert_eq!(config.refresh_token_ttl, Duration::from_secs(30 * 86_400));
        assert_eq!(config.user_cache_ttl, Duration::from_secs(1800));
        assert_eq!(config.permission_cache_ttl, Duration::from_secs(300));
    }

    #[test]
    fn debug_redacts_secret() {
        let config = AuthConfig::with_secret("super-secret-value");
        assert!(!format!("{config:?}").contains("super-secret-value"));
    }

    #[test]
    fn missing_var_uses_default() {
        assert_eq!(env_secs("WARDEN_TEST_SURELY_UNSET_VAR", 2, 60), 120);
    }

    #[test]
    fn zero_and_overflowing_durations_are_rejected() {
        assert_eq!(parse_secs("0", 1), None);
        assert_eq!(parse_secs("-5", 1), None);
        assert_eq!(parse_secs("abc", 1), None);
        assert_eq!(parse_secs(&u64::MAX.to_string(), SECS_PER_DAY), None);
        assert_eq!(parse_secs(&(MAX_LIFETIME_SECS + 1).to_string(), 1), None);
        assert_eq!(parse_secs(" 30 ", SECS_PER_DAY), Some(30 * 86_400));
        assert_eq!(parse_secs("1", 1), Some(1));
    }
}
