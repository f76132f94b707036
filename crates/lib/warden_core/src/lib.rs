//! # warden_core
//!
//! Core domain logic for Warden: department-scoped RBAC, credentials and the
//! token lifecycle, over pluggable store and cache adapters.

pub mod auth;
pub mod cache;
pub mod config;
pub mod error;
pub mod models;
pub mod rbac;
pub mod services;
pub mod store;
pub mod uuid;
pub mod values;

pub use auth::CallerContext;
pub use config::AuthConfig;
pub use error::{CoreError, CoreResult, ErrorKind};
pub use services::Services;

/// Returns the crate version.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
