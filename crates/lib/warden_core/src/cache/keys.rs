//! Cache key scheme.
//!
//! Prefixes are part of the external contract; other services read these
//! entries directly.

use sha2::{Digest, Sha256};
use uuid::Uuid;

pub fn user(user_id: Uuid) -> String {
    format!("User:{user_id}")
}

pub fn user_email(email: &str) -> String {
    format!("UserEmail:{email}")
}

pub fn active_department(user_id: Uuid) -> String {
    format!("UserActiveDepartment:{user_id}")
}

pub fn access_token(email: &str) -> String {
    format!("AccessToken:{email}")
}

pub fn refresh_token(token: &str) -> String {
    format!("RefreshToken:{token}")
}

/// Raw refresh tokens this process mirrored for a user.
pub fn user_refresh_tokens(user_id: Uuid) -> String {
    format!("UserRefreshTokens:{user_id}")
}

/// Blacklist entries are keyed by the SHA-256 hex digest of the raw token.
pub fn token_blacklist(token: &str) -> String {
    token_blacklist_digest(&token_digest(token))
}

/// Blacklist key for an already computed [`token_digest`].
pub fn token_blacklist_digest(digest: &str) -> String {
    format!("TokenBlacklist:{digest}")
}

pub fn role_permissions(role_id: Uuid, department_id: Uuid) -> String {
    format!("RolePermissions:{role_id}:{department_id}")
}

pub fn user_permissions(user_id: Uuid, department_id: Uuid) -> String {
    format!("UserPermissions:{user_id}:{department_id}")
}

pub fn department_permissions(department_id: Uuid) -> String {
    format!("DepartmentPermissions:{department_id}")
}

/// Lowercase hex SHA-256 of a token; also the stored form of refresh tokens.
pub fn token_digest(token: &str) -> String {
    let hash = Sha256::digest(token.as_bytes());
    hash.iter().map(|b| format!("{b:02x}")).collect()
}
