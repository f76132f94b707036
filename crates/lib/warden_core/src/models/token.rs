//! Token domain models: refresh token rows, JWT claims and cache records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::uuid::uuidv7;

/// Refresh token record stored in the database.
///
/// Only the SHA-256 digest of the token is persisted; the raw value leaves
/// the service once, in the issued bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct RefreshToken {
    pub id: Uuid,
    pub user_id: Uuid,
    pub token_hash: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
    /// Reason recorded at revocation (`logout`, `rotated`, free text...).
    pub revoked_by: Option<String>,
}

impl RefreshToken {
    pub fn issue(user_id: Uuid, token_hash: String, expires_at: DateTime<Utc>) -> Self {
        Self {
            id: uuidv7(),
            user_id,
            token_hash,
            created_at: Utc::now(),
            expires_at,
            revoked_at: None,
            revoked_by: None,
        }
    }

    pub fn is_revoked(&self) -> bool {
        self.revoked_at.is_some()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        !self.is_revoked() && !self.is_expired(now)
    }

    /// Only rows that are both revoked and expired may be physically deleted.
    pub fn is_reapable(&self, now: DateTime<Utc>) -> bool {
        self.is_revoked() && self.expires_at < now
    }
}

/// JWT claims embedded in access tokens.
///
/// Only identity and roles are carried; permissions are resolved per request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessClaims {
    /// Subject — user ID.
    pub sub: String,
    /// Display name.
    pub name: String,
    pub email: String,
    /// One entry per role held in the active department.
    #[serde(rename = "role", default)]
    pub roles: Vec<String>,
    pub iss: String,
    pub aud: String,
    /// Issued at (unix timestamp).
    pub iat: i64,
    /// Expiry (unix timestamp).
    pub exp: i64,
    /// Unique token id.
    pub jti: String,
}

impl AccessClaims {
    pub fn user_id(&self) -> Option<Uuid> {
        Uuid::parse_str(&self.sub).ok()
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.exp, 0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    Access,
    Refresh,
}

/// Blacklist marker stored under `TokenBlacklist:{hash}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlacklistEntry {
    pub blacklisted: bool,
    pub blacklisted_at: DateTime<Utc>,
    pub reason: Option<String>,
    pub token_type: TokenType,
}

/// Refresh token metadata mirrored under `RefreshToken:{token}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshTokenMirror {
    pub user_id: Uuid,
    pub email: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// One entry of the per-user `UserRefreshTokens:{userId}` list, used to find
/// mirror keys when only digests are stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MirroredRefreshToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// Active department pointer stored under `UserActiveDepartment:{userId}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveDepartmentEntry {
    pub department_id: Uuid,
    pub updated_at: DateTime<Utc>,
}

/// User summary returned with a token pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthUser {
    pub id: Uuid,
    pub email: String,
    pub name: String,
    pub roles: Vec<String>,
    pub department_id: Uuid,
}

/// Access + refresh token pair, also cached under `AccessToken:{email}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenBundle {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    /// Access token lifetime in seconds.
    pub expires_in: i64,
    pub access_expires_at: DateTime<Utc>,
    pub refresh_expires_at: DateTime<Utc>,
    pub user: AuthUser,
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    #[test]
    fn expired_but_unrevoked_is_not_reapable() {
        let now = Utc::now();
        let token = RefreshToken::issue(uuidv7(), "t".into(), now - Duration::days(400));
        assert!(token.is_expired(now));
        assert!(!token.is_reapable(now));
    }

    #[test]
    fn revoked_and_expired_is_reapable() {
        let now = Utc::now();
        let mut token = RefreshToken::issue(uuidv7(), "t".into(), now - Duration::seconds(1));
        token.revoked_at = Some(now - Duration::days(1));
        assert!(token.is_reapable(now));
    }

    #[test]
    fn revoked_but_live_is_not_reapable() {
        let now = Utc::now();
        let mut token = RefreshToken::issue(uuidv7(), "t".into(), now + Duration::days(1));
        token.revoked_at = Some(now);
        assert!(!token.is_active(now));
        assert!(!token.is_reapable(now));
    }
}
