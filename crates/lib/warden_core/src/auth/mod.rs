//! Credentials, token issuance and the token lifecycle.

pub mod credentials;
pub mod jwt;
pub mod lifecycle;
pub mod password;
pub mod reaper;
pub mod tokens;

use uuid::Uuid;

use crate::error::{CoreError, CoreResult};

pub use credentials::{CredentialService, ProfileUpdate, Registration};
pub use jwt::JwtSigner;
pub use lifecycle::TokenLifecycle;
pub use password::HashedPassword;
pub use reaper::Reaper;
pub use tokens::{BlockOutcome, TokenService};

/// Identity of whoever issued the current request.
///
/// Built once per request by the transport layer and passed explicitly to
/// every operation that needs it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallerContext {
    /// Authenticated user, if the bearer token verified.
    pub user_id: Option<Uuid>,
    /// Raw bearer token as presented.
    pub bearer_token: Option<String>,
}

impl CallerContext {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn authenticated(user_id: Uuid, bearer_token: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id),
            bearer_token: Some(bearer_token.into()),
        }
    }

    /// The caller's user id, or `Unauthorized` for anonymous callers.
    pub fn require_user(&self) -> CoreResult<Uuid> {
        self.user_id
            .ok_or_else(|| CoreError::Unauthorized("Authentication required".into()))
    }
}
