//! The `User` aggregate and its cacheable profile snapshot.
//!
//! Role memberships are not embedded here; they live in the `UserRole`
//! relation and are resolved through explicit store queries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::password::HashedPassword;
use crate::uuid::uuidv7;
use crate::values::{Email, PersonName, Phone};

/// Optional, free-form profile fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileDetails {
    pub bio: Option<String>,
    pub location: Option<String>,
    pub picture_url: Option<String>,
}

/// Domain user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: Uuid,
    pub full_name: PersonName,
    pub email: Email,
    pub password: HashedPassword,
    pub phone: Phone,
    pub profile: ProfileDetails,
    /// The department the user currently operates in, if any.
    pub active_department_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl User {
    /// Build a new user with a generated id.
    pub fn new(
        full_name: PersonName,
        email: Email,
        password: HashedPassword,
        phone: Phone,
        profile: ProfileDetails,
    ) -> Self {
        Self {
            id: uuidv7(),
            full_name,
            email,
            password,
            phone,
            profile,
            active_department_id: None,
            created_at: Utc::now(),
        }
    }

    /// Profile view without any password material.
    pub fn snapshot(&self) -> UserProfile {
        UserProfile {
            id: self.id,
            full_name: self.full_name.as_str().to_string(),
            email: self.email.as_str().to_string(),
            phone: self.phone.as_str().to_string(),
            bio: self.profile.bio.clone(),
            location: self.profile.location.clone(),
            picture_url: self.profile.picture_url.clone(),
            active_department_id: self.active_department_id,
            created_at: self.created_at,
        }
    }
}

/// Public profile of a user, safe to cache and return to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: Uuid,
    pub full_name: String,
    pub email: String,
    pub phone: String,
    pub bio: Option<String>,
    pub location: Option<String>,
    pub picture_url: Option<String>,
    pub active_department_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}
