//! Error taxonomy shared by every core service.
//!
//! Business failures (validation, missing references, duplicates, auth) are
//! ordinary variants that callers branch on. Adapter failures (store, cache,
//! hashing, signing) are folded into the same enum but classified as
//! internal, so the API boundary can hide their details.

use thiserror::Error;

use crate::cache::CacheError;
use crate::store::StoreError;

/// Result type used across the core.
pub type CoreResult<T> = Result<T, CoreError>;

/// Coarse classification of a [`CoreError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    Unauthorized,
    Unimplemented,
    Internal,
}

/// Core service errors.
#[derive(Debug, Error)]
pub enum CoreError {
    /// One or more field-level problems, always reported together.
    #[error("Validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("Not Exist: {0}")]
    NotFound(String),

    #[error("Exists: {0}")]
    AlreadyExists(String),

    #[error("Already Assigned: {0}")]
    AlreadyAssigned(String),

    #[error("Already Blocked: token is already blocked")]
    AlreadyBlocked,

    /// The entity is still referenced and cannot be removed.
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Auth: {0}")]
    Unauthorized(String),

    #[error("User has no valid department.")]
    NoValidDepartment,

    #[error("No roles in active department")]
    NoRolesInDepartment,

    #[error("Not implemented: {0}")]
    Unimplemented(&'static str),

    #[error("An error occurred during logout")]
    Logout,

    #[error("Token error: {0}")]
    Token(String),

    #[error("Password hashing error: {0}")]
    Hashing(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    pub fn validation(errors: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self::Validation(errors.into_iter().map(Into::into).collect())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn invalid_credentials() -> Self {
        Self::Unauthorized("Invalid credentials".into())
    }

    /// Classify the error for the result envelope.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::Validation(_) => ErrorKind::Validation,
            CoreError::NotFound(_) => ErrorKind::NotFound,
            CoreError::AlreadyExists(_)
            | CoreError::AlreadyAssigned(_)
            | CoreError::AlreadyBlocked
            | CoreError::Conflict(_) => ErrorKind::Conflict,
            CoreError::Unauthorized(_)
            | CoreError::NoValidDepartment
            | CoreError::NoRolesInDepartment => ErrorKind::Unauthorized,
            CoreError::Unimplemented(_) => ErrorKind::Unimplemented,
            CoreError::Store(StoreError::UniqueViolation(_)) => ErrorKind::Conflict,
            CoreError::Logout
            | CoreError::Token(_)
            | CoreError::Hashing(_)
            | CoreError::Store(_)
            | CoreError::Cache(_)
            | CoreError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Short title shown in the result envelope.
    pub fn title(&self) -> &'static str {
        match self {
            CoreError::Validation(_) => "Validation",
            CoreError::NotFound(_) => "Not Exist",
            CoreError::AlreadyExists(_) => "Exists",
            CoreError::AlreadyAssigned(_) => "Already Assigned",
            CoreError::AlreadyBlocked => "Already Blocked",
            CoreError::Conflict(_) | CoreError::Store(StoreError::UniqueViolation(_)) => {
                "Conflict"
            }
            CoreError::Unauthorized(_) => "Auth",
            CoreError::NoValidDepartment | CoreError::NoRolesInDepartment => "Department",
            CoreError::Unimplemented(_) => "Unimplemented",
            CoreError::Logout => "Logout",
            _ => "Internal",
        }
    }

    /// Message safe to show to the caller.
    ///
    /// Internal errors never leak their details.
    pub fn public_message(&self) -> String {
        match self {
            CoreError::Validation(_) => "One or more fields are invalid".into(),
            CoreError::NotFound(m)
            | CoreError::AlreadyExists(m)
            | CoreError::AlreadyAssigned(m)
            | CoreError::Conflict(m)
            | CoreError::Unauthorized(m) => m.clone(),
            CoreError::AlreadyBlocked => "Token is already blocked".into(),
            CoreError::NoValidDepartment
            | CoreError::NoRolesInDepartment
            | CoreError::Unimplemented(_)
            | CoreError::Logout => self.to_string(),
            CoreError::Store(StoreError::UniqueViolation(_)) => {
                "A conflicting record already exists".into()
            }
            _ => "An unexpected error occurred".into(),
        }
    }

    /// Field-level error strings, only populated for validation failures.
    pub fn field_errors(&self) -> &[String] {
        match self {
            CoreError::Validation(errors) => errors,
            _ => &[],
        }
    }
}
