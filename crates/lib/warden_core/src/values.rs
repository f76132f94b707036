//! Validated value objects.
//!
//! Each type is obtained only through its fallible `parse` constructor, so a
//! value in hand is always valid. Equality is by value. Constructors report a
//! single [`InvalidValue`]; callers that validate several fields collect the
//! failures with [`collect_errors`] instead of stopping at the first one.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum email length (RFC 5321 path limit).
pub const MAX_EMAIL_LENGTH: usize = 254;

/// Maximum length of a person's display name.
pub const MAX_NAME_LENGTH: usize = 100;

/// Maximum length of a department/role/permission name.
pub const MAX_ENTITY_NAME_LENGTH: usize = 100;

/// Maximum length of free-text descriptions.
pub const MAX_DESCRIPTION_LENGTH: usize = 500;

/// Phone numbers carry between 7 and 15 digits (E.164).
const MIN_PHONE_DIGITS: usize = 7;
const MAX_PHONE_DIGITS: usize = 15;

// The pattern is a constant, so failure here is a programming error.
static EMAIL_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9.!#$%&'*+/=?^_`{|}~-]+@[a-z0-9](?:[a-z0-9-]{0,61}[a-z0-9])?(?:\.[a-z0-9](?:[a-z0-9-]{0,61}[a-z0-9])?)+$")
        .expect("EMAIL_REGEX is a valid regex pattern")
});

/// A single field that failed validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{field}: {message}")]
pub struct InvalidValue {
    pub field: &'static str,
    pub message: String,
}

impl InvalidValue {
    pub fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

/// Flatten the failures of several independent validations into strings.
pub fn collect_errors<I>(failures: I) -> Vec<String>
where
    I: IntoIterator<Item = Option<InvalidValue>>,
{
    failures
        .into_iter()
        .flatten()
        .map(|e| e.to_string())
        .collect()
}

// ---------------------------------------------------------------------------
// Email
// ---------------------------------------------------------------------------

/// Normalized (trimmed, lower-cased) email address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Email(String);

impl Email {
    pub fn parse(raw: &str) -> Result<Self, InvalidValue> {
        let normalized = raw.trim().to_lowercase();
        if normalized.is_empty() {
            return Err(InvalidValue::new("email", "Email is required"));
        }
        if normalized.len() > MAX_EMAIL_LENGTH {
            return Err(InvalidValue::new(
                "email",
                format!("Email must be at most {MAX_EMAIL_LENGTH} characters"),
            ));
        }
        if !EMAIL_REGEX.is_match(&normalized) {
            return Err(InvalidValue::new("email", "Email format is invalid"));
        }
        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Email {
    type Error = InvalidValue;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Email> for String {
    fn from(value: Email) -> Self {
        value.0
    }
}

impl fmt::Display for Email {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Person name
// ---------------------------------------------------------------------------

/// A user's display name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PersonName(String);

impl PersonName {
    pub fn parse(raw: &str) -> Result<Self, InvalidValue> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(InvalidValue::new("fullName", "Full name is required"));
        }
        if trimmed.chars().count() > MAX_NAME_LENGTH {
            return Err(InvalidValue::new(
                "fullName",
                format!("Full name must be at most {MAX_NAME_LENGTH} characters"),
            ));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for PersonName {
    type Error = InvalidValue;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<PersonName> for String {
    fn from(value: PersonName) -> Self {
        value.0
    }
}

impl fmt::Display for PersonName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Phone
// ---------------------------------------------------------------------------

/// Phone number normalized to an optional `+` followed by digits.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Phone(String);

impl Phone {
    pub fn parse(raw: &str) -> Result<Self, InvalidValue> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(InvalidValue::new("phone", "Phone number is required"));
        }
        let (plus, rest) = match trimmed.strip_prefix('+') {
            Some(rest) => (true, rest),
            None => (false, trimmed),
        };
        let mut digits = String::with_capacity(rest.len());
        for c in rest.chars() {
            match c {
                '0'..='9' => digits.push(c),
                ' ' | '-' | '.' | '(' | ')' => {}
                _ => {
                    return Err(InvalidValue::new(
                        "phone",
                        "Phone number may only contain digits and separators",
                    ));
                }
            }
        }
        if !(MIN_PHONE_DIGITS..=MAX_PHONE_DIGITS).contains(&digits.len()) {
            return Err(InvalidValue::new(
                "phone",
                format!(
                    "Phone number must have between {MIN_PHONE_DIGITS} and {MAX_PHONE_DIGITS} digits"
                ),
            ));
        }
        Ok(Self(if plus { format!("+{digits}") } else { digits }))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Phone {
    type Error = InvalidValue;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Phone> for String {
    fn from(value: Phone) -> Self {
        value.0
    }
}

// ---------------------------------------------------------------------------
// Entity name / description
// ---------------------------------------------------------------------------

/// Name of a department, role or permission.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntityName(String);

impl EntityName {
    pub fn parse(raw: &str) -> Result<Self, InvalidValue> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(InvalidValue::new("name", "Name is required"));
        }
        if trimmed.chars().count() > MAX_ENTITY_NAME_LENGTH {
            return Err(InvalidValue::new(
                "name",
                format!("Name must be at most {MAX_ENTITY_NAME_LENGTH} characters"),
            ));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for EntityName {
    type Error = InvalidValue;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<EntityName> for String {
    fn from(value: EntityName) -> Self {
        value.0
    }
}

impl fmt::Display for EntityName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Check an optional free-text field against a length limit.
pub fn bounded_text(
    field: &'static str,
    raw: Option<&str>,
    max: usize,
) -> Result<Option<String>, InvalidValue> {
    match raw.map(str::trim) {
        None | Some("") => Ok(None),
        Some(text) if text.chars().count() > max => Err(InvalidValue::new(
            field,
            format!("{field} must be at most {max} characters"),
        )),
        Some(text) => Ok(Some(text.to_string())),
    }
}
