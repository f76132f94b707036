//! Password policy and salted bcrypt hashing.
//!
//! A [`HashedPassword`] is the (hash, salt) pair persisted for a user. The salt
//! is generated per user and stored next to the hash; verification recomputes
//! the hash with that salt and compares in constant time.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bcrypt::Version;
use rand::{Rng, rng};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::values::InvalidValue;

/// bcrypt cost factor.
const BCRYPT_COST: u32 = 10;

/// Minimum password length.
pub const MIN_PASSWORD_LENGTH: usize = 8;

/// bcrypt only reads the first 72 bytes.
pub const MAX_PASSWORD_LENGTH: usize = 72;

/// Check a plaintext password against the complexity policy.
///
/// Returns the first problem found; each problem names the `password` field
/// so it can be aggregated with other field errors.
pub fn check_policy(field: &'static str, plain: &str) -> Result<(), InvalidValue> {
    if plain.len() < MIN_PASSWORD_LENGTH {
        return Err(InvalidValue::new(
            field,
            format!("Password must be at least {MIN_PASSWORD_LENGTH} characters"),
        ));
    }
    if plain.len() > MAX_PASSWORD_LENGTH {
        return Err(InvalidValue::new(
            field,
            format!("Password must be at most {MAX_PASSWORD_LENGTH} bytes"),
        ));
    }
    if !plain.chars().any(|c| c.is_ascii_uppercase()) {
        return Err(InvalidValue::new(
            field,
            "Password must contain at least one uppercase letter",
        ));
    }
    if !plain.chars().any(|c| c.is_ascii_lowercase()) {
        return Err(InvalidValue::new(
            field,
            "Password must contain at least one lowercase letter",
        ));
    }
    if !plain.chars().any(|c| c.is_ascii_digit()) {
        return Err(InvalidValue::new(
            field,
            "Password must contain at least one digit",
        ));
    }
    Ok(())
}

/// Salted password hash.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashedPassword {
    hash: String,
    salt: String,
}

impl std::fmt::Debug for HashedPassword {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("HashedPassword(..)")
    }
}

impl HashedPassword {
    /// Hash `plain` with a freshly generated salt.
    ///
    /// CPU bound; async callers should use [`HashedPassword::create_blocking`].
    pub fn create(plain: &str) -> CoreResult<Self> {
        let mut salt = [0u8; 16];
        rng().fill(&mut salt);
        let hash = hash_with(plain, BCRYPT_COST, salt)?;
        Ok(Self {
            hash,
            salt: STANDARD.encode(salt),
        })
    }

    /// Hash on the blocking pool so request tasks are not stalled.
    pub async fn create_blocking(plain: String) -> CoreResult<Self> {
        tokio::task::spawn_blocking(move || Self::create(&plain))
            .await
            .map_err(|e| CoreError::Hashing(format!("hash task: {e}")))?
    }

    /// Rebuild a pair loaded from persistence.
    pub fn from_stored(hash: String, salt: String) -> Self {
        Self { hash, salt }
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn salt(&self) -> &str {
        &self.salt
    }

    /// Recompute the hash of `candidate` with the stored salt and compare.
    pub fn verify(&self, candidate: &str) -> bool {
        let Some(salt) = self.decoded_salt() else {
            return false;
        };
        let cost = self.cost().unwrap_or(BCRYPT_COST);
        match hash_with(candidate, cost, salt) {
            Ok(recomputed) => constant_time_eq(recomputed.as_bytes(), self.hash.as_bytes()),
            Err(_) => false,
        }
    }

    pub async fn verify_blocking(&self, candidate: String) -> CoreResult<bool> {
        let stored = self.clone();
        tokio::task::spawn_blocking(move || stored.verify(&candidate))
            .await
            .map_err(|e| CoreError::Hashing(format!("verify task: {e}")))
    }

    fn decoded_salt(&self) -> Option<[u8; 16]> {
        let bytes = STANDARD.decode(&self.salt).ok()?;
        bytes.try_into().ok()
    }

    // `$2b$10$...` carries the cost in bytes 4..6.
    fn cost(&self) -> Option<u32> {
        self.hash.get(4..6)?.parse().ok()
    }
}

fn hash_with(plain: &str, cost: u32, salt: [u8; 16]) -> CoreResult<String> {
    bcrypt::hash_with_salt(plain, cost, salt)
        .map(|parts| parts.format_for_version(Version::TwoB))
        .map_err(|e| CoreError::Hashing(format!("bcrypt hash: {e}")))
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
