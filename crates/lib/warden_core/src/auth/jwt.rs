//! JWT access token signing and verification (HS256).

use std::time::Duration;

use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use rand::distr::Alphanumeric;
use rand::{Rng, rng};

use crate::config::AuthConfig;
use crate::error::{CoreError, CoreResult};
use crate::models::AccessClaims;
use crate::uuid::uuidv7;

/// Refresh tokens are 64 alphanumeric characters.
pub const REFRESH_TOKEN_LENGTH: usize = 64;

/// Signs and verifies access tokens with one shared secret.
#[derive(Clone)]
pub struct JwtSigner {
    encoding: EncodingKey,
    decoding: DecodingKey,
    issuer: String,
    audience: String,
    ttl: Duration,
}

impl std::fmt::Debug for JwtSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtSigner")
            .field("issuer", &self.issuer)
            .field("audience", &self.audience)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl JwtSigner {
    pub fn new(config: &AuthConfig) -> Self {
        let secret = config.jwt_secret.as_bytes();
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            issuer: config.issuer.clone(),
            audience: config.audience.clone(),
            ttl: config.access_token_ttl,
        }
    }

    /// Access token lifetime.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Sign a fresh access token carrying one `role` entry per role name.
    pub fn issue(
        &self,
        user_id: &str,
        name: &str,
        email: &str,
        roles: &[String],
    ) -> CoreResult<(String, AccessClaims)> {
        let now = Utc::now();
        let expires_at = chrono::Duration::from_std(self.ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .ok_or_else(|| CoreError::Token(format!("ttl out of range: {:?}", self.ttl)))?;
        let claims = AccessClaims {
            sub: user_id.to_string(),
            name: name.to_string(),
            email: email.to_string(),
            roles: roles.to_vec(),
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
            jti: uuidv7().to_string(),
        };
        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| CoreError::Token(format!("jwt encode: {e}")))?;
        Ok((token, claims))
    }

    /// Verify signature, issuer, audience and expiry.
    pub fn verify(&self, token: &str) -> Option<AccessClaims> {
        decode::<AccessClaims>(token, &self.decoding, &self.validation(true))
            .ok()
            .map(|data| data.claims)
    }

    /// Verify everything except expiry; used when blocking a token that may
    /// already have lapsed.
    pub fn verify_ignoring_expiry(&self, token: &str) -> Option<AccessClaims> {
        decode::<AccessClaims>(token, &self.decoding, &self.validation(false))
            .ok()
            .map(|data| data.claims)
    }

    fn validation(&self, check_exp: bool) -> Validation {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = check_exp;
        validation.leeway = 0;
        validation.set_issuer(&[&self.issuer]);
        validation.set_audience(&[&self.audience]);
        validation.set_required_spec_claims(&["exp", "iss", "aud", "sub"]);
        validation
    }
}

/// Generate a cryptographically random refresh token.
pub fn generate_refresh_token() -> String {
    rng()
        .sample_iter(&Alphanumeric)
        .take(REFRESH_TOKEN_LENGTH)
        .map(char::from)
        .collect()
}

/// Whether `token` is shaped like a JWT (three dot-separated segments).
pub fn looks_like_jwt(token: &str) -> bool {
    let mut parts = token.split('.');
    matches!(
        (parts.next(), parts.next(), parts.next(), parts.next()),
        (Some(a), Some(b), Some(c), None) if !a.is_empty() && !b.is_empty() && !c.is_empty()
    )
}

/// Whether `token` is shaped like one of our refresh tokens.
pub fn looks_like_refresh_token(token: &str) -> bool {
    token.len() == REFRESH_TOKEN_LENGTH && token.bytes().all(|b| b.is_ascii_alphanumeric())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signer() -> JwtSigner {
        JwtSigner::new(&AuthConfig::with_secret("test-secret-at-least-32-bytes-long!!"))
    }

    #[test]
    fn issue_and_verify() {
        let signer = signer();
        let (token, issued) = signer
            .issue("user-1", "Alice", "alice@example.com", &["editor".into()])
            .unwrap();
        let claims = signer.verify(&token).unwrap();
        assert_eq!(claims, issued);
        assert_eq!(claims.roles, vec!["editor".to_string()]);
        assert_eq!(claims.exp - claims.iat, 900);
    }

    #[test]
    fn role_claim_is_serialized_as_role() {
        let (_, claims) = signer()
            .issue("u", "n", "e@example.com", &["a".into(), "b".into()])
            .unwrap();
        let json = serde_json::to_value(&claims).unwrap();
        assert_eq!(json["role"], serde_json::json!(["a", "b"]));
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let (token, _) = signer().issue("u", "n", "e@example.com", &[]).unwrap();
        let other = JwtSigner::new(&AuthConfig::with_secret("another-secret-entirely-different"));
        assert!(other.verify(&token).is_none());
        assert!(other.verify_ignoring_expiry(&token).is_none());
    }

    #[test]
    fn wrong_audience_is_rejected() {
        let (token, _) = signer().issue("u", "n", "e@example.com", &[]).unwrap();
        let mut config = AuthConfig::with_secret("test-secret-at-least-32-bytes-long!!");
        config.audience = "someone-else".into();
        assert!(JwtSigner::new(&config).verify(&token).is_none());
    }

    #[test]
    fn expired_token_only_passes_lenient_check() {
        let mut config = AuthConfig::with_secret("test-secret-at-least-32-bytes-long!!");
        config.access_token_ttl = Duration::ZERO;
        let signer = JwtSigner::new(&config);
        let (token, _) = signer.issue("u", "n", "e@example.com", &[]).unwrap();
        std::thread::sleep(Duration::from_millis(1100));
        assert!(signer.verify(&token).is_none());
        assert!(signer.verify_ignoring_expiry(&token).is_some());
    }

    #[test]
    fn refresh_tokens_have_expected_shape() {
        let token = generate_refresh_token();
        assert!(looks_like_refresh_token(&token));
        assert!(!looks_like_jwt(&token));
        assert_ne!(token, generate_refresh_token());
    }

    #[test]
    fn jwt_shape_needs_three_segments() {
        assert!(looks_like_jwt("a.b.c"));
        assert!(!looks_like_jwt("a.b"));
        assert!(!looks_like_jwt("a.b.c.d"));
        assert!(!looks_like_jwt("a..c"));
    }
}
