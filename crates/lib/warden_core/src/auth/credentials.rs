//! Registration, password changes and profile maintenance.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};
use uuid::Uuid;

use super::password::{HashedPassword, check_policy};
use crate::cache::{Cache, CacheExt, keys};
use crate::error::{CoreError, CoreResult};
use crate::models::{ProfileDetails, User, UserProfile};
use crate::rbac::{CacheInvalidator, InvalidationTarget};
use crate::store::{Mutation, Store, StoreError, Transactional, UserStore};
use crate::values::{Email, InvalidValue, PersonName, Phone, bounded_text, collect_errors};

/// Maximum bio length.
pub const MAX_BIO_LENGTH: usize = 500;
/// Maximum location length.
pub const MAX_LOCATION_LENGTH: usize = 100;
/// Maximum profile picture URL length.
pub const MAX_PICTURE_URL_LENGTH: usize = 2048;

/// Raw registration input.
#[derive(Debug, Clone, Default)]
pub struct Registration {
    pub full_name: String,
    pub email: String,
    pub password: String,
    pub phone: String,
    pub bio: Option<String>,
    pub location: Option<String>,
    pub picture_url: Option<String>,
}

/// Raw profile update input. The email address is not part of it.
#[derive(Debug, Clone, Default)]
pub struct ProfileUpdate {
    pub full_name: String,
    pub phone: String,
    pub bio: Option<String>,
    pub location: Option<String>,
    pub picture_url: Option<String>,
}

fn profile_details(
    bio: Option<&str>,
    location: Option<&str>,
    picture_url: Option<&str>,
) -> Result<ProfileDetails, Vec<Option<InvalidValue>>> {
    let bio = bounded_text("bio", bio, MAX_BIO_LENGTH);
    let location = bounded_text("location", location, MAX_LOCATION_LENGTH);
    let picture = bounded_text("pictureUrl", picture_url, MAX_PICTURE_URL_LENGTH);
    match (bio, location, picture) {
        (Ok(bio), Ok(location), Ok(picture_url)) => Ok(ProfileDetails {
            bio,
            location,
            picture_url,
        }),
        (bio, location, picture) => Err(vec![bio.err(), location.err(), picture.err()]),
    }
}

pub struct CredentialService {
    store: Arc<dyn Store>,
    cache: Arc<dyn Cache>,
    invalidator: Arc<CacheInvalidator>,
    user_cache_ttl: Duration,
}

impl CredentialService {
    pub fn new(
        store: Arc<dyn Store>,
        cache: Arc<dyn Cache>,
        invalidator: Arc<CacheInvalidator>,
        user_cache_ttl: Duration,
    ) -> Self {
        Self {
            store,
            cache,
            invalidator,
            user_cache_ttl,
        }
    }

    /// Create a user. Every invalid field is reported, not just the first.
    pub async fn register(&self, input: Registration) -> CoreResult<UserProfile> {
        let full_name = PersonName::parse(&input.full_name);
        let email = Email::parse(&input.email);
        let password = check_policy("password", &input.password);
        let phone = Phone::parse(&input.phone);
        let profile = profile_details(
            input.bio.as_deref(),
            input.location.as_deref(),
            input.picture_url.as_deref(),
        );

        let (full_name, email, phone, profile) = match (full_name, email, password, phone, profile)
        {
            (Ok(full_name), Ok(email), Ok(()), Ok(phone), Ok(profile)) => {
                (full_name, email, phone, profile)
            }
            (full_name, email, password, phone, profile) => {
                let mut failures = vec![full_name.err(), email.err(), password.err(), phone.err()];
                failures.extend(profile.err().unwrap_or_default());
                return Err(CoreError::Validation(collect_errors(failures)));
            }
        };

        if self.store.email_exists(&email).await? {
            return Err(CoreError::AlreadyExists("Email already registered".into()));
        }

        let hashed = HashedPassword::create_blocking(input.password).await?;
        let user = User::new(full_name, email, hashed, phone, profile);
        self.store
            .commit(Mutation::InsertUser(user.clone()).into())
            .await
            .map_err(|e| match e {
                StoreError::UniqueViolation(_) => {
                    CoreError::AlreadyExists("Email already registered".into())
                }
                other => CoreError::Store(other),
            })?;
        info!(user_id = %user.id, email = %user.email, "user registered");
        Ok(user.snapshot())
    }

    /// Replace the password after verifying the current one.
    pub async fn change_password(
        &self,
        user_id: Uuid,
        current: &str,
        new: &str,
        confirm: &str,
    ) -> CoreResult<()> {
        let mut user = self.require_user(user_id).await?;
        if !user.password.verify_blocking(current.to_string()).await? {
            return Err(CoreError::Unauthorized("Current password is incorrect".into()));
        }

        let mismatch = (new != confirm)
            .then(|| InvalidValue::new("confirmPassword", "Passwords do not match"));
        let errors = collect_errors([check_policy("newPassword", new).err(), mismatch]);
        if !errors.is_empty() {
            return Err(CoreError::Validation(errors));
        }

        user.password = HashedPassword::create_blocking(new.to_string()).await?;
        self.store
            .commit(Mutation::UpdateUser(user.clone()).into())
            .await?;
        self.invalidate_identity(&user).await;
        info!(%user_id, "password changed");
        Ok(())
    }

    /// Re-validate and replace name, phone and the optional profile fields.
    pub async fn update_profile(
        &self,
        user_id: Uuid,
        update: ProfileUpdate,
    ) -> CoreResult<UserProfile> {
        let full_name = PersonName::parse(&update.full_name);
        let phone = Phone::parse(&update.phone);
        let profile = profile_details(
            update.bio.as_deref(),
            update.location.as_deref(),
            update.picture_url.as_deref(),
        );
        let (full_name, phone, profile) = match (full_name, phone, profile) {
            (Ok(full_name), Ok(phone), Ok(profile)) => (full_name, phone, profile),
            (full_name, phone, profile) => {
                let mut failures = vec![full_name.err(), phone.err()];
                failures.extend(profile.err().unwrap_or_default());
                return Err(CoreError::Validation(collect_errors(failures)));
            }
        };

        let mut user = self.require_user(user_id).await?;
        user.full_name = full_name;
        user.phone = phone;
        user.profile = profile;
        self.store
            .commit(Mutation::UpdateUser(user.clone()).into())
            .await?;
        self.invalidate_identity(&user).await;
        Ok(user.snapshot())
    }

    /// Email changes are not supported yet.
    pub async fn change_email(&self, _user_id: Uuid, _new_email: &str) -> CoreResult<()> {
        Err(CoreError::Unimplemented("ChangeEmail"))
    }

    /// Profile snapshot, cache first.
    pub async fn profile(&self, user_id: Uuid) -> CoreResult<UserProfile> {
        let key = keys::user(user_id);
        match self.cache.get_json::<UserProfile>(&key).await {
            Ok(Some(profile)) => return Ok(profile),
            Ok(None) => debug!(%user_id, "profile cache miss"),
            Err(e) => warn!(%user_id, error = %e, "profile cache read failed"),
        }
        let snapshot = self.require_user(user_id).await?.snapshot();
        for key in [key, keys::user_email(&snapshot.email)] {
            if let Err(e) = self.cache.set_json(&key, &snapshot, self.user_cache_ttl).await {
                warn!(%user_id, error = %e, "profile cache write failed");
            }
        }
        Ok(snapshot)
    }

    async fn require_user(&self, user_id: Uuid) -> CoreResult<User> {
        self.store
            .find_user(user_id)
            .await?
            .ok_or_else(|| CoreError::not_found("User"))
    }

    async fn invalidate_identity(&self, user: &User) {
        self.invalidator
            .invalidate(&[InvalidationTarget::UserIdentity {
                user_id: user.id,
                email: user.email.as_str().to_string(),
            }])
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::store::InMemoryStore;

    fn service() -> (Arc<InMemoryStore>, Arc<MemoryCache>, CredentialService) {
        let store = Arc::new(InMemoryStore::new());
        let cache = Arc::new(MemoryCache::new());
        let invalidator = Arc::new(CacheInvalidator::new(cache.clone()));
        let service = CredentialService::new(
            store.clone(),
            cache.clone(),
            invalidator,
            Duration::from_secs(60),
        );
        (store, cache, service)
    }

    fn alice() -> Registration {
        Registration {
            full_name: "Alice Liddell".into(),
            email: "Alice@Example.com".into(),
            password: "Secr3tPass".into(),
            phone: "+1 555 010 2030".into(),
            bio: Some("Curious".into()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn register_normalizes_and_hides_password() {
        let (store, _cache, service) = service();
        let profile = service.register(alice()).await.unwrap();
        assert_eq!(profile.email, "alice@example.com");
        assert_eq!(profile.phone, "+15550102030");

        let stored = store.find_user(profile.id).await.unwrap().unwrap();
        assert!(stored.password.verify("Secr3tPass"));
        assert!(!stored.password.verify(""));
        let json = serde_json::to_string(&profile).unwrap();
        assert!(!json.contains(stored.password.hash()));
    }

    #[tokio::test]
    async fn register_reports_all_field_errors() {
        let (_store, _cache, service) = service();
        let err = service
            .register(Registration {
                full_name: "".into(),
                email: "nope".into(),
                password: "short".into(),
                phone: "12".into(),
                bio: Some("b".repeat(MAX_BIO_LENGTH + 1)),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.field_errors().len(), 5, "{:?}", err.field_errors());
    }

    #[tokio::test]
    async fn duplicate_email_is_rejected() {
        let (_store, _cache, service) = service();
        service.register(alice()).await.unwrap();
        let mut again = alice();
        again.email = "  ALICE@example.COM ".into();
        let err = service.register(again).await.unwrap_err();
        assert!(matches!(err, CoreError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn change_password_flow() {
        let (store, _cache, service) = service();
        let profile = service.register(alice()).await.unwrap();

        let err = service
            .change_password(profile.id, "wrong", "N3wPassword", "N3wPassword")
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Unauthorized(_)));

        let err = service
            .change_password(profile.id, "Secr3tPass", "N3wPassword", "Different1")
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));

        service
            .change_password(profile.id, "Secr3tPass", "N3wPassword", "N3wPassword")
            .await
            .unwrap();
        let stored = store.find_user(profile.id).await.unwrap().unwrap();
        assert!(stored.password.verify("N3wPassword"));
        assert!(!stored.password.verify("Secr3tPass"));
    }

    #[tokio::test]
    async fn profile_is_cached_and_refreshed_after_update() {
        let (_store, cache, service) = service();
        let profile = service.register(alice()).await.unwrap();

        let first = service.profile(profile.id).await.unwrap();
        assert!(cache.exists(&keys::user(profile.id)).await.unwrap());
        assert_eq!(first.full_name, "Alice Liddell");

        let updated = service
            .update_profile(
                profile.id,
                ProfileUpdate {
                    full_name: "Alice L.".into(),
                    phone: "5550102031".into(),
                    location: Some("Oxford".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.email, "alice@example.com");
        assert!(!cache.exists(&keys::user(profile.id)).await.unwrap());
        assert_eq!(service.profile(profile.id).await.unwrap().full_name, "Alice L.");
    }

    #[tokio::test]
    async fn change_email_is_not_implemented() {
        let (_store, _cache, service) = service();
        let err = service
            .change_email(Uuid::now_v7(), "new@example.com")
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Unimplemented(_)));
    }
}
