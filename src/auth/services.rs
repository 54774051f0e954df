use std::sync::Arc;

use tokio::sync::OnceCell;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::auth::{
    claims::TokenClaims,
    dto::{AuthResponse, NewUser, PublicUser},
    error::{AuthError, CredentialFault},
    jwt::TokenIssuer,
    password::PasswordHasher,
    repo::UserStore,
    repo_types::{NewUserRecord, StoreError, User},
};

/// Profile keys that would shadow record fields once flattened.
const RESERVED_PROFILE_KEYS: &[&str] = &["id", "email", "password", "password_hash", "created_at"];

/// Hashed once and compared against on unknown-email logins, so a miss costs
/// the same hash work as a wrong password.
const DECOY_PASSWORD: &str = "credvault-decoy-password";

/// Creates accounts, checks credentials and issues tokens.
///
/// Beyond its collaborators it only caches the decoy hash, so one instance
/// is shared across all requests.
#[derive(Clone)]
pub struct CredentialAuthority {
    store: Arc<dyn UserStore>,
    issuer: Arc<dyn TokenIssuer>,
    hasher: Arc<dyn PasswordHasher>,
    decoy_hash: Arc<OnceCell<String>>,
}

impl CredentialAuthority {
    pub fn new(
        store: Arc<dyn UserStore>,
        issuer: Arc<dyn TokenIssuer>,
        hasher: Arc<dyn PasswordHasher>,
    ) -> Self {
        Self {
            store,
            issuer,
            hasher,
            decoy_hash: Arc::new(OnceCell::new()),
        }
    }

    #[instrument(skip(self, candidate), fields(email = %candidate.email))]
    pub async fn enroll(&self, candidate: NewUser) -> Result<PublicUser, AuthError> {
        let NewUser {
            email,
            password,
            mut profile,
        } = candidate;
        if password.is_empty() {
            warn!("enroll without password");
            return Err(AuthError::EmptyPassword);
        }
        profile.retain(|k, _| !RESERVED_PROFILE_KEYS.contains(&k.as_str()));

        let password_hash = self.hash_password(password).await?;
        let record = NewUserRecord {
            email: email.clone(),
            password_hash,
            profile,
        };

        let user = match self.store.insert(record).await {
            Ok(u) => u,
            Err(StoreError::DuplicateKey { .. }) => {
                warn!("email already registered");
                return Err(AuthError::DuplicateEmail(email));
            }
            Err(StoreError::Backend(e)) => {
                error!(error = %e, "insert user failed");
                return Err(AuthError::StorageFailure);
            }
        };

        info!(user_id = %user.id, "user enrolled");
        Ok(user.into())
    }

    #[instrument(skip(self, candidate), fields(email = %candidate.email))]
    pub async fn register(&self, candidate: NewUser) -> Result<AuthResponse, AuthError> {
        let user = self.enroll(candidate).await?;
        let token = self.issue_token(TokenClaims { id: user.id })?;
        Ok(AuthResponse { user, token })
    }

    #[instrument(skip(self, password))]
    pub async fn authenticate(&self, email: &str, password: &str) -> Result<AuthResponse, AuthError> {
        let user = match self.store.find_by_email(email).await {
            Ok(Some(u)) => u,
            Ok(None) => {
                self.burn_verify(password).await;
                warn!(reason = %CredentialFault::Email, "login rejected");
                return Err(AuthError::InvalidCredentials(CredentialFault::Email));
            }
            Err(e) => {
                error!(error = %e, "find_by_email failed");
                return Err(AuthError::StorageFailure);
            }
        };

        if !self.verify_password(password, &user.password_hash).await? {
            warn!(user_id = %user.id, reason = %CredentialFault::Password, "login rejected");
            return Err(AuthError::InvalidCredentials(CredentialFault::Password));
        }

        let token = self.issue_token(TokenClaims { id: user.id })?;
        info!(user_id = %user.id, "user logged in");
        Ok(AuthResponse {
            user: user.into(),
            token,
        })
    }

    /// Full stored records, hash included. `User` never serializes the hash,
    /// but in-process callers must not forward these as-is.
    #[instrument(skip(self))]
    pub async fn list_users(&self) -> Result<Vec<User>, AuthError> {
        self.store.find_all().await.map_err(|e| {
            error!(error = %e, "find_all failed");
            AuthError::StorageFailure
        })
    }

    #[instrument(skip(self))]
    pub async fn find_by_id(&self, id: Uuid) -> Result<PublicUser, AuthError> {
        match self.store.find_by_id(id).await {
            Ok(Some(u)) => Ok(u.into()),
            Ok(None) => Err(AuthError::NotFound(id)),
            Err(e) => {
                error!(error = %e, "find_by_id failed");
                Err(AuthError::StorageFailure)
            }
        }
    }

    pub fn issue_token(&self, claims: TokenClaims) -> Result<String, AuthError> {
        self.issuer.sign(&claims).map_err(|e| {
            error!(error = %e, user_id = %claims.id, "token signing failed");
            AuthError::Internal
        })
    }

    async fn hash_password(&self, password: String) -> Result<String, AuthError> {
        let hasher = self.hasher.clone();
        tokio::task::spawn_blocking(move || hasher.hash(&password))
            .await
            .map_err(|e| {
                error!(error = %e, "hash task failed");
                AuthError::Internal
            })?
            .map_err(|e| {
                error!(error = %e, "hash_password failed");
                AuthError::Internal
            })
    }

    /// Runs a full comparison against the decoy hash and discards the result.
    async fn burn_verify(&self, password: &str) {
        let decoy = self
            .decoy_hash
            .get_or_try_init(|| self.hash_password(DECOY_PASSWORD.to_owned()))
            .await;
        match decoy {
            Ok(hash) => {
                let _ = self.verify_password(password, hash).await;
            }
            Err(e) => debug!(error = %e, "decoy hash unavailable"),
        }
    }

    async fn verify_password(&self, password: &str, hash: &str) -> Result<bool, AuthError> {
        let hasher = self.hasher.clone();
        let (password, hash) = (password.to_owned(), hash.to_owned());
        tokio::task::spawn_blocking(move || hasher.verify(&password, &hash))
            .await
            .map_err(|e| {
                error!(error = %e, "verify task failed");
                AuthError::Internal
            })?
            .map_err(|e| {
                error!(error = %e, "verify_password failed");
                AuthError::Internal
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        auth::{
            jwt::JwtKeys,
            memory::MemoryUserStore,
            password::{BcryptHasher, HashScheme, SchemeHasher},
        },
        config::JwtConfig,
    };
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn keys() -> JwtKeys {
        JwtKeys::from_config(&JwtConfig {
            secret: "test-secret".into(),
            issuer: "test-issuer".into(),
            audience: "test-aud".into(),
            ttl_minutes: 5,
        })
    }

    fn authority_with(store: Arc<dyn UserStore>) -> CredentialAuthority {
        CredentialAuthority::new(store, Arc::new(keys()), Arc::new(BcryptHasher::new(4)))
    }

    fn authority() -> (CredentialAuthority, Arc<MemoryUserStore>) {
        let store = Arc::new(MemoryUserStore::new());
        (authority_with(store.clone()), store)
    }

    struct BrokenStore;

    #[async_trait]
    impl UserStore for BrokenStore {
        async fn insert(&self, _record: NewUserRecord) -> Result<User, StoreError> {
            Err(anyhow::anyhow!("connection reset by peer").into())
        }
        async fn find_by_email(&self, _email: &str) -> Result<Option<User>, StoreError> {
            Err(anyhow::anyhow!("connection reset by peer").into())
        }
        async fn find_by_id(&self, _id: Uuid) -> Result<Option<User>, StoreError> {
            Err(anyhow::anyhow!("connection reset by peer").into())
        }
        async fn find_all(&self) -> Result<Vec<User>, StoreError> {
            Err(anyhow::anyhow!("connection reset by peer").into())
        }
    }

    /// Counts comparisons so tests can see the hash work a login does.
    #[derive(Default)]
    struct CountingHasher {
        inner: BcryptHasher,
        verifies: AtomicUsize,
    }

    impl PasswordHasher for CountingHasher {
        fn hash(&self, plain: &str) -> anyhow::Result<String> {
            self.inner.hash(plain)
        }
        fn verify(&self, plain: &str, hash: &str) -> anyhow::Result<bool> {
            self.verifies.fetch_add(1, Ordering::SeqCst);
            self.inner.verify(plain, hash)
        }
    }

    struct FailingIssuer;

    impl TokenIssuer for FailingIssuer {
        fn sign(&self, _claims: &TokenClaims) -> anyhow::Result<String> {
            anyhow::bail!("signer offline")
        }
    }

    #[tokio::test]
    async fn enroll_then_login_scenario() {
        let (auth, _) = authority();

        let user = auth
            .enroll(NewUser::new("a@x.com", "secret1"))
            .await
            .expect("enroll");
        assert_eq!(user.email, "a@x.com");
        let json = serde_json::to_value(&user).unwrap();
        assert!(json.get("password").is_none());
        assert!(json.get("password_hash").is_none());

        let login = auth.authenticate("a@x.com", "secret1").await.expect("login");
        assert_eq!(login.user.id, user.id);
        assert!(!login.token.is_empty());

        let err = auth.authenticate("a@x.com", "wrong").await.unwrap_err();
        assert!(matches!(
            err,
            AuthError::InvalidCredentials(CredentialFault::Password)
        ));

        let err = auth
            .enroll(NewUser::new("a@x.com", "other"))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::DuplicateEmail(ref e) if e == "a@x.com"));
    }

    #[tokio::test]
    async fn duplicate_enroll_leaves_one_record() {
        let (auth, store) = authority();
        auth.enroll(NewUser::new("dup@x.com", "pw-one")).await.unwrap();
        let err = auth.enroll(NewUser::new("dup@x.com", "pw-two")).await.unwrap_err();
        assert!(matches!(err, AuthError::DuplicateEmail(_)));
        assert_eq!(store.len().await, 1);
        // the first password still wins
        assert!(auth.authenticate("dup@x.com", "pw-one").await.is_ok());
    }

    #[tokio::test]
    async fn unknown_email_is_an_email_fault() {
        let (auth, _) = authority();
        let err = auth.authenticate("nobody@x.com", "secret1").await.unwrap_err();
        assert!(matches!(
            err,
            AuthError::InvalidCredentials(CredentialFault::Email)
        ));
    }

    #[tokio::test]
    async fn empty_password_is_rejected_before_storage() {
        let (auth, store) = authority();
        let err = auth.enroll(NewUser::new("a@x.com", "")).await.unwrap_err();
        assert!(matches!(err, AuthError::EmptyPassword));
        assert_eq!(store.len().await, 0);
    }

    #[tokio::test]
    async fn stored_hash_is_not_the_plaintext() {
        let (auth, store) = authority();
        let user = auth.enroll(NewUser::new("a@x.com", "secret1")).await.unwrap();
        let stored = store.find_by_id(user.id).await.unwrap().unwrap();
        assert_ne!(stored.password_hash, "secret1");
        assert!(BcryptHasher::new(4).verify("secret1", &stored.password_hash).unwrap());
    }

    #[tokio::test]
    async fn profile_fields_pass_through_without_reserved_keys() {
        let (auth, _) = authority();
        let candidate = NewUser::new("a@x.com", "secret1")
            .with_field("name", "Ada")
            .with_field("password_hash", "not-really-a-hash")
            .with_field("id", "forged");
        let user = auth.enroll(candidate).await.unwrap();
        assert_eq!(user.profile.get("name"), Some(&json!("Ada")));
        assert!(!user.profile.contains_key("password_hash"));
        assert!(!user.profile.contains_key("id"));

        let json = serde_json::to_value(&user).unwrap();
        assert_eq!(json["id"], json!(user.id));
        assert!(json.get("password_hash").is_none());
    }

    #[tokio::test]
    async fn register_issues_token_for_new_user() {
        let (auth, _) = authority();
        let res = auth
            .register(NewUser::new("new@x.com", "secret1"))
            .await
            .unwrap();
        let claims = keys().verify(&res.token).expect("token verifies");
        assert_eq!(claims.id, res.user.id);
    }

    #[tokio::test]
    async fn register_fails_without_token_on_duplicate() {
        let (auth, _) = authority();
        auth.register(NewUser::new("a@x.com", "secret1")).await.unwrap();
        let err = auth
            .register(NewUser::new("a@x.com", "secret2"))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::DuplicateEmail(_)));
    }

    #[tokio::test]
    async fn login_token_is_bound_to_user() {
        let (auth, _) = authority();
        let user = auth.enroll(NewUser::new("a@x.com", "secret1")).await.unwrap();
        let res = auth.authenticate("a@x.com", "secret1").await.unwrap();
        assert_eq!(keys().verify(&res.token).unwrap().id, user.id);
    }

    #[tokio::test]
    async fn find_by_id_strips_hash_and_misses_are_not_found() {
        let (auth, _) = authority();
        let user = auth.enroll(NewUser::new("a@x.com", "secret1")).await.unwrap();
        let found = auth.find_by_id(user.id).await.unwrap();
        assert_eq!(found, user);

        let missing = Uuid::new_v4();
        let err = auth.find_by_id(missing).await.unwrap_err();
        assert!(matches!(err, AuthError::NotFound(id) if id == missing));
    }

    #[tokio::test]
    async fn list_users_returns_stored_records() {
        let (auth, _) = authority();
        auth.enroll(NewUser::new("a@x.com", "secret1")).await.unwrap();
        auth.enroll(NewUser::new("b@x.com", "secret2")).await.unwrap();
        let users = auth.list_users().await.unwrap();
        assert_eq!(users.len(), 2);
        assert!(users.iter().all(|u| !u.password_hash.is_empty()));
        let json = serde_json::to_string(&users).unwrap();
        assert!(!json.contains("password_hash"));
    }

    #[tokio::test]
    async fn backend_failures_become_opaque_storage_failure() {
        let auth = authority_with(Arc::new(BrokenStore));
        let err = auth.enroll(NewUser::new("a@x.com", "secret1")).await.unwrap_err();
        assert!(matches!(err, AuthError::StorageFailure));
        assert!(!err.to_string().contains("connection reset"));

        let err = auth.authenticate("a@x.com", "secret1").await.unwrap_err();
        assert!(matches!(err, AuthError::StorageFailure));
        assert!(matches!(
            auth.find_by_id(Uuid::new_v4()).await.unwrap_err(),
            AuthError::StorageFailure
        ));
        assert!(matches!(
            auth.list_users().await.unwrap_err(),
            AuthError::StorageFailure
        ));
    }

    #[tokio::test]
    async fn signing_failure_is_internal() {
        let store = Arc::new(MemoryUserStore::new());
        let auth = CredentialAuthority::new(
            store.clone(),
            Arc::new(FailingIssuer),
            Arc::new(BcryptHasher::new(4)),
        );
        let err = auth
            .register(NewUser::new("a@x.com", "secret1"))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Internal));
        // enroll already committed; only the token is missing
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn concurrent_logins_all_succeed() {
        let (auth, _) = authority();
        auth.enroll(NewUser::new("a@x.com", "secret1")).await.unwrap();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let auth = auth.clone();
                tokio::spawn(async move { auth.authenticate("a@x.com", "secret1").await })
            })
            .collect();
        for h in handles {
            assert!(h.await.unwrap().is_ok());
        }
    }

    #[tokio::test]
    async fn switching_hash_scheme_keeps_existing_logins() {
        let store: Arc<dyn UserStore> = Arc::new(MemoryUserStore::new());
        let before = CredentialAuthority::new(
            store.clone(),
            Arc::new(keys()),
            Arc::new(SchemeHasher::new(HashScheme::Bcrypt, 4)),
        );
        let user = before.enroll(NewUser::new("a@x.com", "secret1")).await.unwrap();

        let after = CredentialAuthority::new(
            store,
            Arc::new(keys()),
            Arc::new(SchemeHasher::new(HashScheme::Argon2, 4)),
        );
        let res = after.authenticate("a@x.com", "secret1").await.expect("old bcrypt login");
        assert_eq!(res.user.id, user.id);
        assert!(matches!(
            after.authenticate("a@x.com", "wrong").await.unwrap_err(),
            AuthError::InvalidCredentials(CredentialFault::Password)
        ));

        // new accounts pick up the new scheme and stay verifiable
        after.enroll(NewUser::new("b@x.com", "secret2")).await.unwrap();
        assert!(after.authenticate("b@x.com", "secret2").await.is_ok());
    }

    #[tokio::test]
    async fn unknown_email_still_runs_a_comparison() {
        let hasher = Arc::new(CountingHasher {
            inner: BcryptHasher::new(4),
            ..Default::default()
        });
        let auth = CredentialAuthority::new(
            Arc::new(MemoryUserStore::new()),
            Arc::new(keys()),
            hasher.clone(),
        );

        for _ in 0..2 {
            let err = auth.authenticate("nobody@x.com", "secret1").await.unwrap_err();
            assert!(matches!(
                err,
                AuthError::InvalidCredentials(CredentialFault::Email)
            ));
        }
        assert_eq!(hasher.verifies.load(Ordering::SeqCst), 2);
    }
}
