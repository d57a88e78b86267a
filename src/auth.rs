//! Accounts, passwords and bearer tokens.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqlitePool;
use thiserror::Error;

use crate::clock::Clock;
use crate::db;

pub const TOKEN_LIFETIME_DAYS: i64 = 7;
pub const DEFAULT_HASH_COST: u32 = 10;
pub const GOOGLE_TOKENINFO_URL: &str = "https://oauth2.googleapis.com/tokeninfo";

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("{0}")]
    Validation(String),

    #[error("Email exists")]
    EmailTaken,

    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Missing bearer token")]
    MissingToken,

    #[error("Invalid or expired token")]
    InvalidToken,

    #[error("{0}")]
    ExternalRejected(String),

    #[error("Google sign-in is not configured")]
    ExternalNotConfigured,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
    pub full_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalLoginRequest {
    #[serde(default)]
    pub id_token: Option<String>,
}

/// The caller behind a valid bearer token.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthUser {
    pub id: i64,
    pub email: String,
}

fn is_valid_email(email: &str) -> bool {
    if email.len() > 190 || email.chars().any(char::is_whitespace) {
        return false;
    }
    match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.contains('@')
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
        }
        None => false,
    }
}

impl RegisterRequest {
    pub fn validate(&self) -> Result<(), AuthError> {
        if !is_valid_email(self.email.trim()) {
            return Err(AuthError::Validation("Invalid email".to_string()));
        }
        let password_len = self.password.chars().count();
        if !(6..=100).contains(&password_len) {
            return Err(AuthError::Validation(
                "Password must be between 6 and 100 characters".to_string(),
            ));
        }
        let name_len = self.full_name.trim().chars().count();
        if !(3..=190).contains(&name_len) {
            return Err(AuthError::Validation(
                "Full name must be between 3 and 190 characters".to_string(),
            ));
        }
        Ok(())
    }
}

impl LoginRequest {
    pub fn validate(&self) -> Result<(), AuthError> {
        if !is_valid_email(self.email.trim()) {
            return Err(AuthError::Validation("Invalid email".to_string()));
        }
        if self.password.is_empty() {
            return Err(AuthError::Validation("Password is required".to_string()));
        }
        Ok(())
    }
}

/// JWT claims carried by bearer tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub email: String,
    pub iat: i64,
    pub exp: i64,
}

/// Signs and verifies HS256 bearer tokens.
#[derive(Clone)]
pub struct JwtKeys {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    lifetime: Duration,
}

impl std::fmt::Debug for JwtKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtKeys")
            .field("lifetime", &self.lifetime)
            .finish_non_exhaustive()
    }
}

impl JwtKeys {
    pub fn new(secret: &str) -> Self {
        JwtKeys {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            lifetime: Duration::days(TOKEN_LIFETIME_DAYS),
        }
    }

    pub fn with_lifetime(mut self, lifetime: Duration) -> Self {
        self.lifetime = lifetime;
        self
    }

    pub fn issue(&self, user_id: i64, email: &str) -> Result<String, AuthError> {
        // Expiry is checked against the wall clock by the decoder, so issue
        // against it too.
        let now = Utc::now();
        let claims = Claims {
            sub: user_id.to_string(),
            email: email.to_string(),
            iat: now.timestamp(),
            exp: (now + self.lifetime).timestamp(),
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .context("Failed to sign token")
            .map_err(AuthError::Internal)
    }

    pub fn verify(&self, token: &str) -> Result<AuthUser, AuthError> {
        let data = decode::<Claims>(token, &self.decoding_key, &Validation::new(Algorithm::HS256))
            .map_err(|_| AuthError::InvalidToken)?;

        let id = data.claims.sub.parse::<i64>().map_err(|_| AuthError::InvalidToken)?;
        Ok(AuthUser {
            id,
            email: data.claims.email,
        })
    }
}

/// Pulls the token out of an `Authorization: Bearer <token>` header value.
pub fn bearer_token(header: Option<&str>) -> Result<&str, AuthError> {
    let value = header.ok_or(AuthError::MissingToken)?.trim();
    let (scheme, token) = value.split_once(' ').ok_or(AuthError::MissingToken)?;
    let token = token.trim();
    if !scheme.eq_ignore_ascii_case("bearer") || token.is_empty() {
        return Err(AuthError::MissingToken);
    }
    Ok(token)
}

async fn hash_password(plain: String, cost: u32) -> anyhow::Result<String> {
    tokio::task::spawn_blocking(move || bcrypt::hash(plain, cost))
        .await
        .context("Password hashing task failed")?
        .context("Failed to hash password")
}

async fn verify_password(plain: String, hash: String) -> anyhow::Result<bool> {
    tokio::task::spawn_blocking(move || bcrypt::verify(plain, &hash))
        .await
        .context("Password verification task failed")?
        .context("Failed to verify password")
}

fn random_password() -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(32)
        .map(char::from)
        .collect()
}

/// An identity vouched for by a third party.
#[derive(Debug, Clone, PartialEq)]
pub struct ExternalIdentity {
    pub email: String,
    pub name: Option<String>,
}

#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    async fn verify(&self, id_token: &str) -> Result<ExternalIdentity, AuthError>;
}

#[derive(Debug, Deserialize)]
struct TokenInfo {
    aud: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    email_verified: Option<serde_json::Value>,
    #[serde(default)]
    name: Option<String>,
}

/// Verifies Google ID tokens against the `tokeninfo` endpoint.
#[derive(Debug, Clone)]
pub struct GoogleVerifier {
    http: reqwest::Client,
    client_id: String,
    endpoint: String,
}

impl GoogleVerifier {
    pub fn new(client_id: impl Into<String>) -> Self {
        GoogleVerifier {
            http: reqwest::Client::new(),
            client_id: client_id.into(),
            endpoint: GOOGLE_TOKENINFO_URL.to_string(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }
}

#[async_trait]
impl IdentityVerifier for GoogleVerifier {
    async fn verify(&self, id_token: &str) -> Result<ExternalIdentity, AuthError> {
        let res = self
            .http
            .get(&self.endpoint)
            .query(&[("id_token", id_token)])
            .send()
            .await
            .context("Failed to reach Google tokeninfo")?;

        if !res.status().is_success() {
            return Err(AuthError::ExternalRejected("Invalid Google token".to_string()));
        }

        let info = res
            .json::<TokenInfo>()
            .await
            .context("Unexpected tokeninfo response")?;

        if info.aud != self.client_id {
            return Err(AuthError::ExternalRejected("Invalid Google token".to_string()));
        }

        let unverified = match &info.email_verified {
            Some(serde_json::Value::Bool(b)) => !b,
            Some(serde_json::Value::String(s)) => s != "true",
            _ => false,
        };
        if unverified {
            return Err(AuthError::ExternalRejected("Google email is not verified".to_string()));
        }

        let email = info
            .email
            .ok_or_else(|| AuthError::Validation("Google account has no email".to_string()))?;

        Ok(ExternalIdentity {
            email,
            name: info.name,
        })
    }
}

#[derive(Clone)]
pub struct AuthService {
    pool: SqlitePool,
    keys: JwtKeys,
    verifier: Option<Arc<dyn IdentityVerifier>>,
    clock: Arc<dyn Clock>,
    hash_cost: u32,
}

impl AuthService {
    pub fn new(pool: SqlitePool, keys: JwtKeys, clock: Arc<dyn Clock>) -> Self {
        AuthService {
            pool,
            keys,
            verifier: None,
            clock,
            hash_cost: DEFAULT_HASH_COST,
        }
    }

    pub fn with_verifier(mut self, verifier: Arc<dyn IdentityVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    pub fn with_hash_cost(mut self, cost: u32) -> Self {
        self.hash_cost = cost;
        self
    }

    #[tracing::instrument(skip(self, req), fields(email = %req.email))]
    pub async fn register(&self, req: &RegisterRequest) -> Result<i64, AuthError> {
        req.validate()?;
        let email = req.email.trim();

        if db::read_user_by_email(&self.pool, email).await?.is_some() {
            return Err(AuthError::EmailTaken);
        }

        let hash = hash_password(req.password.clone(), self.hash_cost).await?;
        let id = db::write_user(
            &self.pool,
            email,
            &hash,
            req.full_name.trim(),
            self.clock.now().timestamp(),
        )
        .await?
        .ok_or(AuthError::EmailTaken)?;

        tracing::info!(user_id = id, "user registered");
        Ok(id)
    }

    #[tracing::instrument(skip(self, req), fields(email = %req.email))]
    pub async fn login(&self, req: &LoginRequest) -> Result<String, AuthError> {
        req.validate()?;

        let user = db::read_user_by_email(&self.pool, req.email.trim())
            .await?
            .ok_or(AuthError::InvalidCredentials)?;

        if !verify_password(req.password.clone(), user.password_hash.clone()).await? {
            return Err(AuthError::InvalidCredentials);
        }

        self.keys.issue(user.id, &user.email)
    }

    /// Signs in with a third-party ID token, creating the account on first use.
    #[tracing::instrument(skip(self, id_token))]
    pub async fn sign_in_external(&self, id_token: &str) -> Result<String, AuthError> {
        let verifier = self.verifier.as_ref().ok_or(AuthError::ExternalNotConfigured)?;
        if id_token.trim().is_empty() {
            return Err(AuthError::Validation("idToken is required".to_string()));
        }

        let identity = verifier.verify(id_token.trim()).await?;

        let user_id = match db::read_user_by_email(&self.pool, &identity.email).await? {
            Some(user) => user.id,
            None => self.provision(&identity).await?,
        };

        self.keys.issue(user_id, &identity.email)
    }

    async fn provision(&self, identity: &ExternalIdentity) -> Result<i64, AuthError> {
        // Nobody knows this password, so the account is only reachable through
        // the external sign-in.
        let hash = hash_password(random_password(), self.hash_cost).await?;
        let name = identity.name.clone().unwrap_or_default();

        match db::write_user(
            &self.pool,
            &identity.email,
            &hash,
            &name,
            self.clock.now().timestamp(),
        )
        .await?
        {
            Some(id) => {
                tracing::info!(user_id = id, "user provisioned from external identity");
                Ok(id)
            }
            // Lost a race with a concurrent first sign-in.
            None => db::read_user_by_email(&self.pool, &identity.email)
                .await?
                .map(|user| user.id)
                .context("User vanished after email conflict")
                .map_err(AuthError::Internal),
        }
    }

    pub fn authenticate(&self, authorization: Option<&str>) -> Result<AuthUser, AuthError> {
        let token = bearer_token(authorization)?;
        self.keys.verify(token)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::db::tests::setup_test_db;
    use anyhow::Result;
    use fake::faker::internet::en::SafeEmail;
    use fake::faker::name::en::Name;
    use fake::Fake;

    pub(crate) const TEST_SECRET: &str = "test-secret-key-must-be-long-enough-for-security";

    pub(crate) struct StaticVerifier(pub Option<ExternalIdentity>);

    #[async_trait]
    impl IdentityVerifier for StaticVerifier {
        async fn verify(&self, _id_token: &str) -> Result<ExternalIdentity, AuthError> {
            self.0
                .clone()
                .ok_or_else(|| AuthError::ExternalRejected("Invalid Google token".to_string()))
        }
    }

    pub(crate) fn test_service(pool: SqlitePool) -> AuthService {
        AuthService::new(pool, JwtKeys::new(TEST_SECRET), Arc::new(SystemClock)).with_hash_cost(4)
    }

    fn fake_registration() -> RegisterRequest {
        RegisterRequest {
            email: SafeEmail().fake(),
            password: "correct horse".to_string(),
            full_name: format!("{} Jr", Name().fake::<String>()),
        }
    }

    #[tokio::test]
    async fn test_register_then_login() -> Result<()> {
        let auth = test_service(setup_test_db().await?);
        let req = fake_registration();

        let id = auth.register(&req).await?;
        let token = auth
            .login(&LoginRequest {
                email: req.email.clone(),
                password: req.password.clone(),
            })
            .await?;

        let user = auth.authenticate(Some(&format!("Bearer {}", token)))?;
        assert_eq!(user, AuthUser { id, email: req.email });

        Ok(())
    }

    #[tokio::test]
    async fn test_password_is_not_stored_in_plain_text() -> Result<()> {
        let pool = setup_test_db().await?;
        let auth = test_service(pool.clone());
        let req = fake_registration();

        let id = auth.register(&req).await?;
        let user = db::read_user(&pool, id).await?.unwrap();
        assert_ne!(user.password_hash, req.password);
        assert!(bcrypt::verify(&req.password, &user.password_hash)?);

        Ok(())
    }

    #[tokio::test]
    async fn test_register_duplicate_email() -> Result<()> {
        let auth = test_service(setup_test_db().await?);
        let req = fake_registration();

        auth.register(&req).await?;
        assert!(matches!(auth.register(&req).await, Err(AuthError::EmailTaken)));

        Ok(())
    }

    #[tokio::test]
    async fn test_login_wrong_password() -> Result<()> {
        let auth = test_service(setup_test_db().await?);
        let req = fake_registration();
        auth.register(&req).await?;

        let res = auth
            .login(&LoginRequest {
                email: req.email.clone(),
                password: "wrong password".to_string(),
            })
            .await;
        assert!(matches!(res, Err(AuthError::InvalidCredentials)));

        let res = auth
            .login(&LoginRequest {
                email: "nobody@example.com".to_string(),
                password: req.password.clone(),
            })
            .await;
        assert!(matches!(res, Err(AuthError::InvalidCredentials)));

        Ok(())
    }

    #[tokio::test]
    async fn test_register_validation() -> Result<()> {
        let auth = test_service(setup_test_db().await?);

        let mut req = fake_registration();
        req.email = "not-an-email".to_string();
        assert!(matches!(auth.register(&req).await, Err(AuthError::Validation(_))));

        let mut req = fake_registration();
        req.password = "short".to_string();
        assert!(matches!(auth.register(&req).await, Err(AuthError::Validation(_))));

        let mut req = fake_registration();
        req.full_name = "Al".to_string();
        assert!(matches!(auth.register(&req).await, Err(AuthError::Validation(_))));

        Ok(())
    }

    #[tokio::test]
    async fn test_external_sign_in_provisions_once() -> Result<()> {
        let pool = setup_test_db().await?;
        let identity = ExternalIdentity {
            email: "grace@example.com".to_string(),
            name: Some("Grace Hopper".to_string()),
        };
        let auth = test_service(pool.clone())
            .with_verifier(Arc::new(StaticVerifier(Some(identity.clone()))));

        let first = auth.authenticate(Some(&format!("Bearer {}", auth.sign_in_external("tok").await?)))?;
        let second = auth.authenticate(Some(&format!("Bearer {}", auth.sign_in_external("tok").await?)))?;
        assert_eq!(first.id, second.id);

        let user = db::read_user(&pool, first.id).await?.unwrap();
        assert_eq!(user.full_name, "Grace Hopper");

        // The account gets a random local password, so a guessed one is refused.
        let res = auth
            .login(&LoginRequest {
                email: identity.email.clone(),
                password: "hunter22".to_string(),
            })
            .await;
        assert!(matches!(res, Err(AuthError::InvalidCredentials)));

        Ok(())
    }

    #[tokio::test]
    async fn test_external_sign_in_maps_existing_user() -> Result<()> {
        let pool = setup_test_db().await?;
        let req = fake_registration();
        let identity = ExternalIdentity {
            email: req.email.clone(),
            name: None,
        };
        let auth = test_service(pool).with_verifier(Arc::new(StaticVerifier(Some(identity))));

        let id = auth.register(&req).await?;
        let token = auth.sign_in_external("tok").await?;
        assert_eq!(auth.authenticate(Some(&format!("Bearer {}", token)))?.id, id);

        Ok(())
    }

    #[tokio::test]
    async fn test_external_sign_in_errors() -> Result<()> {
        let pool = setup_test_db().await?;

        let unconfigured = test_service(pool.clone());
        assert!(matches!(
            unconfigured.sign_in_external("tok").await,
            Err(AuthError::ExternalNotConfigured)
        ));

        let rejecting = test_service(pool).with_verifier(Arc::new(StaticVerifier(None)));
        assert!(matches!(
            rejecting.sign_in_external("tok").await,
            Err(AuthError::ExternalRejected(_))
        ));
        assert!(matches!(
            rejecting.sign_in_external("  ").await,
            Err(AuthError::Validation(_))
        ));

        Ok(())
    }

    #[tokio::test]
    async fn test_google_verifier() -> Result<()> {
        use std::collections::HashMap;
        use warp::http::StatusCode;
        use warp::Filter;

        let tokeninfo = warp::path("tokeninfo")
            .and(warp::query::<HashMap<String, String>>())
            .map(|q: HashMap<String, String>| {
                let (body, status) = match q.get("id_token").map(String::as_str) {
                    Some("good") => (
                        serde_json::json!({
                            "aud": "client-1",
                            "email": "ada@example.com",
                            "email_verified": "true",
                            "name": "Ada Lovelace",
                        }),
                        StatusCode::OK,
                    ),
                    Some("wrong-audience") => (
                        serde_json::json!({ "aud": "client-2", "email": "ada@example.com" }),
                        StatusCode::OK,
                    ),
                    Some("no-email") => (serde_json::json!({ "aud": "client-1" }), StatusCode::OK),
                    _ => (
                        serde_json::json!({ "error": "invalid_token" }),
                        StatusCode::BAD_REQUEST,
                    ),
                };
                warp::reply::with_status(warp::reply::json(&body), status)
            });

        let (addr, server) = warp::serve(tokeninfo).bind_ephemeral(([127, 0, 0, 1], 0));
        tokio::spawn(server);

        let verifier =
            GoogleVerifier::new("client-1").with_endpoint(format!("http://{}/tokeninfo", addr));

        assert_eq!(
            verifier.verify("good").await?,
            ExternalIdentity {
                email: "ada@example.com".to_string(),
                name: Some("Ada Lovelace".to_string()),
            }
        );
        assert!(matches!(
            verifier.verify("wrong-audience").await,
            Err(AuthError::ExternalRejected(_))
        ));
        assert!(matches!(
            verifier.verify("no-email").await,
            Err(AuthError::Validation(_))
        ));
        assert!(matches!(
            verifier.verify("expired").await,
            Err(AuthError::ExternalRejected(_))
        ));

        Ok(())
    }

    #[test]
    fn test_token_round_trip_and_tampering() {
        let keys = JwtKeys::new(TEST_SECRET);
        let token = keys.issue(42, "ada@example.com").unwrap();

        assert_eq!(
            keys.verify(&token).unwrap(),
            AuthUser {
                id: 42,
                email: "ada@example.com".to_string()
            }
        );

        let other = JwtKeys::new("a-completely-different-secret-value");
        assert!(matches!(other.verify(&token), Err(AuthError::InvalidToken)));
        assert!(matches!(keys.verify("garbage"), Err(AuthError::InvalidToken)));
    }

    #[test]
    fn test_expired_token() {
        let keys = JwtKeys::new(TEST_SECRET).with_lifetime(Duration::hours(-2));
        let token = keys.issue(1, "ada@example.com").unwrap();
        assert!(matches!(keys.verify(&token), Err(AuthError::InvalidToken)));
    }

    #[test]
    fn test_bearer_token() {
        assert_eq!(bearer_token(Some("Bearer abc")).unwrap(), "abc");
        assert_eq!(bearer_token(Some("bearer  abc ")).unwrap(), "abc");
        assert!(bearer_token(None).is_err());
        assert!(bearer_token(Some("Basic abc")).is_err());
        assert!(bearer_token(Some("Bearer")).is_err());
        assert!(bearer_token(Some("Bearer ")).is_err());
    }

    #[test]
    fn test_email_validation() {
        assert!(is_valid_email("ada@example.com"));
        assert!(!is_valid_email("ada@example"));
        assert!(!is_valid_email("@example.com"));
        assert!(!is_valid_email("ada @example.com"));
        assert!(!is_valid_email("ada@@example.com"));
        assert!(!is_valid_email(&format!("{}@example.com", "a".repeat(190))));
    }
}
