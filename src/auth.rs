use crate::config::{AppConfig, CaptchaConfig};
use crate::errors::ApiError;
use crate::models::{Claims, User};
use crate::state::AppState;
use actix_web::dev::Payload;
use actix_web::http::header::AUTHORIZATION;
use actix_web::{web, FromRequest, HttpMessage, HttpRequest};
use async_trait::async_trait;
use bcrypt::{hash, verify, DEFAULT_COST};
use chrono::{Duration, Utc};
use futures_util::future::LocalBoxFuture;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use log::{debug, error, warn};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

pub const MIN_PASSWORD_LEN: usize = 8;
pub const TOKEN_EXPIRED: &str = "jwt expired";
const RECAPTCHA_VERIFY_URL: &str = "https://www.google.com/recaptcha/api/siteverify";

pub fn hash_password(password: &str) -> Result<String, ApiError> {
    hash(password, DEFAULT_COST).map_err(|e| {
        error!("Failed to hash password: {}", e);
        ApiError::InternalError("Failed to hash password".to_string())
    })
}

pub fn verify_password(password: &str, hash: &str) -> Result<bool, ApiError> {
    verify(password, hash).map_err(|e| {
        error!("Failed to verify password: {}", e);
        ApiError::InternalError("Failed to verify password".to_string())
    })
}

pub fn validate_password(password: &str) -> Result<(), ApiError> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(ApiError::ValidationError(format!(
            "Password must be at least {} characters",
            MIN_PASSWORD_LEN
        )));
    }
    Ok(())
}

/// Expects `local@domain.tld` after normalization.
pub fn validate_email(email: &str) -> Result<(), ApiError> {
    let valid = match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.starts_with('.')
                && !domain.ends_with('.')
                && domain.contains('.')
                && !domain.contains('@')
                && !email.chars().any(char::is_whitespace)
        }
        None => false,
    };
    if !valid {
        return Err(ApiError::ValidationError("A valid email address is required".to_string()));
    }
    Ok(())
}

pub fn generate_token(user: &User, config: &AppConfig) -> Result<String, ApiError> {
    let now = Utc::now();
    let claims = Claims {
        sub: user.id.to_string(),
        email: user.email.clone(),
        iat: now.timestamp() as usize,
        exp: (now + Duration::hours(config.jwt_expiry)).timestamp() as usize,
    };

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(config.jwt_secret.as_bytes()),
    )
    .map_err(|e| {
        error!("Failed to generate token: {}", e);
        ApiError::InternalError("Failed to generate token".to_string())
    })
}

/// Checks signature and expiry. An expired token reports [`TOKEN_EXPIRED`] so
/// clients can tell a lapsed session from a bad token.
pub fn decode_token(token: &str, secret: &str) -> Result<Claims, ApiError> {
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map(|data| data.claims)
    .map_err(|e| match e.kind() {
        ErrorKind::ExpiredSignature => ApiError::AuthError(TOKEN_EXPIRED.to_string()),
        _ => {
            debug!("Rejected token: {}", e);
            ApiError::AuthError("Invalid token".to_string())
        }
    })
}

pub fn bearer_token(req: &HttpRequest) -> Result<String, ApiError> {
    let header = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .ok_or_else(|| ApiError::AuthError("Missing authorization header".to_string()))?;

    match header.strip_prefix("Bearer ") {
        Some(token) if !token.trim().is_empty() => Ok(token.trim().to_string()),
        _ => Err(ApiError::AuthError("Invalid authorization header".to_string())),
    }
}

/// Resolves a bearer token to the current user row. Deleted accounts no
/// longer authenticate even while their token is unexpired.
pub async fn authenticate(state: &AppState, token: &str) -> Result<User, ApiError> {
    let claims = decode_token(token, &state.config.jwt_secret)?;
    let user_id = Uuid::parse_str(&claims.sub)
        .map_err(|_| ApiError::AuthError("Invalid token".to_string()))?;

    state
        .store
        .find_user_by_id(user_id)
        .await?
        .ok_or_else(|| ApiError::AuthError("User no longer exists".to_string()))
}

fn app_state(req: &HttpRequest) -> Result<web::Data<AppState>, ApiError> {
    req.app_data::<web::Data<AppState>>()
        .cloned()
        .ok_or_else(|| ApiError::InternalError("Application state is not configured".to_string()))
}

/// Any signed-in account, approved or not.
#[derive(Debug, Clone)]
pub struct AuthenticatedUser(pub User);

impl FromRequest for AuthenticatedUser {
    type Error = ApiError;
    type Future = LocalBoxFuture<'static, Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        // The approval gate already resolved the user for this request.
        let cached = req.extensions().get::<User>().cloned();
        let state = app_state(req);
        let token = bearer_token(req);

        Box::pin(async move {
            if let Some(user) = cached {
                return Ok(AuthenticatedUser(user));
            }
            let state = state?;
            let token = token?;
            authenticate(&state, &token).await.map(AuthenticatedUser)
        })
    }
}

/// An `admin` or `super_admin` account.
#[derive(Debug, Clone)]
pub struct AdminUser(pub User);

impl FromRequest for AdminUser {
    type Error = ApiError;
    type Future = LocalBoxFuture<'static, Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, payload: &mut Payload) -> Self::Future {
        let inner = AuthenticatedUser::from_request(req, payload);
        Box::pin(async move {
            let AuthenticatedUser(user) = inner.await?;
            if !user.role.is_admin() {
                warn!("User {} attempted an admin action", user.id);
                return Err(ApiError::ForbiddenError("Admin access required".to_string()));
            }
            Ok(AdminUser(user))
        })
    }
}

#[derive(Debug, Clone)]
pub struct SuperAdminUser(pub User);

impl FromRequest for SuperAdminUser {
    type Error = ApiError;
    type Future = LocalBoxFuture<'static, Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, payload: &mut Payload) -> Self::Future {
        let inner = AdminUser::from_request(req, payload);
        Box::pin(async move {
            let AdminUser(user) = inner.await?;
            if user.role != crate::models::Role::SuperAdmin {
                return Err(ApiError::ForbiddenError("Super admin access required".to_string()));
            }
            Ok(SuperAdminUser(user))
        })
    }
}

#[async_trait]
pub trait CaptchaVerifier: Send + Sync {
    /// `Ok(false)` means the verifier answered and refused the token.
    async fn verify(&self, token: &str) -> Result<bool, ApiError>;

    /// Whether a missing token should be refused where one is required.
    fn is_enforced(&self) -> bool {
        true
    }
}

#[derive(Deserialize, Debug)]
struct SiteVerifyResponse {
    success: bool,
    score: Option<f64>,
    #[serde(rename = "error-codes", default)]
    error_codes: Vec<String>,
}

pub struct RecaptchaVerifier {
    client: reqwest::Client,
    secret: String,
    min_score: f64,
}

impl RecaptchaVerifier {
    pub fn new(secret: String, min_score: f64) -> Self {
        Self {
            client: reqwest::Client::new(),
            secret,
            min_score,
        }
    }
}

#[async_trait]
impl CaptchaVerifier for RecaptchaVerifier {
    async fn verify(&self, token: &str) -> Result<bool, ApiError> {
        let response: SiteVerifyResponse = self
            .client
            .post(RECAPTCHA_VERIFY_URL)
            .form(&[("secret", self.secret.as_str()), ("response", token)])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if !response.success {
            debug!("reCAPTCHA rejected token: {:?}", response.error_codes);
            return Ok(false);
        }
        Ok(response.score.map_or(true, |score| score >= self.min_score))
    }
}

/// Accepts every token. Used when no secret key is configured.
pub struct DisabledCaptcha;

#[async_trait]
impl CaptchaVerifier for DisabledCaptcha {
    async fn verify(&self, _token: &str) -> Result<bool, ApiError> {
        Ok(true)
    }

    fn is_enforced(&self) -> bool {
        false
    }
}

pub fn captcha_from_config(config: &CaptchaConfig) -> Arc<dyn CaptchaVerifier> {
    match &config.secret_key {
        Some(secret) => Arc::new(RecaptchaVerifier::new(secret.clone(), config.min_score)),
        None => Arc::new(DisabledCaptcha),
    }
}

/// A missing token passes when `required` is false or the verifier is disabled.
pub async fn check_captcha(
    verifier: &dyn CaptchaVerifier,
    token: Option<&str>,
    required: bool,
) -> Result<(), ApiError> {
    match token.map(str::trim).filter(|t| !t.is_empty()) {
        Some(token) => {
            if verifier.verify(token).await? {
                Ok(())
            } else {
                Err(ApiError::ValidationError("reCAPTCHA verification failed".to_string()))
            }
        }
        None if required && verifier.is_enforced() => {
            Err(ApiError::ValidationError("reCAPTCHA token is required".to_string()))
        }
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ApprovalStatus, Role};

    struct RefusingCaptcha;

    #[async_trait]
    impl CaptchaVerifier for RefusingCaptcha {
        async fn verify(&self, _token: &str) -> Result<bool, ApiError> {
            Ok(false)
        }
    }

    fn sample_user() -> User {
        let now = Utc::now();
        User {
            id: Uuid::new_v4(),
            email: "token@example.org".to_string(),
            password_hash: String::new(),
            full_name: None,
            organization_name: None,
            role_job_title: None,
            role: Role::User,
            is_approved: None,
            approval_status: ApprovalStatus::Pending,
            approved_by: None,
            approved_at: None,
            rejection_reason: None,
            created_at: now,
            updated_at: now,
            last_login_at: None,
            is_first_time: false,
        }
    }

    #[test]
    fn token_round_trip_carries_subject() {
        let config = AppConfig::for_memory();
        let user = sample_user();
        let token = generate_token(&user, &config).unwrap();
        let claims = decode_token(&token, &config.jwt_secret).unwrap();
        assert_eq!(claims.sub, user.id.to_string());
        assert_eq!(claims.email, user.email);
        assert_eq!(claims.exp - claims.iat, 3600);
    }

    #[test]
    fn expired_token_is_reported_as_expired() {
        let config = AppConfig::for_memory();
        let past = (Utc::now() - Duration::hours(2)).timestamp() as usize;
        let claims = Claims {
            sub: Uuid::new_v4().to_string(),
            email: "old@example.org".to_string(),
            iat: past - 3600,
            exp: past,
        };
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(config.jwt_secret.as_bytes()),
        )
        .unwrap();

        match decode_token(&token, &config.jwt_secret) {
            Err(ApiError::AuthError(msg)) => assert_eq!(msg, TOKEN_EXPIRED),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn wrong_secret_is_invalid() {
        let config = AppConfig::for_memory();
        let token = generate_token(&sample_user(), &config).unwrap();
        match decode_token(&token, "another-secret") {
            Err(ApiError::AuthError(msg)) => assert_eq!(msg, "Invalid token"),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn password_hash_verifies() {
        let hashed = hash_password("correct horse").unwrap();
        assert!(verify_password("correct horse", &hashed).unwrap());
        assert!(!verify_password("wrong horse", &hashed).unwrap());
    }

    #[test]
    fn short_passwords_are_rejected() {
        assert!(validate_password("short").is_err());
        assert!(validate_password("long enough").is_ok());
    }

    #[test]
    fn email_shape_is_checked() {
        assert!(validate_email("member@example.org").is_ok());
        assert!(validate_email("member@localhost").is_err());
        assert!(validate_email("@example.org").is_err());
        assert!(validate_email("a b@example.org").is_err());
        assert!(validate_email("member@@example.org").is_err());
    }

    #[tokio::test]
    async fn missing_captcha_only_fails_when_required() {
        assert!(check_captcha(&RefusingCaptcha, None, false).await.is_ok());
        assert!(check_captcha(&RefusingCaptcha, None, true).await.is_err());
        assert!(check_captcha(&RefusingCaptcha, Some("token"), false).await.is_err());
        assert!(check_captcha(&DisabledCaptcha, None, true).await.is_ok());
        assert!(check_captcha(&DisabledCaptcha, Some("token"), true).await.is_ok());
    }
}
