use crate::auth::{
    check_captcha, decode_token, generate_token, hash_password, validate_email, validate_password, verify_password,
};
use crate::config::AppConfig;
use crate::errors::ApiError;
use crate::models::*;
use crate::notifications::{Notification, TemplateKey};
use crate::state::AppState;
use chrono::{Duration, Utc};
use log::{debug, info, warn};
use serde::Serialize;
use sha2::{Digest, Sha256};
use uuid::Uuid;

pub const RESET_TOKEN_TTL_HOURS: i64 = 1;

/// Stored form of a password reset token. Only the hash is persisted.
pub fn hash_reset_token(token: &str) -> String {
    format!("{:x}", Sha256::digest(token.as_bytes()))
}

fn invalid_credentials() -> ApiError {
    ApiError::AuthError("Invalid email or password".to_string())
}

pub struct AuthService;

impl AuthService {
    /// Creates a pending account. No session token is issued; the member
    /// signs in through `login` like everyone else.
    pub async fn register(state: &AppState, req: RegisterRequest) -> Result<User, ApiError> {
        check_captcha(state.captcha.as_ref(), req.recaptcha_token.as_deref(), true).await?;

        let email = normalize_email(&req.email);
        validate_email(&email)?;
        validate_password(&req.password)?;
        let full_name = clean_text(req.full_name)
            .ok_or_else(|| ApiError::ValidationError("Full name is required".to_string()))?;

        if state.store.find_user_by_email(&email).await?.is_some() {
            return Err(ApiError::ConflictError("Email already exists".to_string()));
        }

        let mut new_user = NewUser::pending(&email, hash_password(&req.password)?);
        new_user.full_name = Some(full_name);
        new_user.organization_name = clean_text(req.organization_name);
        new_user.role_job_title = clean_text(req.role_job_title);

        // The unique index is the real guard if two registrations race.
        let user = state.store.insert_user(new_user).await?;
        info!("Registered user {} ({})", user.id, user.email);

        state.notifications.enqueue(
            Notification::for_user(TemplateKey::Welcome, &user).with("app_url", state.config.app_base_url.clone()),
        );
        Self::notify_admins_of_registration(state, &user).await;

        Ok(user)
    }

    async fn notify_admins_of_registration(state: &AppState, user: &User) {
        match state.store.effective_settings(None).await {
            Ok(settings) if settings.notify_on_registration => {}
            Ok(_) => return,
            Err(e) => {
                warn!("Could not load notification settings, skipping admin notices: {}", e);
                return;
            }
        }

        let admins = match state.store.list_users(UserScope::Admins).await {
            Ok(admins) => admins,
            Err(e) => {
                warn!("Could not list admins for registration notice: {}", e);
                return;
            }
        };

        for admin in &admins {
            state.notifications.enqueue(
                Notification::for_user(TemplateKey::AdminNewRegistration, admin)
                    .with("applicant_name", user.full_name.clone().unwrap_or_default())
                    .with("applicant_email", user.email.clone())
                    .with("organization", user.organization_name.clone().unwrap_or_default())
                    .with("app_url", state.config.app_base_url.clone()),
            );
        }
    }

    /// Unknown email and wrong password fail with the same message.
    async fn check_credentials(state: &AppState, email: &str, password: &str) -> Result<User, ApiError> {
        let user = state
            .store
            .find_user_by_email(email)
            .await?
            .ok_or_else(invalid_credentials)?;

        if !verify_password(password, &user.password_hash)? {
            debug!("Password mismatch for user {}", user.id);
            return Err(invalid_credentials());
        }
        Ok(user)
    }

    async fn issue_session(state: &AppState, mut user: User) -> Result<LoginResponse, ApiError> {
        let now = Utc::now();
        state.store.record_login(user.id, now).await?;
        user.last_login_at = Some(now);

        let token = generate_token(&user, &state.config)?;
        info!("User {} logged in", user.id);
        Ok(LoginResponse { token, user })
    }

    pub async fn login(state: &AppState, req: LoginRequest) -> Result<LoginResponse, ApiError> {
        check_captcha(
            state.captcha.as_ref(),
            req.recaptcha_token.as_deref(),
            state.config.captcha.required_for_login,
        )
        .await?;

        let user = Self::check_credentials(state, &req.email, &req.password).await?;
        Self::issue_session(state, user).await
    }

    /// Captcha is always required here and member accounts are refused.
    pub async fn admin_login(state: &AppState, req: LoginRequest) -> Result<LoginResponse, ApiError> {
        check_captcha(state.captcha.as_ref(), req.recaptcha_token.as_deref(), true).await?;

        let user = Self::check_credentials(state, &req.email, &req.password).await?;
        if !user.role.is_admin() {
            warn!("Member {} attempted an admin login", user.id);
            return Err(ApiError::ForbiddenError("Admin access required".to_string()));
        }
        Self::issue_session(state, user).await
    }

    pub async fn verify(state: &AppState, token: &str) -> Result<(Claims, User), ApiError> {
        let claims = decode_token(token, &state.config.jwt_secret)?;
        let user_id =
            Uuid::parse_str(&claims.sub).map_err(|_| ApiError::AuthError("Invalid token".to_string()))?;
        let user = state
            .store
            .find_user_by_id(user_id)
            .await?
            .ok_or_else(|| ApiError::AuthError("User no longer exists".to_string()))?;
        Ok((claims, user))
    }

    pub async fn update_profile(state: &AppState, user: &User, update: ProfileUpdate) -> Result<User, ApiError> {
        let update = ProfileUpdate {
            full_name: clean_text(update.full_name),
            organization_name: clean_text(update.organization_name),
            role_job_title: clean_text(update.role_job_title),
        };
        state.store.update_profile(user.id, update).await
    }

    pub async fn change_password(state: &AppState, user: &User, req: ChangePasswordRequest) -> Result<(), ApiError> {
        if !verify_password(&req.current_password, &user.password_hash)? {
            return Err(ApiError::ValidationError("Current password is incorrect".to_string()));
        }
        validate_password(&req.new_password)?;

        state
            .store
            .update_password(user.id, hash_password(&req.new_password)?)
            .await?;
        info!("User {} changed their password", user.id);
        Ok(())
    }

    /// Succeeds whether or not the email belongs to an account.
    pub async fn forgot_password(state: &AppState, email: &str) -> Result<(), ApiError> {
        let user = match state.store.find_user_by_email(email).await? {
            Some(user) => user,
            None => {
                debug!("Password reset requested for unknown email");
                return Ok(());
            }
        };

        let token = AppConfig::generate_secure_secret();
        state
            .store
            .insert_password_reset(NewPasswordReset {
                user_id: user.id,
                token_hash: hash_reset_token(&token),
                expires_at: Utc::now() + Duration::hours(RESET_TOKEN_TTL_HOURS),
            })
            .await?;

        let link = format!(
            "{}/reset-password?token={}",
            state.config.app_base_url.trim_end_matches('/'),
            token
        );
        state
            .notifications
            .enqueue(Notification::for_user(TemplateKey::PasswordReset, &user).with("link", link));
        info!("Password reset issued for user {}", user.id);
        Ok(())
    }

    pub async fn reset_password(state: &AppState, req: ResetPasswordRequest) -> Result<(), ApiError> {
        validate_password(&req.new_password)?;

        let user_id = state
            .store
            .consume_password_reset(&hash_reset_token(req.token.trim()), Utc::now())
            .await?
            .ok_or_else(|| ApiError::ValidationError("Invalid or expired reset token".to_string()))?;

        state
            .store
            .update_password(user_id, hash_password(&req.new_password)?)
            .await?;
        info!("Password reset completed for user {}", user_id);
        Ok(())
    }
}

/// A template as shown in the dashboard: the stored row, or the built-in
/// default when nothing was saved for the key.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct TemplateView {
    pub key: String,
    pub subject: String,
    pub html_body: String,
    pub text_body: String,
    pub is_default: bool,
}

pub struct AdminService;

impl AdminService {
    pub async fn list_admins(state: &AppState) -> Result<Vec<User>, ApiError> {
        state.store.list_users(UserScope::Admins).await
    }

    pub async fn create_admin(state: &AppState, caller: &User, req: CreateAdminRequest) -> Result<User, ApiError> {
        if !req.role.is_admin() {
            return Err(ApiError::ValidationError("Role must be admin or super_admin".to_string()));
        }
        let email = normalize_email(&req.email);
        validate_email(&email)?;
        validate_password(&req.password)?;

        if state.store.find_user_by_email(&email).await?.is_some() {
            return Err(ApiError::ConflictError("Email already exists".to_string()));
        }

        let mut new_admin = NewUser::pending(&email, hash_password(&req.password)?);
        new_admin.full_name = clean_text(req.full_name);
        new_admin.role = req.role;
        new_admin.approval = Some((caller.id, Utc::now()));

        let admin = state.store.insert_user(new_admin).await?;
        info!("Super admin {} created {} {}", caller.id, admin.role, admin.id);
        Ok(admin)
    }

    pub async fn delete_admin(state: &AppState, caller: &User, admin_id: Uuid) -> Result<User, ApiError> {
        if admin_id == caller.id {
            return Err(ApiError::ForbiddenError("You cannot delete your own account".to_string()));
        }
        match state.store.find_user_by_id(admin_id).await? {
            Some(target) if target.role.is_admin() => {}
            _ => return Err(ApiError::NotFoundError("Admin not found".to_string())),
        }

        let deleted = state
            .store
            .delete_users(&[admin_id])
            .await?
            .pop()
            .ok_or_else(|| ApiError::NotFoundError("Admin not found".to_string()))?;
        info!("Super admin {} deleted admin {}", caller.id, deleted.id);
        Ok(deleted)
    }

    pub async fn settings(state: &AppState, admin: &User) -> Result<NotificationSettings, ApiError> {
        state.store.effective_settings(Some(admin.id)).await
    }

    /// Writes the caller's own override row, or the global row for a super admin.
    pub async fn update_settings(
        state: &AppState,
        admin: &User,
        update: SettingsUpdate,
        global: bool,
    ) -> Result<NotificationSettings, ApiError> {
        if global && admin.role != Role::SuperAdmin {
            return Err(ApiError::ForbiddenError(
                "Only a super admin can change global settings".to_string(),
            ));
        }

        let scope = if global { None } else { Some(admin.id) };
        state.store.save_settings(scope, &update).await?;
        info!("Admin {} updated {} settings", admin.id, if global { "global" } else { "own" });
        state.store.effective_settings(Some(admin.id)).await
    }

    pub async fn list_templates(state: &AppState) -> Result<Vec<TemplateView>, ApiError> {
        let stored = state.store.list_templates().await?;
        Ok(TemplateKey::ALL
            .iter()
            .map(|key| match stored.iter().find(|t| t.key == key.as_str()) {
                Some(t) => TemplateView {
                    key: t.key.clone(),
                    subject: t.subject.clone(),
                    html_body: t.html_body.clone(),
                    text_body: t.text_body.clone(),
                    is_default: false,
                },
                None => {
                    let (subject, html_body, text_body) = key.default_template();
                    TemplateView {
                        key: key.as_str().to_string(),
                        subject: subject.to_string(),
                        html_body: html_body.to_string(),
                        text_body: text_body.to_string(),
                        is_default: true,
                    }
                }
            })
            .collect())
    }

    pub async fn update_template(
        state: &AppState,
        key: &str,
        mut template: NewEmailTemplate,
    ) -> Result<EmailTemplate, ApiError> {
        let key = TemplateKey::from_key(key)
            .ok_or_else(|| ApiError::NotFoundError(format!("Unknown email template: {}", key)))?;
        if template.subject.trim().is_empty() {
            return Err(ApiError::ValidationError("Subject is required".to_string()));
        }
        if template.html_body.trim().is_empty() && template.text_body.trim().is_empty() {
            return Err(ApiError::ValidationError("Template body is required".to_string()));
        }

        template.key = key.as_str().to_string();
        state.store.upsert_template(template).await
    }
}
