use diesel::pg::PgConnection;
use diesel::r2d2::{self, ConnectionManager};
use log::warn;
use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};
use std::env;

// Type aliases
pub type DbPool = r2d2::Pool<ConnectionManager<PgConnection>>;

// Database initialization SQL, safe to run on every start
pub const DB_INIT_SQL: &str = r#"
CREATE EXTENSION IF NOT EXISTS pgcrypto;

CREATE TABLE IF NOT EXISTS users (
    id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
    email VARCHAR(255) NOT NULL,
    password_hash VARCHAR(255) NOT NULL,
    full_name VARCHAR(255),
    organization_name VARCHAR(255),
    role_job_title VARCHAR(255),
    role VARCHAR(32) NOT NULL DEFAULT 'user',
    is_admin BOOLEAN,
    is_approved BOOLEAN,
    approval_status VARCHAR(32) NOT NULL DEFAULT 'pending',
    approved_by UUID,
    approved_at TIMESTAMPTZ,
    rejection_reason TEXT,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    last_login_at TIMESTAMPTZ,
    is_first_time BOOLEAN NOT NULL DEFAULT FALSE
);

-- Legacy role values collapse to user, admin or super_admin.
UPDATE users SET role = LOWER(TRIM(role)) WHERE role <> LOWER(TRIM(role));
UPDATE users SET role = 'super_admin' WHERE role = 'superadmin';
UPDATE users SET role = 'admin' WHERE is_admin IS TRUE AND role NOT IN ('admin', 'super_admin');
UPDATE users SET role = 'user' WHERE role NOT IN ('user', 'admin', 'super_admin');

CREATE UNIQUE INDEX IF NOT EXISTS users_email_lower_idx ON users (LOWER(email));
CREATE INDEX IF NOT EXISTS users_approval_status_idx ON users (approval_status);

CREATE TABLE IF NOT EXISTS settings (
    id SERIAL PRIMARY KEY,
    admin_id UUID UNIQUE REFERENCES users(id) ON DELETE CASCADE,
    notify_on_approve BOOLEAN,
    notify_on_reject BOOLEAN,
    notify_on_delete BOOLEAN,
    notify_on_registration BOOLEAN,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE UNIQUE INDEX IF NOT EXISTS settings_global_idx ON settings ((admin_id IS NULL)) WHERE admin_id IS NULL;

CREATE TABLE IF NOT EXISTS email_templates (
    id SERIAL PRIMARY KEY,
    key VARCHAR(100) UNIQUE NOT NULL,
    subject VARCHAR(255) NOT NULL,
    html_body TEXT NOT NULL,
    text_body TEXT NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE TABLE IF NOT EXISTS password_resets (
    id SERIAL PRIMARY KEY,
    user_id UUID NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    token_hash VARCHAR(64) UNIQUE NOT NULL,
    expires_at TIMESTAMPTZ NOT NULL,
    used_at TIMESTAMPTZ,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

INSERT INTO settings (admin_id, notify_on_approve, notify_on_reject, notify_on_delete, notify_on_registration)
SELECT NULL, TRUE, TRUE, TRUE, TRUE
WHERE NOT EXISTS (SELECT 1 FROM settings WHERE admin_id IS NULL);
"#;

const DEFAULT_JWT_SECRET: &str = "your_jwt_secret_key_here";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    Memory,
}

#[derive(Clone, Debug)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub secure: bool,
    pub user: Option<String>,
    pub password: Option<String>,
    pub from: String,
}

#[derive(Clone, Debug)]
pub struct ImageKitConfig {
    pub public_key: String,
    pub private_key: String,
    pub url_endpoint: String,
}

#[derive(Clone, Debug)]
pub struct CaptchaConfig {
    pub site_key: Option<String>,
    pub secret_key: Option<String>,
    pub min_score: f64,
    pub required_for_login: bool,
}

// Config
#[derive(Clone, Debug)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub app_base_url: String,
    pub store_backend: StoreBackend,
    pub database_url: Option<String>,
    pub jwt_secret: String,
    pub jwt_expiry: i64, // In hours
    pub imagekit: Option<ImageKitConfig>,
    pub smtp: Option<SmtpConfig>,
    pub captcha: CaptchaConfig,
    pub default_user_password: String,
    pub notify_max_attempts: u32,
    pub notify_retry_delay_ms: u64,
    pub documents_root: String,
}

fn var(name: &str) -> Option<String> {
    env::var(name).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn parsed<T: std::str::FromStr>(name: &str, default: T) -> T {
    var(name).and_then(|v| v.parse::<T>().ok()).unwrap_or(default)
}

fn flag(name: &str, default: bool) -> bool {
    match var(name) {
        Some(v) => matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        None => default,
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        let jwt_secret = match var("JWT_SECRET") {
            Some(val) => val,
            None => {
                warn!("JWT_SECRET is not set");
                warn!("Using default JWT secret - THIS IS NOT SECURE FOR PRODUCTION!");
                DEFAULT_JWT_SECRET.to_string()
            }
        };

        let store_backend = match var("STORE_BACKEND").as_deref() {
            Some("memory") => StoreBackend::Memory,
            _ => StoreBackend::Postgres,
        };

        let imagekit = var("IMAGEKIT_PRIVATE_KEY").map(|private_key| ImageKitConfig {
            public_key: var("IMAGEKIT_PUBLIC_KEY").unwrap_or_default(),
            private_key,
            url_endpoint: var("IMAGEKIT_URL_ENDPOINT").unwrap_or_default(),
        });

        let smtp = var("SMTP_HOST").map(|host| {
            let secure = flag("SMTP_SECURE", false);
            SmtpConfig {
                host,
                port: parsed("SMTP_PORT", if secure { 465 } else { 587 }),
                secure,
                user: var("SMTP_USER"),
                password: var("SMTP_PASSWORD"),
                from: var("SMTP_FROM")
                    .or_else(|| var("SMTP_USER"))
                    .unwrap_or_else(|| "no-reply@localhost".to_string()),
            }
        });

        let captcha = CaptchaConfig {
            site_key: var("RECAPTCHA_SITE_KEY"),
            secret_key: var("RECAPTCHA_SECRET_KEY"),
            min_score: parsed("RECAPTCHA_MIN_SCORE", 0.5),
            required_for_login: flag("LOGIN_CAPTCHA_REQUIRED", false),
        };

        let default_user_password = var("DEFAULT_USER_PASSWORD").unwrap_or_else(|| {
            warn!("DEFAULT_USER_PASSWORD is not set, generating one for this process");
            Self::generate_secure_secret()
        });

        Self {
            host: var("HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            port: parsed("PORT", 8080),
            app_base_url: var("APP_BASE_URL").unwrap_or_else(|| "http://localhost:3000".to_string()),
            store_backend,
            database_url: var("DATABASE_URL"),
            jwt_secret,
            jwt_expiry: parsed("JWT_EXPIRY_HOURS", 1),
            imagekit,
            smtp,
            captcha,
            default_user_password,
            notify_max_attempts: parsed("NOTIFY_MAX_ATTEMPTS", 1),
            notify_retry_delay_ms: parsed("NOTIFY_RETRY_DELAY_MS", 500),
            documents_root: var("DOCUMENTS_ROOT").unwrap_or_else(|| "/StrategicDocs".to_string()),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.jwt_secret == DEFAULT_JWT_SECRET {
            warn!("Using default JWT secret is not secure for production!");
        }

        if self.jwt_expiry <= 0 {
            return Err("JWT_EXPIRY_HOURS must be positive".to_string());
        }

        if self.store_backend == StoreBackend::Postgres && self.database_url.is_none() {
            return Err("DATABASE_URL must be set when STORE_BACKEND is postgres".to_string());
        }

        if self.notify_max_attempts == 0 {
            return Err("NOTIFY_MAX_ATTEMPTS must be at least 1".to_string());
        }

        if !(0.0..=1.0).contains(&self.captcha.min_score) {
            return Err("RECAPTCHA_MIN_SCORE must be between 0 and 1".to_string());
        }

        if self.default_user_password.len() < 8 {
            return Err("DEFAULT_USER_PASSWORD must be at least 8 characters".to_string());
        }

        if self.captcha.secret_key.is_none() {
            warn!("RECAPTCHA_SECRET_KEY is not set, captcha checks are disabled");
        }

        Ok(())
    }

    pub fn generate_secure_secret() -> String {
        thread_rng()
            .sample_iter(&Alphanumeric)
            .take(32)
            .map(char::from)
            .collect()
    }

    /// Configuration for tests and local runs without any external service.
    pub fn for_memory() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            app_base_url: "http://localhost:3000".to_string(),
            store_backend: StoreBackend::Memory,
            database_url: None,
            jwt_secret: "memory-backend-secret-0123456789abcdef".to_string(),
            jwt_expiry: 1,
            imagekit: None,
            smtp: None,
            captcha: CaptchaConfig {
                site_key: None,
                secret_key: None,
                min_score: 0.5,
                required_for_login: false,
            },
            default_user_password: "ChangeMe!2024".to_string(),
            notify_max_attempts: 1,
            notify_retry_delay_ms: 0,
            documents_root: "/StrategicDocs".to_string(),
        }
    }
}
