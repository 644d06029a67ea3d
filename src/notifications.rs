//! Outbound email. State changes enqueue a [`Notification`]; a single
//! background worker renders and sends them in order. Send failures are
//! retried per [`RetryPolicy`], then logged and dropped.

use crate::config::{AppConfig, SmtpConfig};
use crate::errors::ApiError;
use crate::models::User;
use crate::store::PortalStore;
use async_trait::async_trait;
use lettre::message::{Mailbox, MultiPart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use log::{debug, error, info, warn};
use regex::Regex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TemplateKey {
    Welcome,
    AdminNewRegistration,
    AccountApproved,
    AccountRejected,
    AccountDeleted,
    PasswordReset,
}

impl TemplateKey {
    pub const ALL: [TemplateKey; 6] = [
        TemplateKey::Welcome,
        TemplateKey::AdminNewRegistration,
        TemplateKey::AccountApproved,
        TemplateKey::AccountRejected,
        TemplateKey::AccountDeleted,
        TemplateKey::PasswordReset,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TemplateKey::Welcome => "welcome",
            TemplateKey::AdminNewRegistration => "admin_new_registration",
            TemplateKey::AccountApproved => "account_approved",
            TemplateKey::AccountRejected => "account_rejected",
            TemplateKey::AccountDeleted => "account_deleted",
            TemplateKey::PasswordReset => "password_reset",
        }
    }

    pub fn from_key(key: &str) -> Option<TemplateKey> {
        Self::ALL.into_iter().find(|k| k.as_str() == key)
    }

    /// Built-in (subject, html, text) used until an admin stores a row.
    pub fn default_template(&self) -> (&'static str, &'static str, &'static str) {
        match self {
            TemplateKey::Welcome => (
                "Welcome, ${name}",
                "<p>Hello ${name},</p><p>Thank you for registering. An administrator will review your account shortly and you will receive an email once it has been approved.</p>",
                "Hello ${name},\n\nThank you for registering. An administrator will review your account shortly and you will receive an email once it has been approved.",
            ),
            TemplateKey::AdminNewRegistration => (
                "New registration awaiting approval: ${applicant_email}",
                "<p>${applicant_name} (${applicant_email}) from ${organization} has registered and is waiting for approval.</p><p><a href=\"${app_url}/admin\">Open the dashboard</a></p>",
                "${applicant_name} (${applicant_email}) from ${organization} has registered and is waiting for approval.\n\n${app_url}/admin",
            ),
            TemplateKey::AccountApproved => (
                "Your account has been approved",
                "<p>Hello ${name},</p><p>Your account has been approved. You can now <a href=\"${app_url}/login\">sign in</a>.</p>",
                "Hello ${name},\n\nYour account has been approved. You can now sign in at ${app_url}/login.",
            ),
            TemplateKey::AccountRejected => (
                "Your account request was not approved",
                "<p>Hello ${name},</p><p>Your account request was not approved.</p><p>Reason: ${reason}</p>",
                "Hello ${name},\n\nYour account request was not approved.\n\nReason: ${reason}",
            ),
            TemplateKey::AccountDeleted => (
                "Your account has been removed",
                "<p>Hello ${name},</p><p>Your account has been removed by an administrator.</p>",
                "Hello ${name},\n\nYour account has been removed by an administrator.",
            ),
            TemplateKey::PasswordReset => (
                "Reset your password",
                "<p>Hello ${name},</p><p><a href=\"${link}\">Reset your password</a>. The link expires in one hour.</p>",
                "Hello ${name},\n\nReset your password: ${link}\n\nThe link expires in one hour.",
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub template: TemplateKey,
    pub to: String,
    pub vars: HashMap<String, String>,
}

impl Notification {
    /// Addressed to `user` with `name` and `email` already set.
    pub fn for_user(template: TemplateKey, user: &User) -> Self {
        let name = user.full_name.clone().unwrap_or_else(|| user.email.clone());
        Notification {
            template,
            to: user.email.clone(),
            vars: HashMap::new(),
        }
        .with("name", name)
        .with("email", user.email.clone())
    }

    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.vars.insert(key.to_string(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutgoingEmail {
    pub to: String,
    pub subject: String,
    pub html_body: String,
    pub text_body: String,
}

fn placeholder_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\$\{(\w+)\}").expect("placeholder pattern is valid"))
}

/// Replaces `${name}` placeholders. Unknown names are left untouched.
pub fn render_placeholders(text: &str, vars: &HashMap<String, String>) -> String {
    placeholder_pattern()
        .replace_all(text, |caps: &regex::Captures| match vars.get(&caps[1]) {
            Some(value) => value.clone(),
            None => caps[0].to_string(),
        })
        .into_owned()
}

/// Renders with the stored template for the key, or the built-in default.
pub async fn render(store: &dyn PortalStore, notification: &Notification) -> Result<OutgoingEmail, ApiError> {
    let (subject, html, text) = match store.find_template(notification.template.as_str()).await? {
        Some(t) => (t.subject, t.html_body, t.text_body),
        None => {
            let (s, h, t) = notification.template.default_template();
            (s.to_string(), h.to_string(), t.to_string())
        }
    };

    Ok(OutgoingEmail {
        to: notification.to.clone(),
        subject: render_placeholders(&subject, &notification.vars),
        html_body: render_placeholders(&html, &notification.vars),
        text_body: render_placeholders(&text, &notification.vars),
    })
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, email: &OutgoingEmail) -> Result<(), String>;
}

pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpMailer {
    pub fn new(config: &SmtpConfig) -> Result<Self, ApiError> {
        let builder = if config.secure {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host)
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
        }
        .map_err(|e| ApiError::InternalError(format!("SMTP relay error: {}", e)))?;

        let mut builder = builder.port(config.port);
        if let (Some(user), Some(password)) = (&config.user, &config.password) {
            builder = builder.credentials(Credentials::new(user.clone(), password.clone()));
        }

        let from = config
            .from
            .parse::<Mailbox>()
            .map_err(|e| ApiError::InternalError(format!("Invalid from address: {}", e)))?;

        Ok(Self {
            transport: builder.build(),
            from,
        })
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, email: &OutgoingEmail) -> Result<(), String> {
        let to = email
            .to
            .parse::<Mailbox>()
            .map_err(|e| format!("Invalid to address {}: {}", email.to, e))?;

        let message = Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(email.subject.clone())
            .multipart(MultiPart::alternative_plain_html(
                email.text_body.clone(),
                email.html_body.clone(),
            ))
            .map_err(|e| format!("Email build error: {}", e))?;

        self.transport
            .send(message)
            .await
            .map(|_| ())
            .map_err(|e| format!("SMTP send error: {}", e))
    }
}

/// Logs instead of sending. Used when SMTP is not configured.
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, email: &OutgoingEmail) -> Result<(), String> {
        info!("[mail disabled] to={} subject={:?}", email.to, email.subject);
        Ok(())
    }
}

pub fn mailer_from_config(config: &AppConfig) -> Result<Arc<dyn Mailer>, ApiError> {
    match &config.smtp {
        Some(smtp) => Ok(Arc::new(SmtpMailer::new(smtp)?)),
        None => {
            warn!("SMTP_HOST is not set, outgoing email will only be logged");
            Ok(Arc::new(LogMailer))
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &AppConfig) -> Self {
        RetryPolicy {
            max_attempts: config.notify_max_attempts.max(1),
            delay: Duration::from_millis(config.notify_retry_delay_ms),
        }
    }
}

enum Job {
    Send(Notification),
    Flush(oneshot::Sender<()>),
}

/// Handle for queueing email. Cloning shares the same worker.
#[derive(Clone)]
pub struct NotificationQueue {
    tx: mpsc::UnboundedSender<Job>,
}

impl NotificationQueue {
    /// Never blocks and never fails the caller.
    pub fn enqueue(&self, notification: Notification) {
        debug!(
            "Queueing {} email to {}",
            notification.template.as_str(),
            notification.to
        );
        if self.tx.send(Job::Send(notification)).is_err() {
            error!("Notification worker has stopped, email dropped");
        }
    }

    /// Resolves once every notification queued before this call was handled.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Job::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }
}

pub fn spawn_worker(
    store: Arc<dyn PortalStore>,
    mailer: Arc<dyn Mailer>,
    policy: RetryPolicy,
) -> (NotificationQueue, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<Job>();

    let handle = tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            match job {
                Job::Send(notification) => deliver(store.as_ref(), mailer.as_ref(), policy, notification).await,
                Job::Flush(done) => {
                    let _ = done.send(());
                }
            }
        }
        info!("Notification worker stopped");
    });

    (NotificationQueue { tx }, handle)
}

async fn deliver(store: &dyn PortalStore, mailer: &dyn Mailer, policy: RetryPolicy, notification: Notification) {
    let email = match render(store, &notification).await {
        Ok(email) => email,
        Err(e) => {
            error!(
                "Failed to render {} email for {}: {}",
                notification.template.as_str(),
                notification.to,
                e
            );
            return;
        }
    };

    for attempt in 1..=policy.max_attempts {
        match mailer.send(&email).await {
            Ok(()) => {
                debug!("Sent {} email to {}", notification.template.as_str(), email.to);
                return;
            }
            Err(e) if attempt < policy.max_attempts => {
                warn!(
                    "Attempt {}/{} to email {} failed: {}",
                    attempt, policy.max_attempts, email.to, e
                );
                tokio::time::sleep(policy.delay).await;
            }
            Err(e) => {
                error!(
                    "Giving up on {} email to {} after {} attempt(s): {}",
                    notification.template.as_str(),
                    email.to,
                    attempt,
                    e
                );
            }
        }
    }
}
