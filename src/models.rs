use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Admin,
    SuperAdmin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Admin => "admin",
            Role::SuperAdmin => "super_admin",
        }
    }

    pub fn is_admin(&self) -> bool {
        matches!(self, Role::Admin | Role::SuperAdmin)
    }

    /// Collapses the stored `role` string and the legacy `is_admin` flag into one role.
    pub fn normalize(role: &str, legacy_is_admin: Option<bool>) -> Role {
        match role.parse::<Role>() {
            Ok(Role::User) if legacy_is_admin == Some(true) => Role::Admin,
            Ok(parsed) => parsed,
            Err(_) if legacy_is_admin == Some(true) => Role::Admin,
            Err(_) => Role::User,
        }
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "user" => Ok(Role::User),
            "admin" => Ok(Role::Admin),
            "super_admin" | "superadmin" => Ok(Role::SuperAdmin),
            other => Err(format!("Unknown role: {}", other)),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Rejected => "rejected",
        }
    }
}

impl FromStr for ApprovalStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(ApprovalStatus::Pending),
            "approved" => Ok(ApprovalStatus::Approved),
            "rejected" => Ok(ApprovalStatus::Rejected),
            other => Err(format!("Unknown approval status: {}", other)),
        }
    }
}

impl fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw `users` row as stored. Only the store layer sees this type.
#[derive(Queryable, Selectable, Debug, Clone)]
#[diesel(table_name = crate::schema::users)]
pub struct UserRow {
    pub id: Uuid,
    pub email: String,
    pub password_hash: String,
    pub full_name: Option<String>,
    pub organization_name: Option<String>,
    pub role_job_title: Option<String>,
    pub role: String,
    pub is_admin: Option<bool>,
    pub is_approved: Option<bool>,
    pub approval_status: String,
    pub approved_by: Option<Uuid>,
    pub approved_at: Option<DateTime<Utc>>,
    pub rejection_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_login_at: Option<DateTime<Utc>>,
    pub is_first_time: bool,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub full_name: Option<String>,
    pub organization_name: Option<String>,
    pub role_job_title: Option<String>,
    pub role: Role,
    pub is_approved: Option<bool>,
    pub approval_status: ApprovalStatus,
    pub approved_by: Option<Uuid>,
    pub approved_at: Option<DateTime<Utc>>,
    pub rejection_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_login_at: Option<DateTime<Utc>>,
    pub is_first_time: bool,
}

impl From<UserRow> for User {
    fn from(row: UserRow) -> Self {
        let role = Role::normalize(&row.role, row.is_admin);
        let approval_status = row
            .approval_status
            .parse::<ApprovalStatus>()
            .unwrap_or(match row.is_approved {
                Some(true) => ApprovalStatus::Approved,
                _ => ApprovalStatus::Pending,
            });

        User {
            id: row.id,
            email: row.email,
            password_hash: row.password_hash,
            full_name: row.full_name,
            organization_name: row.organization_name,
            role_job_title: row.role_job_title,
            role,
            is_approved: row.is_approved,
            approval_status,
            approved_by: row.approved_by,
            approved_at: row.approved_at,
            rejection_reason: row.rejection_reason,
            created_at: row.created_at,
            updated_at: row.updated_at,
            last_login_at: row.last_login_at,
            is_first_time: row.is_first_time,
        }
    }
}

impl User {
    /// Admin accounts are always treated as approved.
    pub fn has_content_access(&self) -> bool {
        self.role.is_admin() || self.is_approved == Some(true)
    }

    pub fn is_bulk_approvable(&self) -> bool {
        self.role == Role::User && self.is_approved != Some(true)
    }

    pub fn is_bulk_rejectable(&self) -> bool {
        self.role == Role::User && self.approval_status != ApprovalStatus::Rejected
    }
}

/// Lowercased, trimmed form used for storage and lookups.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Trimmed value, `None` when blank.
pub fn clean_text(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

/// Everything needed to create an account. Timestamps and id come from the store.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub email: String,
    pub password_hash: String,
    pub full_name: Option<String>,
    pub organization_name: Option<String>,
    pub role_job_title: Option<String>,
    pub role: Role,
    pub approval: Option<(Uuid, DateTime<Utc>)>,
    pub is_first_time: bool,
}

impl NewUser {
    pub fn pending(email: &str, password_hash: String) -> Self {
        NewUser {
            email: normalize_email(email),
            password_hash,
            full_name: None,
            organization_name: None,
            role_job_title: None,
            role: Role::User,
            approval: None,
            is_first_time: false,
        }
    }
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = crate::schema::users)]
pub struct NewUserRow {
    pub email: String,
    pub password_hash: String,
    pub full_name: Option<String>,
    pub organization_name: Option<String>,
    pub role_job_title: Option<String>,
    pub role: String,
    pub is_approved: Option<bool>,
    pub approval_status: String,
    pub approved_by: Option<Uuid>,
    pub approved_at: Option<DateTime<Utc>>,
    pub is_first_time: bool,
}

impl From<NewUser> for NewUserRow {
    fn from(user: NewUser) -> Self {
        let approved = user.role.is_admin() || user.approval.is_some();
        NewUserRow {
            email: normalize_email(&user.email),
            password_hash: user.password_hash,
            full_name: user.full_name,
            organization_name: user.organization_name,
            role_job_title: user.role_job_title,
            role: user.role.as_str().to_string(),
            is_approved: Some(approved),
            approval_status: if approved {
                ApprovalStatus::Approved.as_str().to_string()
            } else {
                ApprovalStatus::Pending.as_str().to_string()
            },
            approved_by: user.approval.map(|(by, _)| by),
            approved_at: user.approval.map(|(_, at)| at),
            is_first_time: user.is_first_time,
        }
    }
}

/// Outcome an admin applies to a member account.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Approve,
    Reject { reason: Option<String> },
}

impl Decision {
    pub fn is_approved(&self) -> bool {
        matches!(self, Decision::Approve)
    }

    pub fn status(&self) -> ApprovalStatus {
        match self {
            Decision::Approve => ApprovalStatus::Approved,
            Decision::Reject { .. } => ApprovalStatus::Rejected,
        }
    }

    pub fn rejection_reason(&self) -> Option<String> {
        match self {
            Decision::Approve => None,
            Decision::Reject { reason } => reason.clone(),
        }
    }

    /// Bulk eligibility: approve only touches not-yet-approved users,
    /// reject touches anything that is not already rejected.
    pub fn is_eligible(&self, user: &User) -> bool {
        match self {
            Decision::Approve => user.is_bulk_approvable(),
            Decision::Reject { .. } => user.is_bulk_rejectable(),
        }
    }
}

/// A state transition applied to a set of user ids in one store call.
#[derive(Debug, Clone)]
pub struct ApprovalChange {
    pub decision: Decision,
    pub admin_id: Uuid,
    pub at: DateTime<Utc>,
    /// Skip rows the decision is not eligible for instead of re-applying it.
    pub only_eligible: bool,
}

impl ApprovalChange {
    /// Whether `user` is touched by this change. Admin rows never are.
    pub fn applies_to(&self, user: &User) -> bool {
        if user.role != Role::User {
            return false;
        }
        !self.only_eligible || self.decision.is_eligible(user)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserScope {
    /// Accounts with role `user`
    Members,
    /// Members still waiting for a decision
    Pending,
    /// Admin and super admin accounts
    Admins,
}

impl UserScope {
    pub fn contains(&self, user: &User) -> bool {
        match self {
            UserScope::Members => user.role == Role::User,
            UserScope::Pending => {
                user.role == Role::User && user.approval_status == ApprovalStatus::Pending
            }
            UserScope::Admins => user.role.is_admin(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct ProfileUpdate {
    #[serde(alias = "full_name")]
    pub full_name: Option<String>,
    #[serde(alias = "organization_name")]
    pub organization_name: Option<String>,
    #[serde(alias = "role_job_title")]
    pub role_job_title: Option<String>,
}

#[derive(AsChangeset, Debug, Clone)]
#[diesel(table_name = crate::schema::users)]
pub struct ProfileChangeset {
    pub full_name: Option<String>,
    pub organization_name: Option<String>,
    pub role_job_title: Option<String>,
    pub updated_at: DateTime<Utc>,
}

// Settings

#[derive(Queryable, Selectable, Debug, Clone)]
#[diesel(table_name = crate::schema::settings)]
pub struct SettingsRow {
    pub id: i32,
    pub admin_id: Option<Uuid>,
    pub notify_on_approve: Option<bool>,
    pub notify_on_reject: Option<bool>,
    pub notify_on_delete: Option<bool>,
    pub notify_on_registration: Option<bool>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Deserialize, Serialize, AsChangeset, Debug, Clone, Default, PartialEq)]
#[diesel(table_name = crate::schema::settings)]
pub struct SettingsUpdate {
    pub notify_on_approve: Option<bool>,
    pub notify_on_reject: Option<bool>,
    pub notify_on_delete: Option<bool>,
    pub notify_on_registration: Option<bool>,
}

/// Effective notification toggles after merging global and per-admin rows.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotificationSettings {
    pub notify_on_approve: bool,
    pub notify_on_reject: bool,
    pub notify_on_delete: bool,
    pub notify_on_registration: bool,
}

impl NotificationSettings {
    /// Global values first, then the admin's own row field by field. Unset means on.
    pub fn merge(global: Option<&SettingsRow>, own: Option<&SettingsRow>) -> Self {
        let pick = |f: fn(&SettingsRow) -> Option<bool>| {
            own.and_then(f).or_else(|| global.and_then(f)).unwrap_or(true)
        };
        NotificationSettings {
            notify_on_approve: pick(|s| s.notify_on_approve),
            notify_on_reject: pick(|s| s.notify_on_reject),
            notify_on_delete: pick(|s| s.notify_on_delete),
            notify_on_registration: pick(|s| s.notify_on_registration),
        }
    }
}

// Email templates

#[derive(Queryable, Selectable, Serialize, Debug, Clone, PartialEq)]
#[diesel(table_name = crate::schema::email_templates)]
pub struct EmailTemplate {
    pub id: i32,
    pub key: String,
    pub subject: String,
    pub html_body: String,
    pub text_body: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Insertable, Deserialize, Debug, Clone)]
#[diesel(table_name = crate::schema::email_templates)]
pub struct NewEmailTemplate {
    #[serde(default)]
    pub key: String,
    pub subject: String,
    pub html_body: String,
    pub text_body: String,
}

// Password resets

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = crate::schema::password_resets)]
pub struct NewPasswordReset {
    pub user_id: Uuid,
    pub token_hash: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Claims {
    pub sub: String, // Subject (user id)
    pub email: String,
    pub exp: usize,
    pub iat: usize,
}

// DTOs

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
    #[serde(alias = "full_name")]
    pub full_name: Option<String>,
    #[serde(alias = "organization_name")]
    pub organization_name: Option<String>,
    #[serde(alias = "role_job_title")]
    pub role_job_title: Option<String>,
    #[serde(alias = "recaptcha_token")]
    pub recaptcha_token: Option<String>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
    #[serde(alias = "recaptcha_token")]
    pub recaptcha_token: Option<String>,
}

#[derive(Serialize, Debug)]
pub struct LoginResponse {
    pub token: String,
    pub user: User,
}

#[derive(Deserialize, Debug)]
pub struct VerifyRequest {
    pub token: String,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalAction {
    Approve,
    Reject,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalActionRequest {
    #[serde(alias = "user_id")]
    pub user_id: Uuid,
    pub action: ApprovalAction,
    pub reason: Option<String>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct BulkIdsRequest {
    #[serde(alias = "user_ids")]
    pub user_ids: Vec<Uuid>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct BulkRejectRequest {
    #[serde(alias = "user_ids")]
    pub user_ids: Vec<Uuid>,
    #[serde(default)]
    pub reason: String,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct BulkUserRow {
    pub email: Option<String>,
    #[serde(alias = "full_name")]
    pub full_name: Option<String>,
    #[serde(alias = "organization_name")]
    pub organization_name: Option<String>,
    #[serde(alias = "role_job_title")]
    pub role_job_title: Option<String>,
    pub password: Option<String>,
    pub status: Option<String>,
}

#[derive(Deserialize, Debug)]
pub struct BulkUploadRequest {
    pub users: Vec<BulkUserRow>,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct BulkRowResult {
    pub row: usize,
    pub email: Option<String>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ChangePasswordRequest {
    #[serde(alias = "current_password")]
    pub current_password: String,
    #[serde(alias = "new_password")]
    pub new_password: String,
}

#[derive(Deserialize, Debug)]
pub struct ForgotPasswordRequest {
    pub email: String,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ResetPasswordRequest {
    pub token: String,
    #[serde(alias = "new_password")]
    pub new_password: String,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct CreateAdminRequest {
    pub email: String,
    pub password: String,
    #[serde(alias = "full_name")]
    pub full_name: Option<String>,
    pub role: Role,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct RenameDocumentRequest {
    #[serde(alias = "new_name")]
    pub new_name: String,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct MoveDocumentRequest {
    #[serde(alias = "source_path")]
    pub source_path: String,
    #[serde(alias = "destination_folder")]
    pub destination_folder: String,
}
