//! Persistence gateway. Handlers and services only talk to [`PortalStore`];
//! `PgStore` (see `db.rs`) backs production and [`MemoryStore`] backs local
//! runs and tests.

use crate::errors::ApiError;
use crate::models::*;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use uuid::Uuid;

#[async_trait]
pub trait PortalStore: Send + Sync {
    async fn find_user_by_id(&self, id: Uuid) -> Result<Option<User>, ApiError>;

    /// Lookup is case-insensitive.
    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, ApiError>;

    async fn find_users_by_ids(&self, ids: &[Uuid]) -> Result<Vec<User>, ApiError>;

    /// Fails with `ConflictError` when the email is already taken.
    async fn insert_user(&self, user: NewUser) -> Result<User, ApiError>;

    async fn list_users(&self, scope: UserScope) -> Result<Vec<User>, ApiError>;

    /// One conditional update over `ids`. Returns the rows actually changed.
    async fn apply_approval(&self, ids: &[Uuid], change: &ApprovalChange) -> Result<Vec<User>, ApiError>;

    /// Hard delete. Returns the rows that existed.
    async fn delete_users(&self, ids: &[Uuid]) -> Result<Vec<User>, ApiError>;

    async fn record_login(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), ApiError>;

    /// Stores a new hash and clears `is_first_time`.
    async fn update_password(&self, id: Uuid, password_hash: String) -> Result<(), ApiError>;

    async fn update_profile(&self, id: Uuid, profile: ProfileUpdate) -> Result<User, ApiError>;

    /// `None` reads the global row.
    async fn load_settings(&self, admin_id: Option<Uuid>) -> Result<Option<SettingsRow>, ApiError>;

    async fn save_settings(&self, admin_id: Option<Uuid>, update: &SettingsUpdate) -> Result<SettingsRow, ApiError>;

    async fn find_template(&self, key: &str) -> Result<Option<EmailTemplate>, ApiError>;

    async fn list_templates(&self) -> Result<Vec<EmailTemplate>, ApiError>;

    async fn upsert_template(&self, template: NewEmailTemplate) -> Result<EmailTemplate, ApiError>;

    async fn insert_password_reset(&self, reset: NewPasswordReset) -> Result<(), ApiError>;

    /// Marks a matching unexpired, unused token as used and returns its owner.
    async fn consume_password_reset(&self, token_hash: &str, now: DateTime<Utc>) -> Result<Option<Uuid>, ApiError>;

    /// Global settings overridden by the admin's own row.
    async fn effective_settings(&self, admin_id: Option<Uuid>) -> Result<NotificationSettings, ApiError> {
        let global = self.load_settings(None).await?;
        let own = match admin_id {
            Some(id) => self.load_settings(Some(id)).await?,
            None => None,
        };
        Ok(NotificationSettings::merge(global.as_ref(), own.as_ref()))
    }
}

#[derive(Debug, Clone)]
struct StoredReset {
    user_id: Uuid,
    expires_at: DateTime<Utc>,
    used: bool,
}

#[derive(Default)]
struct MemoryState {
    users: HashMap<Uuid, User>,
    settings: Vec<SettingsRow>,
    templates: Vec<EmailTemplate>,
    resets: HashMap<String, StoredReset>,
    next_id: i32,
    batch_sizes: Vec<usize>,
    failing_ids: HashSet<Uuid>,
}

/// In-process store with the same semantics as the Postgres one.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryState>, ApiError> {
        self.state
            .lock()
            .map_err(|_| ApiError::InternalError("memory store lock poisoned".to_string()))
    }

    /// Sizes of every `apply_approval` call so far, in call order.
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.lock().map(|s| s.batch_sizes.clone()).unwrap_or_default()
    }

    /// Any later write touching `id` fails with a database error.
    pub fn fail_writes_for(&self, id: Uuid) {
        if let Ok(mut state) = self.lock() {
            state.failing_ids.insert(id);
        }
    }

    fn check_faults(state: &MemoryState, ids: &[Uuid]) -> Result<(), ApiError> {
        match ids.iter().find(|id| state.failing_ids.contains(id)) {
            Some(id) => Err(ApiError::DatabaseError(format!("write rejected for {}", id))),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl PortalStore for MemoryStore {
    async fn find_user_by_id(&self, id: Uuid) -> Result<Option<User>, ApiError> {
        Ok(self.lock()?.users.get(&id).cloned())
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, ApiError> {
        let email = normalize_email(email);
        Ok(self.lock()?.users.values().find(|u| u.email == email).cloned())
    }

    async fn find_users_by_ids(&self, ids: &[Uuid]) -> Result<Vec<User>, ApiError> {
        let state = self.lock()?;
        Ok(ids.iter().filter_map(|id| state.users.get(id).cloned()).collect())
    }

    async fn insert_user(&self, user: NewUser) -> Result<User, ApiError> {
        let row = NewUserRow::from(user);
        let mut state = self.lock()?;
        if state.users.values().any(|u| u.email == row.email) {
            return Err(ApiError::ConflictError("Email already exists".to_string()));
        }

        let now = Utc::now();
        let user = User::from(UserRow {
            id: Uuid::new_v4(),
            email: row.email,
            password_hash: row.password_hash,
            full_name: row.full_name,
            organization_name: row.organization_name,
            role_job_title: row.role_job_title,
            role: row.role,
            is_admin: None,
            is_approved: row.is_approved,
            approval_status: row.approval_status,
            approved_by: row.approved_by,
            approved_at: row.approved_at,
            rejection_reason: None,
            created_at: now,
            updated_at: now,
            last_login_at: None,
            is_first_time: row.is_first_time,
        });
        state.users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn list_users(&self, scope: UserScope) -> Result<Vec<User>, ApiError> {
        let state = self.lock()?;
        let mut users: Vec<User> = state.users.values().filter(|u| scope.contains(u)).cloned().collect();
        users.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(users)
    }

    async fn apply_approval(&self, ids: &[Uuid], change: &ApprovalChange) -> Result<Vec<User>, ApiError> {
        let mut state = self.lock()?;
        state.batch_sizes.push(ids.len());
        Self::check_faults(&state, ids)?;

        let mut updated = Vec::new();
        for id in ids {
            if let Some(user) = state.users.get_mut(id) {
                if !change.applies_to(user) {
                    continue;
                }
                user.is_approved = Some(change.decision.is_approved());
                user.approval_status = change.decision.status();
                user.approved_by = Some(change.admin_id);
                user.approved_at = Some(change.at);
                user.rejection_reason = change.decision.rejection_reason();
                user.updated_at = change.at;
                updated.push(user.clone());
            }
        }
        Ok(updated)
    }

    async fn delete_users(&self, ids: &[Uuid]) -> Result<Vec<User>, ApiError> {
        let mut state = self.lock()?;
        Self::check_faults(&state, ids)?;
        let deleted: Vec<User> = ids.iter().filter_map(|id| state.users.remove(id)).collect();
        state
            .settings
            .retain(|s| s.admin_id.map_or(true, |a| !ids.contains(&a)));
        state.resets.retain(|_, r| !ids.contains(&r.user_id));
        Ok(deleted)
    }

    async fn record_login(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), ApiError> {
        if let Some(user) = self.lock()?.users.get_mut(&id) {
            user.last_login_at = Some(at);
        }
        Ok(())
    }

    async fn update_password(&self, id: Uuid, password_hash: String) -> Result<(), ApiError> {
        let mut state = self.lock()?;
        let user = state
            .users
            .get_mut(&id)
            .ok_or_else(|| ApiError::NotFoundError("User not found".to_string()))?;
        user.password_hash = password_hash;
        user.is_first_time = false;
        user.updated_at = Utc::now();
        Ok(())
    }

    async fn update_profile(&self, id: Uuid, profile: ProfileUpdate) -> Result<User, ApiError> {
        let mut state = self.lock()?;
        let user = state
            .users
            .get_mut(&id)
            .ok_or_else(|| ApiError::NotFoundError("User not found".to_string()))?;
        if profile.full_name.is_some() {
            user.full_name = profile.full_name;
        }
        if profile.organization_name.is_some() {
            user.organization_name = profile.organization_name;
        }
        if profile.role_job_title.is_some() {
            user.role_job_title = profile.role_job_title;
        }
        user.updated_at = Utc::now();
        Ok(user.clone())
    }

    async fn load_settings(&self, admin_id: Option<Uuid>) -> Result<Option<SettingsRow>, ApiError> {
        Ok(self.lock()?.settings.iter().find(|s| s.admin_id == admin_id).cloned())
    }

    async fn save_settings(&self, admin_id: Option<Uuid>, update: &SettingsUpdate) -> Result<SettingsRow, ApiError> {
        let mut state = self.lock()?;
        let now = Utc::now();
        if let Some(row) = state.settings.iter_mut().find(|s| s.admin_id == admin_id) {
            row.notify_on_approve = update.notify_on_approve.or(row.notify_on_approve);
            row.notify_on_reject = update.notify_on_reject.or(row.notify_on_reject);
            row.notify_on_delete = update.notify_on_delete.or(row.notify_on_delete);
            row.notify_on_registration = update.notify_on_registration.or(row.notify_on_registration);
            row.updated_at = now;
            return Ok(row.clone());
        }

        state.next_id += 1;
        let row = SettingsRow {
            id: state.next_id,
            admin_id,
            notify_on_approve: update.notify_on_approve,
            notify_on_reject: update.notify_on_reject,
            notify_on_delete: update.notify_on_delete,
            notify_on_registration: update.notify_on_registration,
            updated_at: now,
        };
        state.settings.push(row.clone());
        Ok(row)
    }

    async fn find_template(&self, key: &str) -> Result<Option<EmailTemplate>, ApiError> {
        Ok(self.lock()?.templates.iter().find(|t| t.key == key).cloned())
    }

    async fn list_templates(&self) -> Result<Vec<EmailTemplate>, ApiError> {
        let mut templates = self.lock()?.templates.clone();
        templates.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(templates)
    }

    async fn upsert_template(&self, template: NewEmailTemplate) -> Result<EmailTemplate, ApiError> {
        let mut state = self.lock()?;
        let now = Utc::now();
        if let Some(existing) = state.templates.iter_mut().find(|t| t.key == template.key) {
            existing.subject = template.subject;
            existing.html_body = template.html_body;
            existing.text_body = template.text_body;
            existing.updated_at = now;
            return Ok(existing.clone());
        }

        state.next_id += 1;
        let stored = EmailTemplate {
            id: state.next_id,
            key: template.key,
            subject: template.subject,
            html_body: template.html_body,
            text_body: template.text_body,
            updated_at: now,
        };
        state.templates.push(stored.clone());
        Ok(stored)
    }

    async fn insert_password_reset(&self, reset: NewPasswordReset) -> Result<(), ApiError> {
        self.lock()?.resets.insert(
            reset.token_hash,
            StoredReset {
                user_id: reset.user_id,
                expires_at: reset.expires_at,
                used: false,
            },
        );
        Ok(())
    }

    async fn consume_password_reset(&self, token_hash: &str, now: DateTime<Utc>) -> Result<Option<Uuid>, ApiError> {
        let mut state = self.lock()?;
        match state.resets.get_mut(token_hash) {
            Some(reset) if !reset.used && reset.expires_at > now => {
                reset.used = true;
                Ok(Some(reset.user_id))
            }
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn email_uniqueness_ignores_case() {
        let store = MemoryStore::new();
        store
            .insert_user(NewUser::pending("Jane@Example.org", "h".to_string()))
            .await
            .unwrap();

        let err = store
            .insert_user(NewUser::pending("jane@example.ORG", "h".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::ConflictError(_)));

        let found = store.find_user_by_email("JANE@example.org").await.unwrap();
        assert!(found.is_some());
    }

    #[tokio::test]
    async fn eligible_only_update_skips_approved_rows() {
        let store = MemoryStore::new();
        let pending = store.insert_user(NewUser::pending("a@x.org", "h".into())).await.unwrap();
        let mut approved = NewUser::pending("b@x.org", "h".into());
        let earlier = Utc::now() - Duration::days(3);
        let first_admin = Uuid::new_v4();
        approved.approval = Some((first_admin, earlier));
        let approved = store.insert_user(approved).await.unwrap();

        let change = ApprovalChange {
            decision: Decision::Approve,
            admin_id: Uuid::new_v4(),
            at: Utc::now(),
            only_eligible: true,
        };
        let updated = store.apply_approval(&[pending.id, approved.id], &change).await.unwrap();
        assert_eq!(updated.len(), 1);
        assert_eq!(updated[0].id, pending.id);

        let untouched = store.find_user_by_id(approved.id).await.unwrap().unwrap();
        assert_eq!(untouched.approved_by, Some(first_admin));
        assert_eq!(untouched.approved_at, Some(earlier));
    }

    #[tokio::test]
    async fn reset_tokens_are_single_use() {
        let store = MemoryStore::new();
        let user = store.insert_user(NewUser::pending("r@x.org", "h".into())).await.unwrap();
        store
            .insert_password_reset(NewPasswordReset {
                user_id: user.id,
                token_hash: "abc".to_string(),
                expires_at: Utc::now() + Duration::hours(1),
            })
            .await
            .unwrap();

        assert_eq!(store.consume_password_reset("abc", Utc::now()).await.unwrap(), Some(user.id));
        assert_eq!(store.consume_password_reset("abc", Utc::now()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn expired_reset_tokens_are_ignored() {
        let store = MemoryStore::new();
        let user = store.insert_user(NewUser::pending("e@x.org", "h".into())).await.unwrap();
        store
            .insert_password_reset(NewPasswordReset {
                user_id: user.id,
                token_hash: "old".to_string(),
                expires_at: Utc::now() - Duration::minutes(1),
            })
            .await
            .unwrap();
        assert_eq!(store.consume_password_reset("old", Utc::now()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn settings_override_merges_with_global() {
        let store = MemoryStore::new();
        let admin = Uuid::new_v4();
        store
            .save_settings(None, &SettingsUpdate { notify_on_delete: Some(false), ..Default::default() })
            .await
            .unwrap();
        store
            .save_settings(Some(admin), &SettingsUpdate { notify_on_approve: Some(false), ..Default::default() })
            .await
            .unwrap();

        let effective = store.effective_settings(Some(admin)).await.unwrap();
        assert!(!effective.notify_on_approve);
        assert!(!effective.notify_on_delete);
        assert!(effective.notify_on_reject);

        let global_only = store.effective_settings(None).await.unwrap();
        assert!(global_only.notify_on_approve);
    }
}
