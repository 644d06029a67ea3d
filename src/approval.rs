//! Approval workflow for member accounts: single and bulk decisions, deletes
//! and bulk account creation.
//!
//! Every state change is committed through [`PortalStore`](crate::store::PortalStore)
//! first; the matching emails are queued afterwards and can never fail the
//! request. Bulk decisions are split into batches of [`BATCH_SIZE`] ids, one
//! conditional update each, and a failing batch does not stop the ones after it.

use crate::auth::{hash_password, validate_email, validate_password};
use crate::errors::ApiError;
use crate::models::*;
use crate::notifications::{Notification, TemplateKey};
use crate::state::AppState;
use chrono::Utc;
use log::{debug, error, info, warn};
use serde::Serialize;
use std::collections::HashSet;
use tokio::sync::OnceCell;
use uuid::Uuid;

pub const BATCH_SIZE: usize = 100;

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct FailedBatch {
    pub index: usize,
    pub user_ids: Vec<Uuid>,
    pub error: String,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct BulkOutcome {
    /// Distinct ids in the request
    pub requested: usize,
    pub updated: usize,
    pub updated_ids: Vec<Uuid>,
    pub failed_batches: Vec<FailedBatch>,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct DeleteOutcome {
    pub requested: usize,
    pub deleted: usize,
    pub deleted_ids: Vec<Uuid>,
}

/// Drops repeated ids, keeping first-seen order.
pub fn dedupe_ids(ids: &[Uuid]) -> Vec<Uuid> {
    let mut seen = HashSet::new();
    ids.iter().copied().filter(|id| seen.insert(*id)).collect()
}

pub struct ApprovalService;

impl ApprovalService {
    pub async fn list_pending(state: &AppState) -> Result<Vec<User>, ApiError> {
        state.store.list_users(UserScope::Pending).await
    }

    pub async fn approve(state: &AppState, admin: &User, user_id: Uuid) -> Result<User, ApiError> {
        Self::decide(state, admin, user_id, Decision::Approve).await
    }

    pub async fn reject(
        state: &AppState,
        admin: &User,
        user_id: Uuid,
        reason: Option<String>,
    ) -> Result<User, ApiError> {
        let reason = clean_text(reason);
        Self::decide(state, admin, user_id, Decision::Reject { reason }).await
    }

    /// Applied unconditionally, so a rejected member can be approved again
    /// and an approved one rejected.
    async fn decide(state: &AppState, admin: &User, user_id: Uuid, decision: Decision) -> Result<User, ApiError> {
        let target = state
            .store
            .find_user_by_id(user_id)
            .await?
            .ok_or_else(|| ApiError::NotFoundError("User not found".to_string()))?;
        if target.role != Role::User {
            return Err(ApiError::ForbiddenError(
                "Admin accounts are managed separately".to_string(),
            ));
        }

        let change = ApprovalChange {
            decision,
            admin_id: admin.id,
            at: Utc::now(),
            only_eligible: false,
        };
        let user = state
            .store
            .apply_approval(&[user_id], &change)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| ApiError::NotFoundError("User not found".to_string()))?;

        info!("Admin {} set user {} to {}", admin.id, user.id, user.approval_status);
        Self::notify_decision(state, admin, &change.decision, std::slice::from_ref(&user)).await;
        Ok(user)
    }

    pub async fn bulk_approve(state: &AppState, admin: &User, user_ids: &[Uuid]) -> Result<BulkOutcome, ApiError> {
        Self::bulk_decide(state, admin, user_ids, Decision::Approve).await
    }

    pub async fn bulk_reject(
        state: &AppState,
        admin: &User,
        user_ids: &[Uuid],
        reason: &str,
    ) -> Result<BulkOutcome, ApiError> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(ApiError::ValidationError("Rejection reason is required".to_string()));
        }
        let decision = Decision::Reject {
            reason: Some(reason.to_string()),
        };
        Self::bulk_decide(state, admin, user_ids, decision).await
    }

    async fn bulk_decide(
        state: &AppState,
        admin: &User,
        user_ids: &[Uuid],
        decision: Decision,
    ) -> Result<BulkOutcome, ApiError> {
        if user_ids.is_empty() {
            return Err(ApiError::ValidationError("userIds must not be empty".to_string()));
        }

        let ids = dedupe_ids(user_ids);
        let change = ApprovalChange {
            decision,
            admin_id: admin.id,
            at: Utc::now(),
            only_eligible: true,
        };

        let mut updated = Vec::new();
        let mut failed_batches = Vec::new();
        let mut batch_count = 0;

        for (index, batch) in ids.chunks(BATCH_SIZE).enumerate() {
            batch_count += 1;
            match state.store.apply_approval(batch, &change).await {
                Ok(rows) => {
                    debug!("Batch {} updated {} of {} users", index, rows.len(), batch.len());
                    updated.extend(rows);
                }
                Err(e) => {
                    error!("Batch {} of {} ids failed: {}", index, batch.len(), e);
                    failed_batches.push(FailedBatch {
                        index,
                        user_ids: batch.to_vec(),
                        error: e.public_message(),
                    });
                }
            }
        }

        if failed_batches.len() == batch_count {
            return Err(ApiError::DependencyError(format!(
                "All {} batches failed while setting users to {}",
                batch_count,
                change.decision.status()
            )));
        }

        info!(
            "Admin {} set {} of {} users to {} ({} failed batches)",
            admin.id,
            updated.len(),
            ids.len(),
            change.decision.status(),
            failed_batches.len()
        );
        Self::notify_decision(state, admin, &change.decision, &updated).await;

        Ok(BulkOutcome {
            requested: ids.len(),
            updated: updated.len(),
            updated_ids: updated.iter().map(|u| u.id).collect(),
            failed_batches,
        })
    }

    pub async fn delete_user(state: &AppState, admin: &User, user_id: Uuid) -> Result<User, ApiError> {
        if state.store.find_user_by_id(user_id).await?.is_none() {
            return Err(ApiError::NotFoundError("User not found".to_string()));
        }
        Self::delete_members(state, admin, &[user_id])
            .await?
            .pop()
            .ok_or_else(|| ApiError::NotFoundError("User not found".to_string()))
    }

    /// All or nothing: one admin id or the caller's own id refuses the whole request.
    pub async fn bulk_delete(state: &AppState, admin: &User, user_ids: &[Uuid]) -> Result<DeleteOutcome, ApiError> {
        if user_ids.is_empty() {
            return Err(ApiError::ValidationError("userIds must not be empty".to_string()));
        }
        let ids = dedupe_ids(user_ids);
        let deleted = Self::delete_members(state, admin, &ids).await?;

        Ok(DeleteOutcome {
            requested: ids.len(),
            deleted: deleted.len(),
            deleted_ids: deleted.iter().map(|u| u.id).collect(),
        })
    }

    async fn delete_members(state: &AppState, admin: &User, ids: &[Uuid]) -> Result<Vec<User>, ApiError> {
        if ids.contains(&admin.id) {
            warn!("Admin {} tried to delete their own account", admin.id);
            return Err(ApiError::ForbiddenError("You cannot delete your own account".to_string()));
        }

        let targets = state.store.find_users_by_ids(ids).await?;
        if let Some(protected) = targets.iter().find(|u| u.role != Role::User) {
            warn!("Admin {} tried to delete admin account {}", admin.id, protected.id);
            return Err(ApiError::ForbiddenError(
                "Admin accounts cannot be deleted from user management".to_string(),
            ));
        }

        let deleted = state.store.delete_users(ids).await?;
        info!("Admin {} deleted {} users", admin.id, deleted.len());

        match state.store.effective_settings(Some(admin.id)).await {
            Ok(settings) if settings.notify_on_delete => {
                for user in &deleted {
                    state
                        .notifications
                        .enqueue(Notification::for_user(TemplateKey::AccountDeleted, user));
                }
            }
            Ok(_) => debug!("Deletion emails are turned off for admin {}", admin.id),
            Err(e) => warn!("Could not load notification settings, skipping deletion emails: {}", e),
        }

        Ok(deleted)
    }

    async fn notify_decision(state: &AppState, admin: &User, decision: &Decision, users: &[User]) {
        if users.is_empty() {
            return;
        }

        let settings = match state.store.effective_settings(Some(admin.id)).await {
            Ok(settings) => settings,
            Err(e) => {
                warn!("Could not load notification settings, skipping {} emails: {}", users.len(), e);
                return;
            }
        };

        let (enabled, template) = match decision {
            Decision::Approve => (settings.notify_on_approve, TemplateKey::AccountApproved),
            Decision::Reject { .. } => (settings.notify_on_reject, TemplateKey::AccountRejected),
        };
        if !enabled {
            debug!("{} emails are turned off for admin {}", template.as_str(), admin.id);
            return;
        }

        let reason = decision
            .rejection_reason()
            .unwrap_or_else(|| "No reason was given".to_string());
        for user in users {
            let mut notification =
                Notification::for_user(template, user).with("app_url", state.config.app_base_url.clone());
            if !decision.is_approved() {
                notification = notification.with("reason", reason.clone());
            }
            state.notifications.enqueue(notification);
        }
    }

    /// One result per row, in upload order. A failing row never stops the rest.
    pub async fn bulk_create(
        state: &AppState,
        admin: &User,
        rows: Vec<BulkUserRow>,
    ) -> Result<Vec<BulkRowResult>, ApiError> {
        if rows.is_empty() {
            return Err(ApiError::ValidationError("users must not be empty".to_string()));
        }

        let default_hash = OnceCell::new();
        let mut seen = HashSet::new();
        let mut results = Vec::with_capacity(rows.len());

        for (index, row) in rows.into_iter().enumerate() {
            let email = row
                .email
                .as_deref()
                .map(normalize_email)
                .filter(|e| !e.is_empty());

            let result = match Self::create_row(state, admin, row, &default_hash, &mut seen).await {
                Ok(user) => BulkRowResult {
                    row: index + 1,
                    email: Some(user.email),
                    success: true,
                    user_id: Some(user.id),
                    error: None,
                },
                Err(e) => {
                    debug!("Bulk upload row {} failed: {}", index + 1, e);
                    BulkRowResult {
                        row: index + 1,
                        email,
                        success: false,
                        user_id: None,
                        error: Some(e.public_message()),
                    }
                }
            };
            results.push(result);
        }

        let created = results.iter().filter(|r| r.success).count();
        info!(
            "Admin {} bulk created {} of {} users",
            admin.id,
            created,
            results.len()
        );
        Ok(results)
    }

    async fn create_row(
        state: &AppState,
        admin: &User,
        row: BulkUserRow,
        default_hash: &OnceCell<String>,
        seen: &mut HashSet<String>,
    ) -> Result<User, ApiError> {
        let email = row
            .email
            .as_deref()
            .map(normalize_email)
            .filter(|e| !e.is_empty())
            .ok_or_else(|| ApiError::ValidationError("Email is required".to_string()))?;
        validate_email(&email)?;
        let full_name = clean_text(row.full_name)
            .ok_or_else(|| ApiError::ValidationError("Full name is required".to_string()))?;

        if !seen.insert(email.clone()) {
            return Err(ApiError::ValidationError("Duplicate email in upload".to_string()));
        }
        if state.store.find_user_by_email(&email).await?.is_some() {
            return Err(ApiError::ConflictError("Email already exists".to_string()));
        }

        let (password_hash, is_first_time) = match clean_text(row.password) {
            Some(password) => {
                validate_password(&password)?;
                (hash_password(&password)?, false)
            }
            None => {
                let hashed = default_hash
                    .get_or_try_init(|| async { hash_password(&state.config.default_user_password) })
                    .await?;
                (hashed.clone(), true)
            }
        };

        let approved = row
            .status
            .as_deref()
            .is_some_and(|s| s.trim().eq_ignore_ascii_case("approved"));

        state
            .store
            .insert_user(NewUser {
                email,
                password_hash,
                full_name: Some(full_name),
                organization_name: clean_text(row.organization_name),
                role_job_title: clean_text(row.role_job_title),
                role: Role::User,
                approval: approved.then(|| (admin.id, Utc::now())),
                is_first_time,
            })
            .await
    }
}
