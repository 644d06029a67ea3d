use crate::config::{DbPool, DB_INIT_SQL};
use crate::errors::ApiError;
use crate::models::*;
use crate::store::PortalStore;
use actix_web::web;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::connection::SimpleConnection;
use diesel::pg::PgConnection;
use diesel::prelude::*;
use diesel::r2d2::{self, ConnectionManager};
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use log::{debug, error, info};
use uuid::Uuid;

/// Runs the schema script and builds the connection pool.
pub fn init_pool(db_url: &str) -> Result<DbPool, ApiError> {
    let mut conn = PgConnection::establish(db_url).map_err(|e| {
        error!("Failed to establish connection for schema setup: {}", e);
        ApiError::DatabaseError(e.to_string())
    })?;
    conn.batch_execute(DB_INIT_SQL).map_err(|e| {
        error!("Failed to execute database initialization script: {}", e);
        ApiError::DatabaseError(e.to_string())
    })?;
    info!("Database initialization complete.");

    let manager = ConnectionManager::<PgConnection>::new(db_url);
    r2d2::Pool::builder().build(manager).map_err(ApiError::from)
}

fn map_diesel(e: DieselError) -> ApiError {
    match e {
        DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, info) => {
            debug!("Unique constraint violated: {}", info.message());
            ApiError::ConflictError("Email already exists".to_string())
        }
        DieselError::NotFound => ApiError::NotFoundError("Record not found".to_string()),
        other => {
            error!("Query failed: {}", other);
            ApiError::DatabaseError(other.to_string())
        }
    }
}

#[derive(Insertable)]
#[diesel(table_name = crate::schema::settings)]
struct NewSettingsRow {
    admin_id: Option<Uuid>,
    notify_on_approve: Option<bool>,
    notify_on_reject: Option<bool>,
    notify_on_delete: Option<bool>,
    notify_on_registration: Option<bool>,
}

#[derive(Clone)]
pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn run<F, T>(&self, query: F) -> Result<T, ApiError>
    where
        F: FnOnce(&mut PgConnection) -> Result<T, DieselError> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool.clone();
        web::block(move || {
            let mut conn = pool.get()?;
            query(&mut conn).map_err(map_diesel)
        })
        .await?
    }
}

fn load_settings_row(conn: &mut PgConnection, admin: Option<Uuid>) -> Result<Option<SettingsRow>, DieselError> {
    use crate::schema::settings::dsl as s;

    let mut query = s::settings.select(SettingsRow::as_select()).into_boxed();
    query = match admin {
        Some(id) => query.filter(s::admin_id.eq(id)),
        None => query.filter(s::admin_id.is_null()),
    };
    query.first(conn).optional()
}

#[async_trait]
impl PortalStore for PgStore {
    async fn find_user_by_id(&self, user_id: Uuid) -> Result<Option<User>, ApiError> {
        self.run(move |conn| {
            use crate::schema::users::dsl::*;
            users.find(user_id).select(UserRow::as_select()).first(conn).optional()
        })
        .await
        .map(|row| row.map(User::from))
    }

    async fn find_user_by_email(&self, email_addr: &str) -> Result<Option<User>, ApiError> {
        let normalized = normalize_email(email_addr);
        self.run(move |conn| {
            use crate::schema::users::dsl::*;
            users
                .filter(email.eq(normalized))
                .select(UserRow::as_select())
                .first(conn)
                .optional()
        })
        .await
        .map(|row| row.map(User::from))
    }

    async fn find_users_by_ids(&self, ids: &[Uuid]) -> Result<Vec<User>, ApiError> {
        let ids = ids.to_vec();
        let rows = self
            .run(move |conn| {
                use crate::schema::users::dsl::*;
                users.filter(id.eq_any(ids)).select(UserRow::as_select()).load(conn)
            })
            .await?;
        Ok(rows.into_iter().map(User::from).collect())
    }

    async fn insert_user(&self, user: NewUser) -> Result<User, ApiError> {
        let row = NewUserRow::from(user);
        let created = self
            .run(move |conn| {
                use crate::schema::users::dsl::*;
                diesel::insert_into(users)
                    .values(&row)
                    .returning(UserRow::as_select())
                    .get_result(conn)
            })
            .await?;
        info!("Created user {} ({})", created.id, created.email);
        Ok(User::from(created))
    }

    async fn list_users(&self, scope: UserScope) -> Result<Vec<User>, ApiError> {
        let rows = self
            .run(move |conn| {
                use crate::schema::users::dsl::*;
                let mut query = users.select(UserRow::as_select()).into_boxed();
                query = match scope {
                    UserScope::Members => query,
                    UserScope::Pending => query.filter(approval_status.eq(ApprovalStatus::Pending.as_str())),
                    UserScope::Admins => query.filter(role.ne(Role::User.as_str()).or(is_admin.eq(true))),
                };
                query.order(created_at.desc()).load(conn)
            })
            .await?;

        // Legacy rows only resolve their role after normalization.
        Ok(rows
            .into_iter()
            .map(User::from)
            .filter(|u| scope.contains(u))
            .collect())
    }

    async fn apply_approval(&self, ids: &[Uuid], change: &ApprovalChange) -> Result<Vec<User>, ApiError> {
        let ids = ids.to_vec();
        let change = change.clone();
        let rows = self
            .run(move |conn| {
                use crate::schema::users::dsl::*;
                let values = (
                    is_approved.eq(Some(change.decision.is_approved())),
                    approval_status.eq(change.decision.status().as_str()),
                    approved_by.eq(Some(change.admin_id)),
                    approved_at.eq(Some(change.at)),
                    rejection_reason.eq(change.decision.rejection_reason()),
                    updated_at.eq(change.at),
                );
                let members = users
                    .filter(id.eq_any(ids))
                    .filter(role.eq(Role::User.as_str()))
                    .filter(is_admin.is_null().or(is_admin.eq(false)));

                match (change.only_eligible, &change.decision) {
                    (false, _) => diesel::update(members)
                        .set(values)
                        .returning(UserRow::as_select())
                        .get_results(conn),
                    (true, Decision::Approve) => {
                        diesel::update(members.filter(is_approved.is_null().or(is_approved.eq(false))))
                            .set(values)
                            .returning(UserRow::as_select())
                            .get_results(conn)
                    }
                    (true, Decision::Reject { .. }) => {
                        diesel::update(members.filter(approval_status.ne(ApprovalStatus::Rejected.as_str())))
                            .set(values)
                            .returning(UserRow::as_select())
                            .get_results(conn)
                    }
                }
            })
            .await?;
        Ok(rows.into_iter().map(User::from).collect())
    }

    async fn delete_users(&self, ids: &[Uuid]) -> Result<Vec<User>, ApiError> {
        let ids = ids.to_vec();
        let rows = self
            .run(move |conn| {
                use crate::schema::users::dsl::*;
                diesel::delete(users.filter(id.eq_any(ids)))
                    .returning(UserRow::as_select())
                    .get_results(conn)
            })
            .await?;
        Ok(rows.into_iter().map(User::from).collect())
    }

    async fn record_login(&self, user_id: Uuid, at: DateTime<Utc>) -> Result<(), ApiError> {
        self.run(move |conn| {
            use crate::schema::users::dsl::*;
            diesel::update(users.find(user_id))
                .set(last_login_at.eq(Some(at)))
                .execute(conn)
        })
        .await?;
        Ok(())
    }

    async fn update_password(&self, user_id: Uuid, new_hash: String) -> Result<(), ApiError> {
        let changed = self
            .run(move |conn| {
                use crate::schema::users::dsl::*;
                diesel::update(users.find(user_id))
                    .set((
                        password_hash.eq(new_hash),
                        is_first_time.eq(false),
                        updated_at.eq(Utc::now()),
                    ))
                    .execute(conn)
            })
            .await?;
        if changed == 0 {
            return Err(ApiError::NotFoundError("User not found".to_string()));
        }
        Ok(())
    }

    async fn update_profile(&self, user_id: Uuid, profile: ProfileUpdate) -> Result<User, ApiError> {
        let changeset = ProfileChangeset {
            full_name: profile.full_name,
            organization_name: profile.organization_name,
            role_job_title: profile.role_job_title,
            updated_at: Utc::now(),
        };
        let row = self
            .run(move |conn| {
                use crate::schema::users::dsl::*;
                diesel::update(users.find(user_id))
                    .set(&changeset)
                    .returning(UserRow::as_select())
                    .get_result(conn)
            })
            .await
            .map_err(|e| match e {
                ApiError::NotFoundError(_) => ApiError::NotFoundError("User not found".to_string()),
                other => other,
            })?;
        Ok(User::from(row))
    }

    async fn load_settings(&self, admin: Option<Uuid>) -> Result<Option<SettingsRow>, ApiError> {
        self.run(move |conn| load_settings_row(conn, admin)).await
    }

    async fn save_settings(&self, admin: Option<Uuid>, update: &SettingsUpdate) -> Result<SettingsRow, ApiError> {
        let update = update.clone();
        self.run(move |conn| {
            use crate::schema::settings::dsl as s;

            conn.transaction(|conn| {
                let existing = load_settings_row(conn, admin)?;
                let empty = update == SettingsUpdate::default();
                match existing {
                    Some(row) if empty => Ok(row),
                    Some(row) => diesel::update(s::settings.find(row.id))
                        .set((&update, s::updated_at.eq(Utc::now())))
                        .returning(SettingsRow::as_select())
                        .get_result(conn),
                    None => diesel::insert_into(s::settings)
                        .values(NewSettingsRow {
                            admin_id: admin,
                            notify_on_approve: update.notify_on_approve,
                            notify_on_reject: update.notify_on_reject,
                            notify_on_delete: update.notify_on_delete,
                            notify_on_registration: update.notify_on_registration,
                        })
                        .returning(SettingsRow::as_select())
                        .get_result(conn),
                }
            })
        })
        .await
    }

    async fn find_template(&self, template_key: &str) -> Result<Option<EmailTemplate>, ApiError> {
        let template_key = template_key.to_string();
        self.run(move |conn| {
            use crate::schema::email_templates::dsl::*;
            email_templates
                .filter(key.eq(template_key))
                .select(EmailTemplate::as_select())
                .first(conn)
                .optional()
        })
        .await
    }

    async fn list_templates(&self) -> Result<Vec<EmailTemplate>, ApiError> {
        self.run(|conn| {
            use crate::schema::email_templates::dsl::*;
            email_templates.order(key.asc()).select(EmailTemplate::as_select()).load(conn)
        })
        .await
    }

    async fn upsert_template(&self, template: NewEmailTemplate) -> Result<EmailTemplate, ApiError> {
        self.run(move |conn| {
            use crate::schema::email_templates::dsl::*;
            diesel::insert_into(email_templates)
                .values(&template)
                .on_conflict(key)
                .do_update()
                .set((
                    subject.eq(&template.subject),
                    html_body.eq(&template.html_body),
                    text_body.eq(&template.text_body),
                    updated_at.eq(Utc::now()),
                ))
                .returning(EmailTemplate::as_select())
                .get_result(conn)
        })
        .await
    }

    async fn insert_password_reset(&self, reset: NewPasswordReset) -> Result<(), ApiError> {
        self.run(move |conn| {
            use crate::schema::password_resets::dsl::*;
            diesel::insert_into(password_resets).values(&reset).execute(conn)
        })
        .await?;
        Ok(())
    }

    async fn consume_password_reset(&self, hash: &str, now: DateTime<Utc>) -> Result<Option<Uuid>, ApiError> {
        let hash = hash.to_string();
        self.run(move |conn| {
            use crate::schema::password_resets::dsl::*;
            diesel::update(
                password_resets
                    .filter(token_hash.eq(hash))
                    .filter(used_at.is_null())
                    .filter(expires_at.gt(now)),
            )
            .set(used_at.eq(Some(now)))
            .returning(user_id)
            .get_result::<Uuid>(conn)
            .optional()
        })
        .await
    }
}
