use crate::approval::ApprovalService;
use crate::auth::{AdminUser, AuthenticatedUser, SuperAdminUser};
use crate::dashboard::{users_to_csv, UserTableQuery};
use crate::documents::{self, DocumentQuery};
use crate::errors::ApiError;
use crate::middleware::ApprovalGate;
use crate::models::*;
use crate::services::{AdminService, AuthService};
use crate::state::AppState;
use actix_multipart::Multipart;
use actix_web::http::header::CONTENT_DISPOSITION;
use actix_web::{web, HttpResponse};
use futures_util::TryStreamExt;
use log::{debug, warn};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

pub const MAX_UPLOAD_BYTES: usize = 50 * 1024 * 1024;

async fn method_not_allowed() -> Result<HttpResponse, ApiError> {
    Err(ApiError::MethodNotAllowed)
}

async fn route_not_found() -> Result<HttpResponse, ApiError> {
    Err(ApiError::NotFoundError("Route not found".to_string()))
}

/// A resource that answers 405 with a JSON body for unrouted methods.
fn resource(path: &str) -> actix_web::Resource {
    web::resource(path).default_service(web::to(method_not_allowed))
}

async fn health_check() -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

// Auth

async fn register(state: web::Data<AppState>, body: web::Json<RegisterRequest>) -> Result<HttpResponse, ApiError> {
    debug!("Registration request for {}", body.email);
    let user = AuthService::register(&state, body.into_inner()).await?;
    Ok(HttpResponse::Created().json(json!({
        "message": "Registration successful. Your account is pending approval.",
        "user": user
    })))
}

async fn login(state: web::Data<AppState>, body: web::Json<LoginRequest>) -> Result<HttpResponse, ApiError> {
    let response = AuthService::login(&state, body.into_inner()).await?;
    Ok(HttpResponse::Ok().json(response))
}

async fn admin_login(state: web::Data<AppState>, body: web::Json<LoginRequest>) -> Result<HttpResponse, ApiError> {
    let response = AuthService::admin_login(&state, body.into_inner()).await?;
    Ok(HttpResponse::Ok().json(response))
}

async fn verify(state: web::Data<AppState>, body: web::Json<VerifyRequest>) -> Result<HttpResponse, ApiError> {
    let (claims, user) = AuthService::verify(&state, &body.token).await?;
    Ok(HttpResponse::Ok().json(json!({
        "valid": true,
        "claims": claims,
        "user": user
    })))
}

async fn me(AuthenticatedUser(user): AuthenticatedUser) -> Result<HttpResponse, ApiError> {
    Ok(HttpResponse::Ok().json(user))
}

async fn update_profile(
    state: web::Data<AppState>,
    AuthenticatedUser(user): AuthenticatedUser,
    body: web::Json<ProfileUpdate>,
) -> Result<HttpResponse, ApiError> {
    let updated = AuthService::update_profile(&state, &user, body.into_inner()).await?;
    Ok(HttpResponse::Ok().json(updated))
}

async fn change_password(
    state: web::Data<AppState>,
    AuthenticatedUser(user): AuthenticatedUser,
    body: web::Json<ChangePasswordRequest>,
) -> Result<HttpResponse, ApiError> {
    AuthService::change_password(&state, &user, body.into_inner()).await?;
    Ok(HttpResponse::Ok().json(json!({ "message": "Password updated" })))
}

async fn forgot_password(
    state: web::Data<AppState>,
    body: web::Json<ForgotPasswordRequest>,
) -> Result<HttpResponse, ApiError> {
    AuthService::forgot_password(&state, &body.email).await?;
    Ok(HttpResponse::Ok().json(json!({
        "message": "If an account exists for that email, a reset link has been sent"
    })))
}

async fn reset_password(
    state: web::Data<AppState>,
    body: web::Json<ResetPasswordRequest>,
) -> Result<HttpResponse, ApiError> {
    AuthService::reset_password(&state, body.into_inner()).await?;
    Ok(HttpResponse::Ok().json(json!({ "message": "Password has been reset" })))
}

// Approval workflow

async fn list_pending(state: web::Data<AppState>, _admin: AdminUser) -> Result<HttpResponse, ApiError> {
    let users = ApprovalService::list_pending(&state).await?;
    Ok(HttpResponse::Ok().json(users))
}

async fn approval_action(
    state: web::Data<AppState>,
    AdminUser(admin): AdminUser,
    body: web::Json<ApprovalActionRequest>,
) -> Result<HttpResponse, ApiError> {
    let ApprovalActionRequest { user_id, action, reason } = body.into_inner();
    let user = match action {
        ApprovalAction::Approve => ApprovalService::approve(&state, &admin, user_id).await?,
        ApprovalAction::Reject => ApprovalService::reject(&state, &admin, user_id, reason).await?,
    };
    Ok(HttpResponse::Ok().json(json!({
        "message": format!("User {}", user.approval_status),
        "user": user
    })))
}

async fn bulk_approve(
    state: web::Data<AppState>,
    AdminUser(admin): AdminUser,
    body: web::Json<BulkIdsRequest>,
) -> Result<HttpResponse, ApiError> {
    let outcome = ApprovalService::bulk_approve(&state, &admin, &body.user_ids).await?;
    Ok(HttpResponse::Ok().json(outcome))
}

async fn bulk_reject(
    state: web::Data<AppState>,
    AdminUser(admin): AdminUser,
    body: web::Json<BulkRejectRequest>,
) -> Result<HttpResponse, ApiError> {
    let outcome = ApprovalService::bulk_reject(&state, &admin, &body.user_ids, &body.reason).await?;
    Ok(HttpResponse::Ok().json(outcome))
}

async fn bulk_delete(
    state: web::Data<AppState>,
    AdminUser(admin): AdminUser,
    body: web::Json<BulkIdsRequest>,
) -> Result<HttpResponse, ApiError> {
    let outcome = ApprovalService::bulk_delete(&state, &admin, &body.user_ids).await?;
    Ok(HttpResponse::Ok().json(outcome))
}

async fn bulk_upload(
    state: web::Data<AppState>,
    AdminUser(admin): AdminUser,
    body: web::Json<BulkUploadRequest>,
) -> Result<HttpResponse, ApiError> {
    let results = ApprovalService::bulk_create(&state, &admin, body.into_inner().users).await?;
    let created = results.iter().filter(|r| r.success).count();
    Ok(HttpResponse::Ok().json(json!({
        "created": created,
        "failed": results.len() - created,
        "results": results
    })))
}

async fn delete_user(
    state: web::Data<AppState>,
    AdminUser(admin): AdminUser,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, ApiError> {
    let deleted = ApprovalService::delete_user(&state, &admin, path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(json!({ "message": "User deleted", "id": deleted.id })))
}

// Dashboard

async fn list_all_users(
    state: web::Data<AppState>,
    _admin: AdminUser,
    query: web::Query<UserTableQuery>,
) -> Result<HttpResponse, ApiError> {
    let members = state.store.list_users(UserScope::Members).await?;
    Ok(HttpResponse::Ok().json(query.page(members)))
}

async fn export_users(
    state: web::Data<AppState>,
    _admin: AdminUser,
    query: web::Query<UserTableQuery>,
) -> Result<HttpResponse, ApiError> {
    let members = state.store.list_users(UserScope::Members).await?;
    let csv = users_to_csv(&query.select(members));
    Ok(HttpResponse::Ok()
        .content_type("text/csv; charset=utf-8")
        .insert_header((CONTENT_DISPOSITION, "attachment; filename=\"users.csv\""))
        .body(csv))
}

#[derive(Deserialize, Debug)]
struct SettingsScope {
    scope: Option<String>,
}

async fn get_settings(state: web::Data<AppState>, AdminUser(admin): AdminUser) -> Result<HttpResponse, ApiError> {
    let settings = AdminService::settings(&state, &admin).await?;
    Ok(HttpResponse::Ok().json(settings))
}

async fn update_settings(
    state: web::Data<AppState>,
    AdminUser(admin): AdminUser,
    scope: web::Query<SettingsScope>,
    body: web::Json<SettingsUpdate>,
) -> Result<HttpResponse, ApiError> {
    let global = scope.scope.as_deref() == Some("global");
    let settings = AdminService::update_settings(&state, &admin, body.into_inner(), global).await?;
    Ok(HttpResponse::Ok().json(settings))
}

async fn list_templates(state: web::Data<AppState>, _admin: AdminUser) -> Result<HttpResponse, ApiError> {
    let templates = AdminService::list_templates(&state).await?;
    Ok(HttpResponse::Ok().json(templates))
}

async fn update_template(
    state: web::Data<AppState>,
    _admin: AdminUser,
    path: web::Path<String>,
    body: web::Json<NewEmailTemplate>,
) -> Result<HttpResponse, ApiError> {
    let template = AdminService::update_template(&state, &path, body.into_inner()).await?;
    Ok(HttpResponse::Ok().json(template))
}

// Admin management

async fn list_admins(state: web::Data<AppState>, _caller: SuperAdminUser) -> Result<HttpResponse, ApiError> {
    let admins = AdminService::list_admins(&state).await?;
    Ok(HttpResponse::Ok().json(admins))
}

async fn create_admin(
    state: web::Data<AppState>,
    SuperAdminUser(caller): SuperAdminUser,
    body: web::Json<CreateAdminRequest>,
) -> Result<HttpResponse, ApiError> {
    let admin = AdminService::create_admin(&state, &caller, body.into_inner()).await?;
    Ok(HttpResponse::Created().json(admin))
}

async fn delete_admin(
    state: web::Data<AppState>,
    SuperAdminUser(caller): SuperAdminUser,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, ApiError> {
    let deleted = AdminService::delete_admin(&state, &caller, path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(json!({ "message": "Admin deleted", "id": deleted.id })))
}

// Documents

async fn list_documents(
    state: web::Data<AppState>,
    _member: AuthenticatedUser,
    query: web::Query<DocumentQuery>,
) -> Result<HttpResponse, ApiError> {
    let prefix = documents::scoped_prefix(&state.config.documents_root, query.prefix.as_deref())?;
    let docs = documents::list_documents(state.blobs.as_ref(), &prefix).await?;
    Ok(HttpResponse::Ok().json(query.apply(&docs)))
}

#[derive(Deserialize, Debug)]
struct FolderQuery {
    prefix: Option<String>,
}

async fn list_folders(
    state: web::Data<AppState>,
    _member: AuthenticatedUser,
    query: web::Query<FolderQuery>,
) -> Result<HttpResponse, ApiError> {
    let prefix = documents::scoped_prefix(&state.config.documents_root, query.prefix.as_deref())?;
    let folders = documents::list_subfolders(state.blobs.as_ref(), &prefix).await?;
    Ok(HttpResponse::Ok().json(folders))
}

async fn read_field(field: &mut actix_multipart::Field) -> Result<Vec<u8>, ApiError> {
    let mut bytes = Vec::new();
    while let Some(chunk) = field
        .try_next()
        .await
        .map_err(|e| ApiError::ValidationError(format!("Multipart error: {}", e)))?
    {
        if bytes.len() + chunk.len() > MAX_UPLOAD_BYTES {
            return Err(ApiError::ValidationError(format!(
                "File exceeds the {} MB limit",
                MAX_UPLOAD_BYTES / (1024 * 1024)
            )));
        }
        bytes.extend_from_slice(&chunk);
    }
    Ok(bytes)
}

async fn upload_document(
    state: web::Data<AppState>,
    _admin: AdminUser,
    mut payload: Multipart,
) -> Result<HttpResponse, ApiError> {
    let mut folder = None;
    let mut upload = None;

    while let Some(mut field) = payload
        .try_next()
        .await
        .map_err(|e| ApiError::ValidationError(format!("Multipart error: {}", e)))?
    {
        let (name, file_name) = match field.content_disposition() {
            Some(cd) => (
                cd.get_name().unwrap_or_default().to_string(),
                cd.get_filename().map(str::to_string),
            ),
            None => continue,
        };

        match name.as_str() {
            "folder" => {
                let bytes = read_field(&mut field).await?;
                folder = Some(
                    String::from_utf8(bytes)
                        .map_err(|_| ApiError::ValidationError("Folder must be valid UTF-8".to_string()))?,
                );
            }
            "file" => {
                let file_name =
                    file_name.ok_or_else(|| ApiError::ValidationError("File name is required".to_string()))?;
                upload = Some((file_name, read_field(&mut field).await?));
            }
            other => {
                warn!("Ignoring unrecognized field: {}", other);
                read_field(&mut field).await?;
            }
        }
    }

    let (file_name, bytes) = upload.ok_or_else(|| ApiError::ValidationError("A file is required".to_string()))?;
    let document = documents::upload_document(
        state.blobs.as_ref(),
        &state.config.documents_root,
        folder.as_deref(),
        &file_name,
        bytes,
    )
    .await?;
    Ok(HttpResponse::Created().json(document))
}

async fn delete_document(
    state: web::Data<AppState>,
    _admin: AdminUser,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    state.blobs.delete(&path).await?;
    Ok(HttpResponse::Ok().json(json!({ "message": "Document deleted", "id": path.into_inner() })))
}

async fn rename_document(
    state: web::Data<AppState>,
    _admin: AdminUser,
    path: web::Path<String>,
    body: web::Json<RenameDocumentRequest>,
) -> Result<HttpResponse, ApiError> {
    let document = documents::rename_document(state.blobs.as_ref(), &path, &body.new_name).await?;
    Ok(HttpResponse::Ok().json(document))
}

async fn move_document(
    state: web::Data<AppState>,
    _admin: AdminUser,
    body: web::Json<MoveDocumentRequest>,
) -> Result<HttpResponse, ApiError> {
    documents::move_document(
        state.blobs.as_ref(),
        &state.config.documents_root,
        &body.source_path,
        &body.destination_folder,
    )
    .await?;
    Ok(HttpResponse::Ok().json(json!({ "message": "Document moved" })))
}

fn json_config() -> web::JsonConfig {
    web::JsonConfig::default()
        .error_handler(|err, _req| ApiError::ValidationError(format!("Invalid request body: {}", err)).into())
}

fn query_config() -> web::QueryConfig {
    web::QueryConfig::default()
        .error_handler(|err, _req| ApiError::ValidationError(format!("Invalid query string: {}", err)).into())
}

fn path_config() -> web::PathConfig {
    web::PathConfig::default()
        .error_handler(|err, _req| ApiError::ValidationError(format!("Invalid path: {}", err)).into())
}

/// Mounts every route under `/api`. Paths with fixed segments are registered
/// before `{id}` paths that could shadow them.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.app_data(json_config())
        .app_data(query_config())
        .app_data(path_config())
        .service(
            web::scope("/api")
                .default_service(web::to(route_not_found))
                .service(resource("/health").route(web::get().to(health_check)))
                .service(
                    web::scope("/auth")
                        .service(resource("/login").route(web::post().to(login)))
                        .service(resource("/register").route(web::post().to(register)))
                        .service(resource("/verify").route(web::post().to(verify)))
                        .service(resource("/admin-login").route(web::post().to(admin_login)))
                        .service(resource("/me").route(web::get().to(me)))
                        .service(resource("/profile").route(web::put().to(update_profile)))
                        .service(resource("/change-password").route(web::post().to(change_password)))
                        .service(resource("/forgot-password").route(web::post().to(forgot_password)))
                        .service(resource("/reset-password").route(web::post().to(reset_password))),
                )
                .service(
                    web::scope("/admin")
                        .service(
                            resource("/users")
                                .route(web::get().to(list_pending))
                                .route(web::post().to(approval_action)),
                        )
                        .service(resource("/users/bulk-approve").route(web::post().to(bulk_approve)))
                        .service(resource("/users/bulk-reject").route(web::post().to(bulk_reject)))
                        .service(resource("/users/bulk-delete").route(web::delete().to(bulk_delete)))
                        .service(resource("/users/bulk-upload").route(web::post().to(bulk_upload)))
                        .service(resource("/users/all").route(web::get().to(list_all_users)))
                        .service(resource("/users/export").route(web::get().to(export_users)))
                        .service(resource("/users/{id}").route(web::delete().to(delete_user)))
                        .service(
                            resource("/settings")
                                .route(web::get().to(get_settings))
                                .route(web::put().to(update_settings)),
                        )
                        .service(resource("/email-templates").route(web::get().to(list_templates)))
                        .service(resource("/email-templates/{key}").route(web::put().to(update_template)))
                        .service(
                            resource("/admins")
                                .route(web::get().to(list_admins))
                                .route(web::post().to(create_admin)),
                        )
                        .service(resource("/admins/{id}").route(web::delete().to(delete_admin)))
                        .service(resource("/documents").route(web::post().to(upload_document)))
                        .service(resource("/documents/move").route(web::post().to(move_document)))
                        .service(resource("/documents/{file_id}").route(web::delete().to(delete_document)))
                        .service(resource("/documents/{file_id}/rename").route(web::put().to(rename_document))),
                )
                .service(
                    web::scope("/documents")
                        .wrap(ApprovalGate)
                        .service(resource("").route(web::get().to(list_documents)))
                        .service(resource("/folders").route(web::get().to(list_folders))),
                ),
        );
}
