use actix_web::dev::ServiceResponse;
use actix_web::http::{header, Method, StatusCode};
use actix_web::{test, web, App};
use async_trait::async_trait;
use chrono::Utc;
use memberportal::auth::{generate_token, hash_password, DisabledCaptcha};
use memberportal::blob::{MemoryBlobStore, StoredFile};
use memberportal::config::AppConfig;
use memberportal::middleware::{RequestLogger, REQUEST_ID_HEADER};
use memberportal::models::{ApprovalStatus, NewUser, Role, User};
use memberportal::notifications::{Mailer, OutgoingEmail};
use memberportal::routes;
use memberportal::state::AppState;
use memberportal::store::{MemoryStore, PortalStore};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};

const PASSWORD: &str = "correct-horse-battery";

#[derive(Default)]
struct RecordingMailer {
    sent: Mutex<Vec<OutgoingEmail>>,
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send(&self, email: &OutgoingEmail) -> Result<(), String> {
        self.sent.lock().unwrap().push(email.clone());
        Ok(())
    }
}

impl RecordingMailer {
    fn recipients(&self) -> Vec<String> {
        self.sent.lock().unwrap().iter().map(|e| e.to.clone()).collect()
    }
}

struct Harness {
    state: web::Data<AppState>,
    store: Arc<MemoryStore>,
    mailer: Arc<RecordingMailer>,
}

impl Harness {
    fn new() -> Self {
        let files = vec![
            stored("f1", "2022 - Annual Plan.pdf", "/StrategicDocs/2022 - Annual Plan.pdf"),
            stored("f2", "Minutes.docx", "/StrategicDocs/Webinar 1/Minutes.docx"),
            stored("f3", "logo.png", "/StrategicDocs/logo.png"),
        ];
        Self::with_blobs(MemoryBlobStore::with_files(files))
    }

    fn with_blobs(blobs: MemoryBlobStore) -> Self {
        let store = Arc::new(MemoryStore::new());
        let mailer = Arc::new(RecordingMailer::default());
        let (state, _worker) = AppState::new(
            AppConfig::for_memory(),
            store.clone(),
            Arc::new(blobs),
            Arc::new(DisabledCaptcha),
            mailer.clone(),
        );
        Harness {
            state: web::Data::new(state),
            store,
            mailer,
        }
    }

    async fn user(&self, email: &str, role: Role, approved: bool) -> User {
        let mut new_user = NewUser::pending(email, hash_password(PASSWORD).unwrap());
        new_user.full_name = Some(email.split('@').next().unwrap().to_string());
        new_user.role = role;
        if approved {
            new_user.approval = Some((uuid::Uuid::new_v4(), Utc::now()));
        }
        self.store.insert_user(new_user).await.unwrap()
    }

    fn token(&self, user: &User) -> String {
        generate_token(user, &self.state.config).unwrap()
    }
}

fn stored(id: &str, name: &str, path: &str) -> StoredFile {
    StoredFile {
        file_id: id.to_string(),
        name: name.to_string(),
        file_path: path.to_string(),
        url: format!("https://cdn.example.org{}", path),
        created_at: Utc::now(),
        size: 1024,
        mime: None,
    }
}

macro_rules! app {
    ($harness:expr) => {
        test::init_service(
            App::new()
                .wrap(RequestLogger)
                .app_data($harness.state.clone())
                .configure(routes::configure),
        )
        .await
    };
}

fn bearer(token: &str) -> (header::HeaderName, String) {
    (header::AUTHORIZATION, format!("Bearer {}", token))
}

async fn json_body(res: ServiceResponse) -> (StatusCode, Value) {
    let status = res.status();
    let body: Value = test::read_body_json(res).await;
    (status, body)
}

#[actix_web::test]
async fn health_reports_ok() {
    let harness = Harness::new();
    let app = app!(harness);

    let res = test::call_service(&app, test::TestRequest::get().uri("/api/health").to_request()).await;
    assert!(res.headers().contains_key(REQUEST_ID_HEADER));
    let (status, body) = json_body(res).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[actix_web::test]
async fn registration_through_approval_to_rejection() {
    let harness = Harness::new();
    let admin = harness.user("admin@example.org", Role::Admin, true).await;
    let admin_token = harness.token(&admin);
    let app = app!(harness);

    // Register a pending member; no session token comes back.
    let req = test::TestRequest::post()
        .uri("/api/auth/register")
        .set_json(json!({
            "email": "New.Member@Example.org",
            "password": PASSWORD,
            "fullName": "New Member",
            "organizationName": "Acme"
        }))
        .to_request();
    let (status, body) = json_body(test::call_service(&app, req).await).await;
    assert_eq!(status, StatusCode::CREATED);
    assert!(body.get("token").is_none());
    assert_eq!(body["user"]["approval_status"], "pending");
    assert!(body["user"].get("password_hash").is_none());
    let member_id = body["user"]["id"].as_str().unwrap().to_string();

    // Same email again, different case.
    let req = test::TestRequest::post()
        .uri("/api/auth/register")
        .set_json(json!({ "email": "new.member@example.org", "password": PASSWORD, "fullName": "Twin" }))
        .to_request();
    let (status, body) = json_body(test::call_service(&app, req).await).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Email already exists");

    // The admin sees the pending member.
    let req = test::TestRequest::get()
        .uri("/api/admin/users")
        .insert_header(bearer(&admin_token))
        .to_request();
    let (status, body) = json_body(test::call_service(&app, req).await).await;
    assert_eq!(status, StatusCode::OK);
    let pending: Vec<&str> = body.as_array().unwrap().iter().map(|u| u["id"].as_str().unwrap()).collect();
    assert_eq!(pending, vec![member_id.as_str()]);

    // Pending members can log in but cannot reach documents.
    let req = test::TestRequest::post()
        .uri("/api/auth/login")
        .set_json(json!({ "email": "new.member@example.org", "password": PASSWORD }))
        .to_request();
    let (status, body) = json_body(test::call_service(&app, req).await).await;
    assert_eq!(status, StatusCode::OK);
    let member_token = body["token"].as_str().unwrap().to_string();

    let req = test::TestRequest::get()
        .uri("/api/documents")
        .insert_header(bearer(&member_token))
        .to_request();
    let (status, body) = json_body(test::call_service(&app, req).await).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert!(body["error"].as_str().unwrap().contains("pending approval"));

    // Approve.
    let req = test::TestRequest::post()
        .uri("/api/admin/users")
        .insert_header(bearer(&admin_token))
        .set_json(json!({ "userId": member_id, "action": "approve" }))
        .to_request();
    let (status, body) = json_body(test::call_service(&app, req).await).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["user"]["approval_status"], "approved");
    assert_eq!(body["user"]["approved_by"], admin.id.to_string());

    let req = test::TestRequest::get()
        .uri("/api/documents?search=plan")
        .insert_header(bearer(&member_token))
        .to_request();
    let (status, body) = json_body(test::call_service(&app, req).await).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 1);
    assert_eq!(body["items"][0]["year"], 2022);

    // Bulk reject flips the approved member to rejected.
    let req = test::TestRequest::post()
        .uri("/api/admin/users/bulk-reject")
        .insert_header(bearer(&admin_token))
        .set_json(json!({ "userIds": [member_id], "reason": "Not a member organization" }))
        .to_request();
    let (status, body) = json_body(test::call_service(&app, req).await).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["updated"], 1);

    let req = test::TestRequest::get()
        .uri("/api/documents")
        .insert_header(bearer(&member_token))
        .to_request();
    let (status, body) = json_body(test::call_service(&app, req).await).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "Your account request was not approved");

    let member = harness
        .store
        .find_user_by_email("new.member@example.org")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(member.approval_status, ApprovalStatus::Rejected);
    assert_eq!(member.rejection_reason.as_deref(), Some("Not a member organization"));

    harness.state.notifications.flush().await;
    let recipients = harness.mailer.recipients();
    assert!(recipients.contains(&"admin@example.org".to_string()));
    assert_eq!(
        recipients.iter().filter(|r| *r == "new.member@example.org").count(),
        3,
        "welcome, approval and rejection"
    );
}

#[actix_web::test]
async fn login_failures_are_uniform() {
    let harness = Harness::new();
    harness.user("member@example.org", Role::User, true).await;
    let app = app!(harness);

    let mut messages = Vec::new();
    for (email, password) in [("member@example.org", "wrong-password"), ("nobody@example.org", PASSWORD)] {
        let req = test::TestRequest::post()
            .uri("/api/auth/login")
            .set_json(json!({ "email": email, "password": password }))
            .to_request();
        let (status, body) = json_body(test::call_service(&app, req).await).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        messages.push(body["error"].as_str().unwrap().to_string());
    }
    assert_eq!(messages[0], messages[1]);
    assert_eq!(messages[0], "Invalid email or password");
}

#[actix_web::test]
async fn verify_and_me_resolve_the_session() {
    let harness = Harness::new();
    let member = harness.user("member@example.org", Role::User, true).await;
    let token = harness.token(&member);
    let app = app!(harness);

    let req = test::TestRequest::post()
        .uri("/api/auth/verify")
        .set_json(json!({ "token": token }))
        .to_request();
    let (status, body) = json_body(test::call_service(&app, req).await).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["valid"], true);
    assert_eq!(body["user"]["email"], "member@example.org");

    let req = test::TestRequest::post()
        .uri("/api/auth/verify")
        .set_json(json!({ "token": "not-a-token" }))
        .to_request();
    let res = test::call_service(&app, req).await;
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    let req = test::TestRequest::get()
        .uri("/api/auth/me")
        .insert_header(bearer(&token))
        .to_request();
    let (status, body) = json_body(test::call_service(&app, req).await).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["id"], member.id.to_string());
}

#[actix_web::test]
async fn admin_routes_check_the_caller() {
    let harness = Harness::new();
    let member = harness.user("member@example.org", Role::User, true).await;
    let admin = harness.user("admin@example.org", Role::Admin, true).await;
    let member_token = harness.token(&member);
    let admin_token = harness.token(&admin);
    let app = app!(harness);

    let req = test::TestRequest::get().uri("/api/admin/users").to_request();
    let (status, body) = json_body(test::call_service(&app, req).await).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(body["error"].is_string());

    let req = test::TestRequest::get()
        .uri("/api/admin/users")
        .insert_header(bearer("garbage"))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), StatusCode::UNAUTHORIZED);

    let req = test::TestRequest::post()
        .uri("/api/admin/users/bulk-approve")
        .insert_header(bearer(&member_token))
        .set_json(json!({ "userIds": [member.id] }))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), StatusCode::FORBIDDEN);

    // Plain admins cannot manage admins.
    let req = test::TestRequest::get()
        .uri("/api/admin/admins")
        .insert_header(bearer(&admin_token))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), StatusCode::FORBIDDEN);
}

#[actix_web::test]
async fn bulk_delete_protects_admins_and_self() {
    let harness = Harness::new();
    let admin = harness.user("admin@example.org", Role::Admin, true).await;
    let other_admin = harness.user("other@example.org", Role::SuperAdmin, true).await;
    let member = harness.user("member@example.org", Role::User, false).await;
    let admin_token = harness.token(&admin);
    let app = app!(harness);

    for ids in [json!([member.id, other_admin.id]), json!([member.id, admin.id])] {
        let req = test::TestRequest::delete()
            .uri("/api/admin/users/bulk-delete")
            .insert_header(bearer(&admin_token))
            .set_json(json!({ "userIds": ids }))
            .to_request();
        let (status, body) = json_body(test::call_service(&app, req).await).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert!(body["error"].is_string());
    }
    assert!(harness.store.find_user_by_id(member.id).await.unwrap().is_some());

    let req = test::TestRequest::delete()
        .uri("/api/admin/users/bulk-delete")
        .insert_header(bearer(&admin_token))
        .set_json(json!({ "userIds": [member.id] }))
        .to_request();
    let (status, body) = json_body(test::call_service(&app, req).await).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["deleted"], 1);
    assert!(harness.store.find_user_by_id(member.id).await.unwrap().is_none());
}

#[actix_web::test]
async fn bulk_endpoints_validate_their_input() {
    let harness = Harness::new();
    let admin = harness.user("admin@example.org", Role::Admin, true).await;
    let member = harness.user("member@example.org", Role::User, false).await;
    let admin_token = harness.token(&admin);
    let app = app!(harness);

    let req = test::TestRequest::post()
        .uri("/api/admin/users/bulk-reject")
        .insert_header(bearer(&admin_token))
        .set_json(json!({ "userIds": [member.id], "reason": "   " }))
        .to_request();
    let (status, body) = json_body(test::call_service(&app, req).await).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Rejection reason is required");

    let req = test::TestRequest::post()
        .uri("/api/admin/users/bulk-approve")
        .insert_header(bearer(&admin_token))
        .set_json(json!({ "userIds": [] }))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), StatusCode::BAD_REQUEST);

    // Malformed JSON still answers with the error envelope.
    let req = test::TestRequest::post()
        .uri("/api/admin/users/bulk-approve")
        .insert_header(bearer(&admin_token))
        .insert_header((header::CONTENT_TYPE, "application/json"))
        .set_payload("{not json")
        .to_request();
    let (status, body) = json_body(test::call_service(&app, req).await).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());
}

#[actix_web::test]
async fn bulk_upload_reports_each_row() {
    let harness = Harness::new();
    let admin = harness.user("admin@example.org", Role::Admin, true).await;
    harness.user("taken@example.org", Role::User, false).await;
    let admin_token = harness.token(&admin);
    let app = app!(harness);

    let req = test::TestRequest::post()
        .uri("/api/admin/users/bulk-upload")
        .insert_header(bearer(&admin_token))
        .set_json(json!({ "users": [
            { "email": "one@example.org", "fullName": "One", "status": "Approved" },
            { "email": "taken@example.org", "fullName": "Taken" },
            { "email": "", "fullName": "Nobody" }
        ]}))
        .to_request();
    let (status, body) = json_body(test::call_service(&app, req).await).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["created"], 1);
    assert_eq!(body["failed"], 2);
    assert_eq!(body["results"][0]["success"], true);
    assert_eq!(body["results"][1]["error"], "Email already exists");

    let one = harness.store.find_user_by_email("one@example.org").await.unwrap().unwrap();
    assert_eq!(one.approval_status, ApprovalStatus::Approved);
    assert!(one.is_first_time);
}

#[actix_web::test]
async fn wrong_method_answers_405_with_json() {
    let harness = Harness::new();
    let app = app!(harness);

    for (method, uri) in [
        (Method::PUT, "/api/admin/users"),
        (Method::GET, "/api/admin/users/bulk-approve"),
        (Method::POST, "/api/admin/users/bulk-delete"),
        (Method::GET, "/api/auth/login"),
    ] {
        let req = test::TestRequest::default().method(method).uri(uri).to_request();
        let (status, body) = json_body(test::call_service(&app, req).await).await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED, "{}", uri);
        assert_eq!(body["error"], "Method not allowed");
    }
}

#[actix_web::test]
async fn members_table_and_export() {
    let harness = Harness::new();
    let admin = harness.user("admin@example.org", Role::Admin, true).await;
    harness.user("alice@example.org", Role::User, true).await;
    harness.user("bob@example.org", Role::User, false).await;
    let admin_token = harness.token(&admin);
    let app = app!(harness);

    let req = test::TestRequest::get()
        .uri("/api/admin/users/all?status=pending")
        .insert_header(bearer(&admin_token))
        .to_request();
    let (status, body) = json_body(test::call_service(&app, req).await).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 1);
    assert_eq!(body["items"][0]["email"], "bob@example.org");

    let req = test::TestRequest::get()
        .uri("/api/admin/users/export?sort_by=email&order=asc")
        .insert_header(bearer(&admin_token))
        .to_request();
    let res = test::call_service(&app, req).await;
    assert_eq!(res.status(), StatusCode::OK);
    assert!(res
        .headers()
        .get(header::CONTENT_DISPOSITION)
        .unwrap()
        .to_str()
        .unwrap()
        .contains("users.csv"));
    let body = test::read_body(res).await;
    let csv = String::from_utf8(body.to_vec()).unwrap();
    let lines: Vec<&str> = csv.trim_end().split("\r\n").collect();
    assert_eq!(lines.len(), 3, "header plus two members, no admins");
    assert!(lines[1].contains("alice@example.org"));
}

#[actix_web::test]
async fn documents_stay_inside_the_root() {
    let harness = Harness::new();
    let member = harness.user("member@example.org", Role::User, true).await;
    let token = harness.token(&member);
    let app = app!(harness);

    let req = test::TestRequest::get()
        .uri("/api/documents/folders")
        .insert_header(bearer(&token))
        .to_request();
    let (status, body) = json_body(test::call_service(&app, req).await).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);

    let req = test::TestRequest::get()
        .uri("/api/documents?prefix=/Private")
        .insert_header(bearer(&token))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), StatusCode::FORBIDDEN);

    let req = test::TestRequest::get().uri("/api/documents").to_request();
    assert_eq!(test::call_service(&app, req).await.status(), StatusCode::UNAUTHORIZED);
}

#[actix_web::test]
async fn super_admin_manages_admins() {
    let harness = Harness::new();
    let root = harness.user("root@example.org", Role::SuperAdmin, true).await;
    let token = harness.token(&root);
    let app = app!(harness);

    let req = test::TestRequest::post()
        .uri("/api/admin/admins")
        .insert_header(bearer(&token))
        .set_json(json!({
            "email": "helper@example.org",
            "password": PASSWORD,
            "fullName": "Helper",
            "role": "admin"
        }))
        .to_request();
    let (status, body) = json_body(test::call_service(&app, req).await).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["approval_status"], "approved");
    let helper_id = body["id"].as_str().unwrap().to_string();

    let req = test::TestRequest::delete()
        .uri(&format!("/api/admin/admins/{}", root.id))
        .insert_header(bearer(&token))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), StatusCode::FORBIDDEN);

    let req = test::TestRequest::delete()
        .uri(&format!("/api/admin/admins/{}", helper_id))
        .insert_header(bearer(&token))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), StatusCode::OK);
}
