use crate::auth::{authenticate, bearer_token};
use crate::errors::ApiError;
use crate::models::{ApprovalStatus, User};
use crate::state::AppState;
use actix_web::body::EitherBody;
use actix_web::dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform};
use actix_web::http::header::{HeaderName, HeaderValue};
use actix_web::{web, Error, HttpMessage};
use log::{debug, error, info, warn};
use std::future::{ready, Future, Ready};
use std::pin::Pin;
use std::rc::Rc;
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

// Logs every request and its response status, tagged with a request id
pub struct RequestLogger;

impl<S, B> Transform<S, ServiceRequest> for RequestLogger
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Transform = RequestLoggerMiddleware<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(RequestLoggerMiddleware {
            service: Rc::new(service),
        }))
    }
}

pub struct RequestLoggerMiddleware<S> {
    service: Rc<S>,
}

impl<S, B> Service<ServiceRequest> for RequestLoggerMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + 'static>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let method = req.method().clone();
        let path = req.path().to_owned();
        let client_ip = req
            .connection_info()
            .realip_remote_addr()
            .map(|s| s.to_owned())
            .unwrap_or_else(|| String::from("unknown"));
        let request_id = req
            .headers()
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        info!("-> [{}] {} {} from {}", request_id, method, path, client_ip);

        let service = self.service.clone();

        Box::pin(async move {
            let start = std::time::Instant::now();
            let mut res = service.call(req).await?;
            let elapsed = start.elapsed();

            if let Ok(value) = HeaderValue::from_str(&request_id) {
                res.headers_mut()
                    .insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
            }

            let status = res.status();
            if status.is_success() {
                info!("<- [{}] {} for {} {} in {:.2?}", request_id, status, method, path, elapsed);
            } else if status.is_client_error() {
                warn!("<- [{}] {} for {} {} in {:.2?}", request_id, status, method, path, elapsed);
            } else {
                error!("<- [{}] {} for {} {} in {:.2?}", request_id, status, method, path, elapsed);
            }

            Ok(res)
        })
    }
}

/// Lets only approved members and admins through. The resolved [`User`] is
/// left in the request extensions for the `AuthenticatedUser` extractor.
pub struct ApprovalGate;

impl<S, B> Transform<S, ServiceRequest> for ApprovalGate
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Transform = ApprovalGateMiddleware<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(ApprovalGateMiddleware {
            service: Rc::new(service),
        }))
    }
}

pub struct ApprovalGateMiddleware<S> {
    service: Rc<S>,
}

fn pending_message(user: &User) -> &'static str {
    match user.approval_status {
        ApprovalStatus::Rejected => "Your account request was not approved",
        _ => "Your account is pending approval. You will be notified once an administrator approves it",
    }
}

async fn resolve_member(req: &ServiceRequest) -> Result<User, ApiError> {
    let state = req
        .app_data::<web::Data<AppState>>()
        .cloned()
        .ok_or_else(|| ApiError::InternalError("Application state is not configured".to_string()))?;
    let token = bearer_token(req.request())?;
    let user = authenticate(&state, &token).await?;

    if !user.has_content_access() {
        debug!("Blocked {} user {} from {}", user.approval_status, user.id, req.path());
        return Err(ApiError::ForbiddenError(pending_message(&user).to_string()));
    }
    Ok(user)
}

impl<S, B> Service<ServiceRequest> for ApprovalGateMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + 'static>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let service = self.service.clone();

        Box::pin(async move {
            match resolve_member(&req).await {
                Ok(user) => {
                    req.extensions_mut().insert(user);
                    let res = service.call(req).await?;
                    Ok(res.map_into_left_body())
                }
                Err(e) => Ok(req.error_response(e).map_into_right_body()),
            }
        })
    }
}
