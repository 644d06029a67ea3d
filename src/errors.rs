use actix_web::http::StatusCode;
use actix_web::{error::ResponseError, HttpResponse};
use log::{debug, error, warn};
use serde_json::json;
use thiserror::Error;

/// Every failure a handler can report. The variant decides the status code,
/// the message is what the client sees (5xx variants excepted).
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Database error: {0}")]
    DatabaseError(String),
    #[error("Dependency error: {0}")]
    DependencyError(String),
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("Conflict: {0}")]
    ConflictError(String),
    #[error("Authentication error: {0}")]
    AuthError(String),
    #[error("Forbidden: {0}")]
    ForbiddenError(String),
    #[error("Not found: {0}")]
    NotFoundError(String),
    #[error("Method not allowed")]
    MethodNotAllowed,
    #[error("Internal server error: {0}")]
    InternalError(String),
}

impl ApiError {
    /// Message returned to the client. Server-side details stay in the log.
    pub fn public_message(&self) -> String {
        match self {
            ApiError::DatabaseError(_) | ApiError::DependencyError(_) | ApiError::InternalError(_) => {
                "Internal server error".to_string()
            }
            ApiError::MethodNotAllowed => "Method not allowed".to_string(),
            ApiError::ValidationError(msg)
            | ApiError::ConflictError(msg)
            | ApiError::AuthError(msg)
            | ApiError::ForbiddenError(msg)
            | ApiError::NotFoundError(msg) => msg.clone(),
        }
    }
}

impl ResponseError for ApiError {
    fn error_response(&self) -> HttpResponse {
        match self {
            ApiError::DatabaseError(msg) => error!("DATABASE ERROR: {}", msg),
            ApiError::DependencyError(msg) => error!("DEPENDENCY ERROR: {}", msg),
            ApiError::InternalError(msg) => error!("INTERNAL SERVER ERROR: {}", msg),
            ApiError::ValidationError(msg) => warn!("VALIDATION ERROR: {}", msg),
            ApiError::ConflictError(msg) => warn!("CONFLICT: {}", msg),
            ApiError::AuthError(msg) => warn!("AUTHENTICATION ERROR: {}", msg),
            ApiError::ForbiddenError(msg) => warn!("FORBIDDEN: {}", msg),
            ApiError::NotFoundError(msg) => debug!("NOT FOUND ERROR: {}", msg),
            ApiError::MethodNotAllowed => debug!("METHOD NOT ALLOWED"),
        }

        HttpResponse::build(self.status_code()).json(json!({ "error": self.public_message() }))
    }

    fn status_code(&self) -> StatusCode {
        match *self {
            ApiError::DatabaseError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::DependencyError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::ValidationError(_) => StatusCode::BAD_REQUEST,
            ApiError::ConflictError(_) => StatusCode::BAD_REQUEST,
            ApiError::AuthError(_) => StatusCode::UNAUTHORIZED,
            ApiError::ForbiddenError(_) => StatusCode::FORBIDDEN,
            ApiError::NotFoundError(_) => StatusCode::NOT_FOUND,
            ApiError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
        }
    }
}

impl From<r2d2::Error> for ApiError {
    fn from(e: r2d2::Error) -> Self {
        error!("Failed to get database connection: {}", e);
        ApiError::DatabaseError(e.to_string())
    }
}

impl From<actix_web::error::BlockingError> for ApiError {
    fn from(e: actix_web::error::BlockingError) -> Self {
        error!("Database operation error: {}", e);
        ApiError::DatabaseError(e.to_string())
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        ApiError::DependencyError(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_maps_to_bad_request() {
        let err = ApiError::ConflictError("Email already exists".to_string());
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(err.public_message(), "Email already exists");
    }

    #[test]
    fn server_errors_hide_details() {
        let err = ApiError::DatabaseError("relation \"users\" does not exist".to_string());
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.public_message(), "Internal server error");
    }

    #[test]
    fn auth_and_role_failures_are_distinct() {
        assert_eq!(ApiError::AuthError("x".into()).status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(ApiError::ForbiddenError("x".into()).status_code(), StatusCode::FORBIDDEN);
    }
}
