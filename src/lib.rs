pub mod approval;
pub mod auth;
pub mod blob;
pub mod config;
pub mod dashboard;
pub mod db;
pub mod documents;
pub mod errors;
pub mod logger;
pub mod middleware;
pub mod models;
pub mod notifications;
pub mod routes;
pub mod schema;
pub mod services;
pub mod state;
pub mod store;

// Re-export common types
pub use crate::config::AppConfig;
pub use crate::errors::ApiError;
pub use crate::state::AppState;
