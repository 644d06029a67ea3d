use crate::auth::{captcha_from_config, CaptchaVerifier};
use crate::blob::{BlobStore, ImageKitClient, MemoryBlobStore};
use crate::config::{AppConfig, StoreBackend};
use crate::db::{init_pool, PgStore};
use crate::errors::ApiError;
use crate::notifications::{mailer_from_config, spawn_worker, Mailer, NotificationQueue, RetryPolicy};
use crate::store::{MemoryStore, PortalStore};
use log::{info, warn};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Shared application data, created once in `main` and handed to actix as
/// `web::Data<AppState>`. Every gateway sits behind a trait object so tests
/// can swap in the in-memory implementations.
pub struct AppState {
    pub config: AppConfig,
    pub store: Arc<dyn PortalStore>,
    pub blobs: Arc<dyn BlobStore>,
    pub captcha: Arc<dyn CaptchaVerifier>,
    pub notifications: NotificationQueue,
}

impl AppState {
    /// Wires the given gateways together and starts the notification worker.
    /// Must be called inside a tokio runtime.
    pub fn new(
        config: AppConfig,
        store: Arc<dyn PortalStore>,
        blobs: Arc<dyn BlobStore>,
        captcha: Arc<dyn CaptchaVerifier>,
        mailer: Arc<dyn Mailer>,
    ) -> (Self, JoinHandle<()>) {
        let policy = RetryPolicy::from_config(&config);
        let (notifications, worker) = spawn_worker(store.clone(), mailer, policy);

        let state = AppState {
            config,
            store,
            blobs,
            captcha,
            notifications,
        };
        (state, worker)
    }

    /// Picks each gateway from the configuration.
    pub fn init(config: AppConfig) -> Result<(Self, JoinHandle<()>), ApiError> {
        let store: Arc<dyn PortalStore> = match config.store_backend {
            StoreBackend::Postgres => {
                let url = config
                    .database_url
                    .as_deref()
                    .ok_or_else(|| ApiError::InternalError("DATABASE_URL is not set".to_string()))?;
                info!("Using Postgres store");
                Arc::new(PgStore::new(init_pool(url)?))
            }
            StoreBackend::Memory => {
                warn!("Using in-memory store, data is lost on restart");
                Arc::new(MemoryStore::new())
            }
        };

        let blobs: Arc<dyn BlobStore> = match &config.imagekit {
            Some(imagekit) => Arc::new(ImageKitClient::new(imagekit)),
            None => {
                warn!("IMAGEKIT_PRIVATE_KEY is not set, documents are kept in memory");
                Arc::new(MemoryBlobStore::new())
            }
        };

        let captcha = captcha_from_config(&config.captcha);
        let mailer = mailer_from_config(&config)?;

        Ok(Self::new(config, store, blobs, captcha, mailer))
    }
}
