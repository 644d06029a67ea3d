use actix_web::{web, App, HttpServer};
use log::{error, info};
use memberportal::config::AppConfig;
use memberportal::logger::setup_logger;
use memberportal::middleware::RequestLogger;
use memberportal::routes;
use memberportal::state::AppState;
use std::io;

#[actix_web::main]
async fn main() -> io::Result<()> {
    setup_logger();

    // Load and validate configuration
    let config = AppConfig::from_env();
    if let Err(e) = config.validate() {
        error!("Configuration validation error: {}", e);
        return Err(io::Error::new(io::ErrorKind::InvalidInput, e));
    }

    let host = config.host.clone();
    let port = config.port;

    let (state, worker) = AppState::init(config).map_err(|e| {
        error!("Failed to initialize application state: {}", e);
        io::Error::new(io::ErrorKind::Other, e.to_string())
    })?;
    let state = web::Data::new(state);

    info!("Starting HTTP server at http://{}:{}", host, port);

    let app_state = state.clone();
    let result = HttpServer::new(move || {
        App::new()
            .wrap(RequestLogger)
            .app_data(app_state.clone())
            .configure(routes::configure)
    })
    .workers(2)
    .keep_alive(std::time::Duration::from_secs(75))
    .shutdown_timeout(30)
    .on_connect(|_conn, addr| {
        log::debug!("New connection from: {:?}", addr);
    })
    .bind((host, port))?
    .run()
    .await;

    info!("Server stopped, sending queued notifications");
    state.notifications.flush().await;
    worker.abort();

    result
}
