use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use parlor_server::{
    auth,
    config::Config,
    construct_app,
    events::spawn_event_relay,
    http, logs, persistence,
    store::{ArcEphemeralStore, MemoryStore},
};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    logs::init_logger();

    let config = Config::load();
    log::info!(
        "Starting parlor-server ({} environment)",
        config.environment
    );
    auth::init_keys(&config.jwt_secret);

    let pool = match persistence::connect(&config.database_url) {
        Ok(pool) => pool,
        Err(e) => {
            log::error!("Failed to open durable store at {}: {}", config.database_url, e);
            std::process::exit(1);
        }
    };
    if let Err(e) = persistence::init_schema(&pool) {
        log::error!("Failed to initialize schema: {}", e);
        std::process::exit(1);
    }

    let memory_store = Arc::new(MemoryStore::new());
    let store: ArcEphemeralStore = Arc::new(Box::new(memory_store.clone()));

    let shutdown = CancellationToken::new();
    memory_store.run_sweeper(shutdown.clone());

    let (app, matchmaking) = construct_app(&pool, store.clone());
    matchmaking.run_worker(shutdown.clone());
    spawn_event_relay(
        store,
        app.client_service.clone(),
        app.notification_service.clone(),
        shutdown.clone(),
    );

    let router = http::router(app, &config);
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            log::error!("Failed to bind {}: {}", addr, e);
            std::process::exit(1);
        }
    };
    log::info!("Listening on {}", addr);

    let shutdown_token = shutdown.clone();
    let result = axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            log::info!("Shutdown signal received");
            shutdown_token.cancel();
        })
        .await;

    if let Err(e) = result {
        log::error!("Server error: {}", e);
        std::process::exit(1);
    }
    log::info!("Server stopped");
}
