//! Offline Sync - durable operation queue and synchronization engine
//!
//! Work the application cannot complete while offline is queued durably and
//! replayed against the backend once connectivity returns.

pub mod db;
pub mod offline;

use std::sync::Arc;

use db::Database;
use offline::{
    default_registry, AppState, BackendClient, ConnectionType, ManualConnectivity,
    ManualLifecycle, NetworkInfo, OfflineConfig, OfflineService, QueueStore, TokenStore,
};

pub use offline::{
    EnqueueOptions, EventType, OfflineEvent, OperationType, Priority, QueuedOperation,
    ServiceError,
};

// ============================================================================
// Application Entry Point
// ============================================================================

pub async fn run() {
    // Load .env file for backend settings and token
    dotenvy::dotenv().ok();

    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let app_dir = match directories::ProjectDirs::from("com", "offline-sync", "offline-sync") {
        Some(dirs) => dirs,
        None => {
            log::error!("Failed to get app directories - cannot determine data location");
            eprintln!("FATAL: Failed to get app directories. Please ensure HOME environment variable is set.");
            std::process::exit(1);
        }
    };

    let data_dir = app_dir.data_dir();
    if let Err(e) = std::fs::create_dir_all(data_dir) {
        log::error!("Failed to create data directory: {}", e);
        eprintln!("FATAL: Failed to create data directory at {:?}: {}", data_dir, e);
        std::process::exit(1);
    }

    let db_path = data_dir.join("offline.db");
    log::info!("Database path: {:?}", db_path);

    let db = match Database::new(db_path) {
        Ok(db) => Arc::new(db),
        Err(e) => {
            log::error!("Failed to initialize database: {}", e);
            eprintln!("FATAL: Database initialization failed: {}", e);
            std::process::exit(1);
        }
    };

    // Stored config, overlaid with OFFLINE_* variables
    let config = match load_config(db.as_ref()) {
        Ok(config) => config,
        Err(e) => {
            log::error!("Invalid configuration: {}", e);
            eprintln!("FATAL: {}", e);
            std::process::exit(1);
        }
    };

    let client = match BackendClient::new(&config.api) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            log::error!("Failed to create backend client: {}", e);
            std::process::exit(1);
        }
    };
    let tokens = TokenStore::new();
    if let Ok(token) = std::env::var("OFFLINE_API_TOKEN") {
        tokens.set_token(token).await;
    } else {
        log::warn!("OFFLINE_API_TOKEN not set - backend calls will fail until a token is provided");
    }
    log::info!("Backend: {}", client.base_url());

    let registry = default_registry(client, Arc::new(tokens));
    let connectivity = Arc::new(ManualConnectivity::new(NetworkInfo::online(
        ConnectionType::Unknown,
    )));
    let lifecycle = Arc::new(ManualLifecycle::new(AppState::Active));

    let service = match OfflineService::start(config, db, registry, connectivity, lifecycle).await {
        Ok(service) => service,
        Err(e) => {
            log::error!("Failed to start offline service: {}", e);
            std::process::exit(1);
        }
    };

    let stats = service.get_stats();
    log::info!(
        "Queue: {} pending, {} failed, {} dead-lettered",
        stats.queue.pending,
        stats.queue.failed,
        stats.queue.dead_letter
    );

    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("Failed to listen for shutdown signal: {}", e);
    }

    if let Err(e) = service.cleanup().await {
        log::error!("Shutdown did not complete cleanly: {}", e);
    }
}

fn load_config(store: &dyn QueueStore) -> Result<OfflineConfig, offline::ConfigError> {
    let mut config = OfflineConfig::load(store)?;
    config.apply_env(|key| std::env::var(key).ok())?;
    config.validate()?;
    Ok(config)
}
