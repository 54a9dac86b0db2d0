//! nvrd - network video recorder
//!
//! Main entry point: wires the log bus, RTSP server, storage and monitor
//! manager together, serves the web API, and stops everything in order on
//! SIGINT/SIGTERM.

use std::sync::Arc;

use nvrd::config::EnvConfig;
use nvrd::group::GroupManager;
use nvrd::log_bus::{LogStore, Logger};
use nvrd::monitor::{HookSet, MonitorManager};
use nvrd::rtsp::RtspServer;
use nvrd::state::AppState;
use nvrd::storage::StorageManager;
use nvrd::web_api;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "nvrd=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting nvrd v{}", env!("CARGO_PKG_VERSION"));

    let env = EnvConfig::default();
    env.prepare_environment()?;
    tracing::info!(
        config_dir = %env.config_dir.display(),
        storage_dir = %env.storage_dir.display(),
        shm_dir = %env.shm_dir.display(),
        "Environment prepared"
    );

    let root_token = CancellationToken::new();

    // Hooks are assembled here, explicitly; there is no global registry.
    let hooks = HookSet::new().register_motion().register_thumb_scale();

    // Log bus and store.
    let logger = Arc::new(Logger::new(root_token.clone(), &hooks.log_sources));
    let log_store = Arc::new(LogStore::new(env.logs_dir(), env.log_disk_budget())?);
    log_store.save_logs(root_token.clone(), logger.clone());
    log_store.purge_loop(root_token.clone());

    // RTSP server; a bind failure here is fatal.
    let rtsp_server = RtspServer::new(logger.clone(), env.rtsp_port);
    rtsp_server.start(root_token.clone()).await?;

    // Storage.
    let storage = StorageManager::new(
        env.recordings_dir(),
        env.disk_space_gb * 1_000_000_000,
        logger.clone(),
    );
    storage.purge_loop(root_token.clone());

    // Monitors and groups.
    let monitor_manager = MonitorManager::new(
        env.clone(),
        logger.clone(),
        rtsp_server.clone(),
        hooks,
        root_token.clone(),
    )?;
    let group_manager = Arc::new(GroupManager::new(env.groups_dir())?);

    monitor_manager.start_all().await;

    // Web API.
    let state = AppState {
        env: env.clone(),
        logger: logger.clone(),
        log_store,
        monitor_manager: monitor_manager.clone(),
        group_manager,
        storage,
    };
    let app = web_api::create_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any));

    let listener = TcpListener::bind(("0.0.0.0", env.port)).await?;
    logger
        .info()
        .source("app")
        .msg(format!("serving app on port {}", env.port))
        .await;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Orderly stop: monitors first, then everything hanging off the root
    // token.
    monitor_manager.stop_all().await;
    logger.info().source("app").msg("monitors stopped").await;
    root_token.cancel();

    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut interrupt = signal(SignalKind::interrupt()).expect("install SIGINT handler");
    let mut terminate = signal(SignalKind::terminate()).expect("install SIGTERM handler");
    tokio::select! {
        _ = interrupt.recv() => tracing::info!("received SIGINT, stopping"),
        _ = terminate.recv() => tracing::info!("received SIGTERM, stopping"),
    }
}
