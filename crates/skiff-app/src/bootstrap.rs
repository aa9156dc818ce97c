//! Application boot sequence.
//!
//! Order matters: logging first so every later failure is visible, then
//! configuration, the durable store (with bounded connection retries and
//! migrations), the engine session, the lifecycle core (which reloads
//! persisted torrents), and finally the HTTP listener. Shutdown unwinds in
//! reverse on SIGINT/SIGTERM.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use skiff_api::ApiState;
use skiff_config::AppConfig;
use skiff_core::{CoreConfig, TorrentCore};
use skiff_data::Store;
use skiff_engine::{EngineTuning, RqbitSwarm, SwarmClient};
use skiff_telemetry::LoggingConfig;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{AppError, AppResult};

/// Connection attempts before the database is declared unreachable.
const DB_CONNECT_ATTEMPTS: u32 = 5;
/// Pause between connection attempts.
const DB_CONNECT_BACKOFF: Duration = Duration::from_secs(2);

async fn connect_store(database_url: &str) -> AppResult<Store> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match Store::connect(database_url).await {
            Ok(store) => return Ok(store),
            Err(err) if attempt >= DB_CONNECT_ATTEMPTS => {
                return Err(AppError::store("connect")(err));
            }
            Err(err) => {
                warn!(attempt, error = %err, "database connection failed, retrying");
                tokio::time::sleep(DB_CONNECT_BACKOFF).await;
            }
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => warn!(error = %err, "failed to install SIGTERM handler"),
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}

/// Boot the service and block until a shutdown signal arrives.
///
/// # Errors
///
/// Returns an error for any fatal initialisation failure; the process exits
/// non-zero in that case.
pub async fn run_app() -> AppResult<()> {
    skiff_telemetry::init_logging(&LoggingConfig::default()).map_err(AppError::Telemetry)?;

    let config = AppConfig::from_env()?;
    info!(
        port = config.port,
        production = config.environment.is_production(),
        staging = %config.download_dir.display(),
        "skiff starting"
    );
    if config.redis_url.is_some() {
        info!("REDIS_URL is set; the session cache collaborator is not wired in this build");
    }

    tokio::fs::create_dir_all(&config.download_dir).await?;

    let store = connect_store(&config.database_url).await?;
    store.migrate().await.map_err(AppError::store("migrate"))?;
    info!("database ready");

    let engine = Arc::new(
        RqbitSwarm::new(
            config.download_dir.clone(),
            EngineTuning {
                listen_port: config.torrent_port,
                ..EngineTuning::default()
            },
        )
        .await?,
    );
    info!(torrent_port = config.torrent_port, "swarm engine ready");

    let client: Arc<dyn SwarmClient> = Arc::clone(&engine) as Arc<dyn SwarmClient>;
    let core = TorrentCore::new(
        client,
        store,
        CoreConfig {
            staging_root: config.download_dir.clone(),
            max_concurrent: config.max_concurrent,
        },
    );
    core.start().await?;
    info!("lifecycle core running");

    let state = ApiState::new(Arc::clone(&core), &config.jwt);
    let limiter_cancel = CancellationToken::new();
    let limiter_task = state.limiter.spawn_cleanup(limiter_cancel.clone());
    let router = skiff_api::build_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "listening");

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("shutdown signal received, draining");
    limiter_cancel.cancel();
    let _ = limiter_task.await;
    core.shutdown().await;
    engine.stop().await;
    info!("skiff stopped");
    Ok(())
}
