//! tinycam-server - standalone headless camera-worker server.
//!
//! Supervises an external video encoder reading from a local camera device
//! and streams its live output to authenticated WebSocket clients as
//! per-frame authenticated-encrypted payloads.

mod config;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::routing::get;
use axum::Router;
use clap::Parser;
use tinycam_core::{
    stream_handler, Broadcaster, EncoderSupervisor, InitCache, KeyMaterial, StreamParams,
    StreamingApp,
};
use tokio::signal;
use tower_http::trace::TraceLayer;

use crate::config::ServerConfig;

/// tinycam-server - headless camera-worker streaming server.
#[derive(Parser, Debug)]
#[command(name = "tinycam-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (YAML).
    #[arg(short, long, value_name = "FILE")]
    config: Option<std::path::PathBuf>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "info", env = "TINYCAM_LOG_LEVEL")]
    log_level: log::LevelFilter,

    /// Bind port (overrides config file).
    #[arg(short = 'p', long, env = "TINYCAM_BIND_PORT")]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(args.log_level)
        .format_timestamp_millis()
        .init();

    log::info!("tinycam-server v{}", env!("CARGO_PKG_VERSION"));

    let mut config =
        ServerConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(port) = args.port {
        config.bind_port = port;
    }

    std::fs::create_dir_all(&config.data_dir).with_context(|| {
        format!(
            "Failed to create data directory: {}",
            config.data_dir.display()
        )
    })?;

    let key_material = KeyMaterial::load_or_generate(&config.key_file_path())
        .context("Failed to load or generate key material")?;
    let access_key = key_material
        .access_key()
        .context("Stored access key is malformed")?;

    let init_cache = Arc::new(InitCache::new(config.encoder.codec.container_kind()));
    let broadcaster = Arc::new(Broadcaster::new());
    let supervisor = Arc::new(EncoderSupervisor::new(init_cache.clone(), broadcaster.clone()));

    supervisor
        .start(config.encoder.clone(), config.lock_dir())
        .await
        .context("Failed to start encoder supervisor")?;
    log::info!(
        "Encoder supervisor started for device '{}' ({:?}, {}x{}@{})",
        config.encoder.device_id,
        config.encoder.codec,
        config.encoder.width,
        config.encoder.height,
        config.encoder.fps,
    );

    let params = StreamParams {
        codec: config.encoder.codec.as_wire_str().to_string(),
        width: config.encoder.width,
        height: config.encoder.height,
        fps: config.encoder.fps,
    };
    let app = Arc::new(
        StreamingApp::new(access_key, init_cache, broadcaster, params)
            .with_start_timeout(std::time::Duration::from_secs(config.start_timeout_secs))
            .with_inactivity_timeout(std::time::Duration::from_secs(
                config.inactivity_timeout_secs,
            ))
            .with_queue_capacity(config.queue_capacity),
    );
    let shutdown_token = app.shutdown_token();

    let router = Router::new()
        .route("/stream", get(stream_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(app);

    let addr = SocketAddr::new(config.bind_addr, config.bind_port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    log::info!("Listening on ws://{addr}/stream");

    // `with_graceful_shutdown` keeps serving in-flight connections until they
    // finish; each session bounds its own polite close internally, so this
    // resolves quickly once `shutdown_token` is cancelled rather than
    // aborting sockets mid-close-handshake.
    let server = axum::serve(listener, router.into_make_service()).with_graceful_shutdown(
        async move {
            shutdown_signal().await;
            log::info!("shutdown signal received, closing sessions and stopping encoder");
            shutdown_token.cancel();
        },
    );

    if let Err(e) = server.await {
        log::error!("server error: {e}");
    }

    supervisor.stop().await;
    log::info!("shutdown complete");
    Ok(())
}

/// Waits for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
