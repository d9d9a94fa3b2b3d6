//! Subtext Background Service
//!
//! Long-running daemon that owns the worker pool, the admission queue
//! and the session storage. Clients talk to it over the Unix socket;
//! see `subtext-cli` for the command-line front end.

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use subtext_service::config::ServiceConfig;
use subtext_service::pipeline::ServiceState;
use subtext_service::{ipc, is_shutdown_requested, request_shutdown};

fn main() {
    // Initialize logging with RUST_LOG env var support
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = subtext_common::logging::ensure_log_dir() {
        warn!("Could not create log directory: {}", e);
    }

    info!("Subtext service starting (pid: {})...", std::process::id());

    let config = ServiceConfig::load();
    info!(
        "Configuration: model={} precision={} devices={:?} max_sessions={}",
        config.engine.model,
        config.engine.precision,
        config.scheduling.devices,
        config.scheduling.max_sessions
    );

    let preload = config.engine.preload;
    let state = match ServiceState::new(config) {
        Ok(state) => Arc::new(state),
        Err(e) => {
            error!("Failed to initialise service storage: {}", e);
            std::process::exit(1);
        }
    };

    // Clear out anything a previous run left behind.
    state.sessions.sweep_stale();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("Failed to create Tokio runtime");

    runtime.block_on(async {
        // Ctrl-C / SIGTERM flip the shutdown flag; the accept loop
        // notices and drains.
        tokio::spawn(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                request_shutdown();
            }
        });

        if preload {
            state.preload().await;
        }

        if let Err(e) = ipc::server::run_server(Arc::clone(&state)).await {
            if !is_shutdown_requested() {
                error!("IPC server error: {}", e);
                std::process::exit(1);
            }
        }
    });

    info!("Subtext service stopped");
}
