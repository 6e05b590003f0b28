//! Vidurai Daemon - Local context memory for AI-assisted development
//!
//! Hosts the memory lifecycle core behind a local NDJSON IPC socket:
//! sensors (editor, browser, proxy, CLI) push normalized events in,
//! consumers pull token-budgeted context windows out. Everything stays
//! on this machine.

mod protocol;
mod server;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use vidurai_core::{Engine, EngineError, StoreError};

/// Grace period for draining in-flight work on shutdown
const DRAIN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Parser)]
#[command(
    name = "vidurai-daemon",
    version,
    about = "Local-first context memory engine (sensor ingress + consumer IPC)"
)]
struct Args {
    /// Custom data directory (hot DB, ledger, cold archive, policy state)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Socket path; defaults to <data-dir>/vidurai.sock
    #[arg(long)]
    socket: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Log to stderr; stdout stays clean for anyone piping frames
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_ansi(false)
        .init();

    info!("vidurai-daemon v{} starting", env!("CARGO_PKG_VERSION"));

    let engine = match Engine::open(args.data_dir) {
        Ok(engine) => Arc::new(engine),
        Err(EngineError::Store(StoreError::Unavailable(reason))) => {
            // The one fatal error: a hot DB we cannot open. Sensors get
            // a refused handshake because there is nothing listening.
            error!(%reason, "hot store unavailable, refusing to start");
            std::process::exit(2);
        }
        Err(e) => {
            error!(error = %e, "engine failed to start");
            std::process::exit(1);
        }
    };
    info!(data_dir = %engine.data_dir().display(), "engine ready");

    let socket_path = args
        .socket
        .unwrap_or_else(|| server::default_socket_path(engine.data_dir()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server_engine = Arc::clone(&engine);
    let server_handle = tokio::spawn(server::run(server_engine, socket_path, shutdown_rx));

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("termination signal received"),
        Err(e) => error!(error = %e, "cannot listen for shutdown signal"),
    }

    // Stop accepting, give in-flight connections a moment to finish,
    // then drain the writer and flush the ledger
    let _ = shutdown_tx.send(true);
    let _ = tokio::time::timeout(DRAIN_GRACE, server_handle).await;
    engine.shutdown().await;

    info!("clean shutdown complete");
}
