//! Eventcast Daemon
//!
//! Serves the eventcast connection manager over HTTP.
//!
//! # Usage
//!
//! ```bash
//! # Defaults (127.0.0.1:8787, config from ~/.config/eventcast/eventcast.toml)
//! eventcast-daemon
//!
//! # Custom address and config file
//! eventcast-daemon --listen 0.0.0.0:9000 --config ./eventcast.toml
//!
//! # With verbose logging
//! RUST_LOG=debug eventcast-daemon
//! ```
//!
//! # Environment Variables
//!
//! - `EVENTCAST_LISTEN`: Listen address
//! - `EVENTCAST_CONFIG`: Config file path
//! - `EVENTCAST_*`: Manager settings (see `eventcast_core::config`)
//! - `RUST_LOG`: Extra log directives
//!
//! # Signals
//!
//! - SIGTERM/SIGINT: Graceful shutdown (closes every stream)

mod server;

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};

use eventcast_core::{load_config_from_path, LogLevel, ManagerEvent, SseManager};

/// Command-line arguments
#[derive(Debug, Parser)]
#[command(name = "eventcast-daemon", version, about = "Server-Sent Events daemon")]
struct Args {
    /// Address to listen on
    #[arg(long, env = "EVENTCAST_LISTEN", default_value = "127.0.0.1:8787")]
    listen: SocketAddr,

    /// Config file (defaults to the XDG config location)
    #[arg(long, env = "EVENTCAST_CONFIG")]
    config: Option<PathBuf>,

    /// Override the configured log level
    #[arg(long)]
    log_level: Option<LogLevel>,

    /// Compress large payloads
    #[arg(long)]
    enable_compression: bool,
}

fn init_logging(level: LogLevel) -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("eventcast_daemon={level}").parse()?)
                .add_directive(format!("eventcast_core={level}").parse()?),
        )
        .with_target(true)
        .init();
    Ok(())
}

/// Log manager events until every manager handle is dropped
async fn log_manager_events(mut events: broadcast::Receiver<ManagerEvent>) {
    loop {
        match events.recv().await {
            Ok(ManagerEvent::ClientCleanup {
                client_id, reason, ..
            }) => info!(client_id = %client_id, ?reason, "Client cleaned up"),
            Ok(ManagerEvent::ConnectionQualityChange {
                client_id,
                new_quality,
                ..
            }) => debug!(client_id = %client_id, quality = %new_quality, "Quality changed"),
            Ok(event) => debug!(event = event.name(), client_id = %event.client_id(), "Manager event"),
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "Manager event log lagged"),
            Err(RecvError::Closed) => break,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = load_config_from_path(args.config.as_deref())
        .context("Failed to load eventcast configuration")?;
    if let Some(level) = args.log_level {
        config.log_level = level;
    }
    if args.enable_compression {
        config.enable_compression = true;
    }

    init_logging(config.log_level)?;
    info!(pid = std::process::id(), "Starting eventcast daemon");

    let manager = SseManager::new(config);
    tokio::spawn(log_manager_events(manager.subscribe()));
    let signal_task = manager.shutdown_on_signal();

    let listener = tokio::net::TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("Failed to bind {}", args.listen))?;
    info!(address = %args.listen, "Listening for event-stream clients");

    let app = server::router(manager.clone());
    let shutdown_manager = manager.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            // Streams close during manager shutdown, letting axum drain.
            let _ = signal_task.await;
            debug!(
                shut_down = shutdown_manager.is_shut_down(),
                "Stopping HTTP server"
            );
        })
        .await
        .context("HTTP server failed")?;

    info!("Eventcast daemon stopped");
    Ok(())
}
