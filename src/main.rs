//! Pi Bridge Server
//!
//! WebSocket bridge for sharing pi agent sessions. Supervises one agent
//! process per session and streams its events to every attached client.

mod config;
mod logs;
mod rpc;
mod server;
mod session;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use config::Settings;
use server::{BridgeServer, ServerConfig};

/// Pi Bridge Server
///
/// WebSocket bridge for sharing pi agent sessions
#[derive(Parser, Debug)]
#[command(name = "pi-bridge")]
#[command(version, about, long_about = None)]
struct Args {
    /// Port to listen on (overrides the settings file)
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind address (overrides the settings file)
    #[arg(long)]
    bind: Option<String>,

    /// Path to the settings file
    #[arg(long, default_value = "bridge.toml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .init();

    info!("Pi Bridge v{}", env!("CARGO_PKG_VERSION"));

    let mut settings = Settings::load(&args.config)?;
    if let Some(port) = args.port {
        settings.port = port;
    }
    if let Some(bind) = args.bind {
        settings.bind = bind;
    }

    let server_config = ServerConfig::new(settings.bind.clone(), settings.port);
    let server = Arc::new(BridgeServer::new(server_config, settings.manager_config()));
    let server_handle = Arc::clone(&server);

    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Initiating graceful shutdown...");
        server_handle.shutdown();
    });

    server.run().await?;

    info!("Server shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
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
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C)");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }
}
