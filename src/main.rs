//! wsgate Server Binary
//!
//! WebSocket gateway that tees every event to the console and a rotating log file.

use clap::Parser;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use wsgate::config::ServerConfig;
use wsgate::server::GatewayServer;

#[derive(Parser)]
#[command(name = "wsgate-server")]
#[command(about = "WebSocket gateway with structured, rotatable event logging")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config/server.toml")]
    config: PathBuf,

    /// Address to bind to
    #[arg(short, long)]
    bind: Option<String>,

    /// Event log file (defaults to the executable path plus .log)
    #[arg(short, long)]
    log_file: Option<PathBuf>,

    /// Enable verbose diagnostics
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Diagnostics go to stderr; stdout belongs to the console sink.
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(if args.verbose {
            "wsgate=debug,info"
        } else {
            "wsgate=info,warn"
        })
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting wsgate v{}", env!("CARGO_PKG_VERSION"));

    let mut config = if args.config.exists() {
        ServerConfig::load(Some(&args.config))?
    } else {
        info!("Config file not found, using defaults");
        ServerConfig::load(None)?
    };

    if let Some(bind) = args.bind {
        config.server.bind_address = bind;
    }
    if let Some(log_file) = args.log_file {
        config.logging.file.path = Some(log_file);
    }

    config.validate()?;

    info!("Bind address: {}", config.server.bind_address);
    info!("Endpoint: {}", config.gateway.endpoint);
    info!("Max message size: {} bytes", config.gateway.max_message_size);
    if config.logging.file.enabled {
        info!("Log file: {}", config.logging.file.resolved_path().display());
    }

    let server = GatewayServer::new(config)?;
    tokio::spawn(wait_for_shutdown(server.shutdown_token()));

    if let Err(e) = server.start().await {
        error!("Server error: {}", e);
        std::process::exit(1);
    }

    info!("wsgate stopped");
    Ok(())
}

async fn wait_for_shutdown(token: CancellationToken) {
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!("Failed to listen for CTRL+C: {}", e);
                return;
            }
        }
        _ = terminate => {}
    }

    info!("Shutdown signal received, shutting down gracefully...");
    token.cancel();
}
