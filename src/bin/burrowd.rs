//! Tunnel server binary.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use burrow::config::load_server_config;
use burrow::lifecycle::Shutdown;
use burrow::observability::{logging, metrics};
use burrow::server::TunnelServer;

#[derive(Parser)]
#[command(name = "burrowd", about = "Reverse tunnel server", version)]
struct Args {
    /// Path to the server config file (TOML).
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match args.config {
        Some(path) => match load_server_config(&path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("failed to load {}: {e}", path.display());
                return ExitCode::FAILURE;
            }
        },
        None => Default::default(),
    };

    logging::init(&config.observability.log_level);
    if config.observability.metrics_enabled {
        match config.observability.metrics_addr.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(e) => tracing::error!(
                address = %config.observability.metrics_addr,
                error = %e,
                "invalid metrics address"
            ),
        }
    }

    let server = match TunnelServer::bind(config).await {
        Ok(server) => server,
        Err(e) => {
            tracing::error!(error = %e, "failed to start");
            return ExitCode::FAILURE;
        }
    };
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "burrowd starting");

    let shutdown = Shutdown::new();
    shutdown.trigger_on_ctrl_c();
    if let Err(e) = server.run(shutdown.subscribe()).await {
        tracing::error!(error = %e, "server failed");
        return ExitCode::FAILURE;
    }

    tracing::info!("shutdown complete");
    ExitCode::SUCCESS
}
