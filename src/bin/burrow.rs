//! Tunnel client binary.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use burrow::client::TunnelClient;
use burrow::config::load_client_config;
use burrow::lifecycle::Shutdown;
use burrow::observability::logging;

#[derive(Parser)]
#[command(name = "burrow", about = "Reverse tunnel client", version)]
struct Args {
    /// Path to the client config file (TOML).
    #[arg(short, long)]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match load_client_config(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load {}: {e}", args.config.display());
            return ExitCode::FAILURE;
        }
    };

    logging::init(&config.observability.log_level);
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        server = %config.server_addr,
        proxies = config.proxies.len(),
        "burrow starting"
    );

    let shutdown = Shutdown::new();
    shutdown.trigger_on_ctrl_c();
    let client = TunnelClient::new(config);
    if let Err(e) = client.run(shutdown.subscribe()).await {
        tracing::error!(error = %e, "client failed");
        return ExitCode::FAILURE;
    }

    tracing::info!("shutdown complete");
    ExitCode::SUCCESS
}
