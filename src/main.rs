//! gridd — browser-automation grid distributor daemon.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use gridd::config::GridConfig;
use gridd::{rest, GridContext};

#[derive(Parser)]
#[command(name = "gridd", version, about = "Browser-automation grid distributor")]
struct Cli {
    /// HTTP port to listen on.
    #[arg(long, env = "GRIDD_PORT")]
    port: Option<u16>,

    /// Directory holding gridd.toml.
    #[arg(long, env = "GRIDD_CONFIG_DIR")]
    config_dir: Option<PathBuf>,

    /// Log filter, e.g. "debug" or "info,gridd=trace".
    #[arg(long, env = "GRIDD_LOG")]
    log: Option<String>,

    /// New-session request timeout in seconds.
    #[arg(long)]
    request_timeout: Option<u64>,

    /// Secret registering nodes must present.
    #[arg(long)]
    registration_secret: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = GridConfig::new(
        cli.port,
        cli.config_dir,
        cli.log,
        cli.request_timeout,
        cli.registration_secret,
    );

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&config.log).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!(port = config.port, "starting gridd");
    let ctx = GridContext::new(config);

    tokio::select! {
        result = rest::start_rest_server(ctx.clone()) => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
            ctx.distributor.shutdown().await;
        }
    }
    Ok(())
}
