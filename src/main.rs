use anyhow::Context;
use clap::Parser;
use restvirt_csi::config::Config;
use restvirt_csi::csi::Role;
use restvirt_csi::csi::server;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "restvirt-csi", version, about = "CSI plugin for restvirt volumes")]
struct Cli {
    /// Plane to serve
    #[arg(value_enum)]
    role: Role,

    /// CSI endpoint, `unix:///path/csi.sock` or a bare socket path
    #[arg(long, env = "CSI_ADDRESS", default_value = "unix:///csi/csi.sock")]
    csi_address: String,

    /// restvirt API endpoint
    #[arg(long, env = "RESTVIRT_API_ENDPOINT")]
    api_endpoint: Option<String>,

    /// Configuration file (TOML, YAML or JSON)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Serve Prometheus metrics on this address
    #[arg(long)]
    metrics_address: Option<String>,

    /// Log as JSON lines
    #[arg(long)]
    log_json: bool,
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "restvirt_csi=debug,info".into());

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let mut config = Config::load(cli.config.as_deref()).context("Failed to load config")?;
    if let Some(endpoint) = cli.api_endpoint {
        config.backend.endpoint = endpoint;
    }
    if let Some(addr) = cli.metrics_address {
        config.server.metrics_address = Some(addr);
    }

    tracing::info!(role = ?cli.role, version = env!("CARGO_PKG_VERSION"), "Starting restvirt-csi");

    server::run(cli.role, &cli.csi_address, config).await
}
