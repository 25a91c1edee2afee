//! Intercepting control-plane proxy.
//!
//! Run with:
//! ```bash
//! control-mitm --upstream-url https://controlplane.example.com --state-file ./state.json
//! ```

use anyhow::Result;
use clap::Parser;
use control_mitm::args::Args;
use control_mitm::{run_server, ProxyConfig};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "control_mitm=debug,info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    info!("Starting control-mitm");
    info!("  Listen: {}", args.bind_addr);
    info!("  State file: {}", args.state_file.display());
    info!("  Upstream: {}", args.upstream_url);

    let config = ProxyConfig::from_args(args)?;
    run_server(config).await
}
