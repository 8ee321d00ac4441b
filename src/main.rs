//! Headless scanner binary.
//!
//! Configuration comes from the environment (a `.env` file is honored).
//! Logs go to stdout through `tracing`; filter with `RUST_LOG`.

use anyhow::Result;
use tokenscan::application::bootstrap::Application;
use tokenscan::config::Config;
use tracing::{Level, info};
use tracing_subscriber::prelude::*;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let stdout_layer = tracing_subscriber::fmt::layer().with_target(false);
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .with(stdout_layer)
        .init();

    info!("tokenscan {} starting...", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;
    info!(
        pairs = config.symbols.len(),
        shards = config.worker_shards,
        "Configuration loaded"
    );

    let app = Application::build(config).await?;
    let running = app.start().await?;
    info!("Scanner running. Press Ctrl+C to shut down.");

    tokio::signal::ctrl_c().await?;
    running.shutdown().await;

    Ok(())
}
