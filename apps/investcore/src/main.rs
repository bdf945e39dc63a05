//! investcore-service — the investing-core backend binary.
//!
//! Startup sequence:
//!   1. Load configuration from the environment
//!   2. Build the shared application state (stores, adapters, background workers)
//!   3. Serve the HTTP API until SIGTERM/Ctrl-C, then drain in-flight work

use investcore::config::Config;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,investcore=debug")),
        )
        .json()
        .init();

    let config = Config::from_env()?;
    info!(service = %config.service_name, bind_addr = %config.bind_addr, "investcore starting");

    investcore::serve(config).await
}
