//! # Tandem Server
//!
//! Hosts the event bus behind HTTP long-poll, SSE and WebSocket endpoints.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! tandem
//!
//! # Run with a specific config file
//! tandem --config /path/to/tandem.toml
//!
//! # Override options from the environment
//! TANDEM_PORT=8080 TANDEM_BUS__MAX_CONNECTIONS=500 tandem
//! ```

mod config;
mod handlers;
mod metrics;

use anyhow::Result;
use tandem_core::EventBus;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tandem=info,tandem_core=info,tandem_server=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args: Vec<String> = std::env::args().collect();
    let config = match args.iter().position(|a| a == "--config") {
        Some(i) => match args.get(i + 1) {
            Some(path) => config::Config::from_file(path)?,
            None => anyhow::bail!("--config requires a path"),
        },
        None => config::Config::load()?,
    };

    tracing::info!("Starting Tandem server on {}:{}", config.host, config.port);

    metrics::init_metrics();

    let bus = EventBus::new(config.bus.clone())?;
    bus.start()?;

    // Stopping the bus first ends open streams and waits, so the graceful
    // HTTP shutdown is not held up by them.
    let shutdown = CancellationToken::new();
    tokio::spawn({
        let bus = bus.clone();
        let shutdown = shutdown.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    tracing::info!("Shutdown signal received");
                    bus.shutdown().await;
                    shutdown.cancel();
                }
                Err(e) => tracing::error!("Failed to listen for shutdown signal: {}", e),
            }
        }
    });

    let served = handlers::run_server(bus.clone(), config, shutdown).await;
    bus.shutdown().await;
    tracing::info!("Tandem server stopped");

    served
}
