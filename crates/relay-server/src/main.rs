//! # Relay Server
//!
//! Distributed real-time chat delivery. Clients connect to `/ws/{channel}`;
//! every message is published to a shared NSQ topic and fanned out by each
//! node to its local clients on the same channel.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings (NSQ on localhost)
//! relay
//!
//! # Single node, no NSQ
//! RELAY__BROKER__KIND=memory relay
//!
//! # Run with a specific config file
//! RELAY_CONFIG=/path/to/relay.toml relay
//!
//! # Run with environment variables
//! RELAY_PORT=8080 RELAY_HOST=0.0.0.0 relay
//! ```

mod config;
mod handlers;
mod metrics;
mod session;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "relay=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = match std::env::var_os("RELAY_CONFIG") {
        Some(path) => config::Config::from_file(path)?,
        None => config::Config::load()?,
    };

    tracing::info!("Starting Relay server on {}:{}", config.host, config.port);

    // Initialize metrics
    metrics::init_metrics();

    // Start the server
    handlers::run_server(config).await?;

    Ok(())
}
