// Event Router - subscription server
// Run with: cargo run --bin router

//! # Event Router Server Binary
//!
//! Loads the router configuration, connects every configured event provider
//! and serves GraphQL subscriptions over WebSocket and SSE until Ctrl-C or
//! SIGTERM. On shutdown in-flight events are drained for `shutdown_delay_ms`
//! before the remaining subscriptions are completed.
//!
//! ```text
//! main()
//!   ↓ loads
//! RouterConfig (defaults → config.yaml → ROUTER__* env)
//!   ↓ builds
//! RouterServerBuilder → SourceRegistry, EventsCatalog, SubscriptionRegistry
//!   ↓ serves
//! axum Router (/graphql, /health, /health/subscriptions)
//! ```

use anyhow::Context;
use dotenv::dotenv;
use event_router::config::DEFAULT_CONFIG_PATH;
use event_router::{RouterConfig, RouterServerBuilder};
use std::env;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = dotenv() {
        // .env is optional
        eprintln!("Warning: Could not load .env file: {}", e);
    }

    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let config = RouterConfig::load(&config_path)
        .with_context(|| format!("failed to load configuration from {}", config_path))?;

    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str()));
    tracing_subscriber::fmt().with_env_filter(filter).compact().init();

    info!("🚀 Starting Event Router...");
    info!("=====================================");
    info!("Config: {}", config_path);
    info!("Listen: {}", config.listen_addr);
    info!("Providers: {}", config.providers.len());
    info!("Event fields: {}", config.events.len());
    info!(
        "Readiness polling: {}",
        if config.engine.enable_readiness_polling {
            "evented".to_string()
        } else {
            format!("read deadline {}ms", config.engine.websocket_read_timeout_ms)
        }
    );

    RouterServerBuilder::new()
        .with_config(config)
        .build_and_run()
        .await?;

    Ok(())
}
