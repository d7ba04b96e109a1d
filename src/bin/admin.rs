//! Event Router Admin CLI
//!
//! Topic administration and test publishing against the event providers
//! configured for the router. Mirrors what integration suites do by hand:
//! create a topic, publish a payload, clean the topic up again.

use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use event_router::config::DEFAULT_CONFIG_PATH;
use event_router::engine::sources::{EventSource, SourceBackend, SourceRegistry};
use event_router::{ProviderConfig, RouterConfig};
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "events-admin")]
#[command(about = "Event Router Admin CLI - Manage topics and publish test events")]
#[command(version = "1.0")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Router configuration file
    #[arg(long, env = "CONFIG_PATH", default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    /// Provider id to use; defaults to the first configured provider
    #[arg(short, long)]
    provider: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List configured providers
    Providers,

    /// Create a topic (no-op when it already exists)
    CreateTopic {
        topic: String,

        #[arg(long, default_value_t = 1)]
        partitions: i32,

        #[arg(long, default_value_t = 1)]
        replication: i32,
    },

    /// Delete a topic (succeeds when it does not exist)
    DeleteTopic {
        topic: String,

        /// Confirm the deletion
        #[arg(long)]
        confirm: bool,
    },

    /// Publish one payload to a topic
    Produce {
        topic: String,

        /// Payload text, usually JSON
        #[arg(conflicts_with = "file")]
        payload: Option<String>,

        /// Read the payload from a file instead
        #[arg(long)]
        file: Option<String>,

        /// Publish the payload this many times
        #[arg(long, default_value_t = 1)]
        count: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenv();
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt().with_env_filter(log_level).init();

    let config = RouterConfig::load(&cli.config)
        .with_context(|| format!("failed to load configuration from {}", cli.config))?;

    if let Commands::Providers = cli.command {
        list_providers(&config);
        return Ok(());
    }

    let provider = select_provider(&config, cli.provider.as_deref())?;
    if provider.backend == SourceBackend::Memory {
        warn!(
            "⚠️  Provider '{}' is an in-process broker; changes are not visible to a running router",
            provider.id
        );
    }
    let sources = SourceRegistry::from_config(std::slice::from_ref(provider)).await?;
    let source = sources.get(&provider.id)?;

    match cli.command {
        Commands::Providers => {}

        Commands::CreateTopic {
            topic,
            partitions,
            replication,
        } => {
            source.create_topic(&topic, partitions, replication).await?;
            info!("✅ Topic '{}' ready on '{}'", topic, provider.id);
        }

        Commands::DeleteTopic { topic, confirm } => {
            if !confirm {
                error!("❌ Delete operation requires --confirm flag for safety");
                return Ok(());
            }
            source.delete_topic(&topic).await?;
            info!("🗑️  Topic '{}' deleted from '{}'", topic, provider.id);
        }

        Commands::Produce {
            topic,
            payload,
            file,
            count,
        } => {
            let payload = read_payload(payload, file).await?;
            produce(source, &topic, payload, count).await?;
        }
    }

    Ok(())
}

fn list_providers(config: &RouterConfig) {
    if config.providers.is_empty() {
        info!("No providers configured");
        return;
    }
    for provider in &config.providers {
        info!(
            "📡 {} ({}) {}",
            provider.id,
            provider.backend,
            provider.urls.join(",")
        );
    }
}

fn select_provider<'a>(config: &'a RouterConfig, id: Option<&str>) -> Result<&'a ProviderConfig> {
    match id {
        Some(id) => config
            .providers
            .iter()
            .find(|provider| provider.id == id)
            .ok_or_else(|| anyhow!("provider '{}' is not configured", id)),
        None => config
            .providers
            .first()
            .ok_or_else(|| anyhow!("no providers configured")),
    }
}

async fn read_payload(payload: Option<String>, file: Option<String>) -> Result<Bytes> {
    match (payload, file) {
        (Some(payload), _) => Ok(Bytes::from(payload)),
        (None, Some(path)) => {
            let content = tokio::fs::read(&path)
                .await
                .with_context(|| format!("failed to read payload file {}", path))?;
            Ok(Bytes::from(content))
        }
        (None, None) => Err(anyhow!("either a payload or --file is required")),
    }
}

async fn produce(source: Arc<dyn EventSource>, topic: &str, payload: Bytes, count: u32) -> Result<()> {
    if serde_json::from_slice::<serde_json::Value>(&payload).is_err() {
        warn!("⚠️  Payload is not valid JSON; subscribers will receive an error");
    }
    for _ in 0..count {
        source.produce(topic, payload.clone()).await?;
    }
    info!("📤 Published {} message(s) to '{}'", count, topic);
    Ok(())
}
