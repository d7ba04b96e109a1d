// Router configuration

//! # Router Configuration
//!
//! Settings are layered with the `config` crate:
//!
//! 1. built-in defaults ([`RouterConfig::default`])
//! 2. an optional YAML file (`CONFIG_PATH`, default `config.yaml`)
//! 3. environment variables prefixed with `ROUTER__`, nested keys separated
//!    by `__` (`ROUTER__ENGINE__OUTBOUND_QUEUE_SIZE=256`)
//!
//! ```yaml
//! listen_addr: 0.0.0.0:3002
//! providers:
//!   - id: my-kafka
//!     backend: memory
//! events:
//!   - field_name: employeeUpdatedMyKafka
//!     provider_id: my-kafka
//!     topics: [employeeUpdated]
//!     type_name: Employee
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::engine::catalog::EventsCatalog;
use crate::engine::connection::ConnectionSettings;
use crate::engine::entities::{EntitySource, StaticEntitySource, SubgraphEntitySource};
use crate::engine::sources::{RetryPolicy, SourceBackend};
use crate::models::EventFieldConfig;
use crate::{EventRouterError, Result};

pub const DEFAULT_CONFIG_PATH: &str = "config.yaml";
pub const ENV_PREFIX: &str = "ROUTER";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    pub listen_addr: String,
    pub log_level: String,
    /// Drain window for in-flight events on shutdown
    pub shutdown_delay_ms: u64,
    pub engine: EngineConfig,
    pub security: SecurityConfig,
    pub providers: Vec<ProviderConfig>,
    pub events: Vec<EventFieldConfig>,
    pub entities: EntitySourceConfig,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:3002".to_string(),
            log_level: "info".to_string(),
            shutdown_delay_ms: 5_000,
            engine: EngineConfig::default(),
            security: SecurityConfig::default(),
            providers: Vec::new(),
            events: Vec::new(),
            entities: EntitySourceConfig::default(),
        }
    }
}

/// Subscription engine tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Wait on socket readiness instead of a fixed read deadline
    pub enable_readiness_polling: bool,
    pub websocket_read_timeout_ms: u64,
    pub outbound_queue_size: usize,
    pub slow_consumer_grace_ms: u64,
    pub resolver_concurrency: usize,
    pub connection_init_timeout_ms: u64,
    pub max_subscriptions_per_connection: usize,
    pub sse_keep_alive_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            enable_readiness_polling: true,
            websocket_read_timeout_ms: 5_000,
            outbound_queue_size: 128,
            slow_consumer_grace_ms: 5_000,
            resolver_concurrency: 64,
            connection_init_timeout_ms: 10_000,
            max_subscriptions_per_connection: 100,
            sse_keep_alive_ms: 15_000,
        }
    }
}

impl EngineConfig {
    pub fn websocket_read_timeout(&self) -> Duration {
        Duration::from_millis(self.websocket_read_timeout_ms)
    }

    pub fn connection_init_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_init_timeout_ms)
    }

    pub fn sse_keep_alive(&self) -> Duration {
        Duration::from_millis(self.sse_keep_alive_ms)
    }

    pub fn slow_consumer_grace(&self) -> Duration {
        Duration::from_millis(self.slow_consumer_grace_ms)
    }

    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            queue_size: self.outbound_queue_size,
            slow_consumer_grace: self.slow_consumer_grace(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Refuse every subscription with a single error frame
    pub block_subscriptions: bool,
}

/// One event provider (broker connection)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub id: String,
    pub backend: SourceBackend,
    #[serde(default)]
    pub urls: Vec<String>,
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl ProviderConfig {
    pub fn memory(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            backend: SourceBackend::Memory,
            urls: Vec::new(),
            retry: RetryPolicy::default(),
        }
    }
}

/// Where missing entity fields come from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EntitySourceConfig {
    /// Federation subgraph answering `_entities` queries
    pub subgraph_url: Option<String>,
    pub subgraph_timeout_ms: u64,
    /// Static records by type name, used when no subgraph is configured
    pub records: HashMap<String, Vec<Value>>,
}

impl Default for EntitySourceConfig {
    fn default() -> Self {
        Self {
            subgraph_url: None,
            subgraph_timeout_ms: 5_000,
            records: HashMap::new(),
        }
    }
}

impl EntitySourceConfig {
    pub fn build(&self) -> Result<Option<Arc<dyn EntitySource>>> {
        if let Some(url) = &self.subgraph_url {
            let source =
                SubgraphEntitySource::new(url, Duration::from_millis(self.subgraph_timeout_ms))?;
            return Ok(Some(Arc::new(source)));
        }
        if self.records.is_empty() {
            return Ok(None);
        }
        Ok(Some(Arc::new(StaticEntitySource::from_records(self.records.clone()))))
    }
}

impl RouterConfig {
    /// Loads defaults, then `path` (if it exists), then `ROUTER__*` variables
    pub fn load(path: &str) -> Result<Self> {
        let settings = ::config::Config::builder()
            .add_source(::config::Config::try_from(&RouterConfig::default())?)
            .add_source(::config::File::with_name(path).required(false))
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: RouterConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let settings = ::config::Config::builder()
            .add_source(::config::Config::try_from(&RouterConfig::default())?)
            .add_source(::config::File::from_str(yaml, ::config::FileFormat::Yaml))
            .build()?;

        let config: RouterConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.engine.outbound_queue_size == 0 {
            return Err(EventRouterError::Config(
                "engine.outbound_queue_size must be greater than zero".to_string(),
            ));
        }
        if self.engine.resolver_concurrency == 0 {
            return Err(EventRouterError::Config(
                "engine.resolver_concurrency must be greater than zero".to_string(),
            ));
        }

        let mut providers = HashSet::new();
        for provider in &self.providers {
            if !providers.insert(provider.id.as_str()) {
                return Err(EventRouterError::Config(format!(
                    "duplicate provider id '{}'",
                    provider.id
                )));
            }
            if provider.backend != SourceBackend::Memory && provider.urls.is_empty() {
                return Err(EventRouterError::Config(format!(
                    "provider '{}' needs at least one url",
                    provider.id
                )));
            }
        }

        for event in &self.events {
            if !providers.contains(event.provider_id.as_str()) {
                return Err(EventRouterError::Config(format!(
                    "field '{}' references unknown provider '{}'",
                    event.field_name, event.provider_id
                )));
            }
            if event.topics.is_empty() {
                return Err(EventRouterError::Config(format!(
                    "field '{}' has no topics",
                    event.field_name
                )));
            }
        }
        Ok(())
    }

    pub fn shutdown_delay(&self) -> Duration {
        Duration::from_millis(self.shutdown_delay_ms)
    }

    pub fn catalog(&self) -> EventsCatalog {
        EventsCatalog::new(self.events.iter().cloned())
    }
}
