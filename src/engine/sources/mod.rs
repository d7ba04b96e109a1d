// Event source adapters

//! # Event Sources
//!
//! Every broker backend implements [`EventSource`]. The registry only ever
//! talks to `Arc<dyn EventSource>` and the consumers it opens, so the set of
//! backends is closed at configuration time ([`SourceBackend`]) but open in
//! code.
//!
//! ## Consumer Contract
//!
//! - `next_event` yields events until the consumer is closed, the stream ends
//!   (`Eof`) or the retry budget is spent (`Failed`). Transient failures are
//!   retried inside the adapter with [`RetryPolicy`].
//! - `close` is idempotent.
//!
//! Delivery is at-least-once per partition; there is no ordering guarantee
//! across partitions or topics.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::ProviderConfig;
use crate::models::{RawEvent, SourceKey};
use crate::{EventRouterError, Result};

pub mod memory;
pub mod nats;

#[cfg(feature = "kafka")]
pub mod kafka;

/// Backends known to the configuration layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceBackend {
    Memory,
    Nats,
    Kafka,
}

impl std::fmt::Display for SourceBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceBackend::Memory => write!(f, "memory"),
            SourceBackend::Nats => write!(f, "nats"),
            SourceBackend::Kafka => write!(f, "kafka"),
        }
    }
}

/// What a consumer produced on one poll
#[derive(Debug)]
pub enum ConsumerPoll {
    Event(RawEvent),
    /// The underlying stream ended for good
    Eof,
    /// Retry budget exhausted; terminal for the Binding
    Failed(EventRouterError),
}

/// An open broker consumer for one [`SourceKey`]
#[async_trait]
pub trait EventConsumer: Send {
    async fn next_event(&mut self) -> ConsumerPoll;

    /// Releases broker resources. Safe to call more than once.
    async fn close(&mut self);
}

/// Capability interface of one broker backend
#[async_trait]
pub trait EventSource: Send + Sync {
    fn provider_id(&self) -> &str;

    fn backend(&self) -> SourceBackend;

    /// Opens a consumer over every topic of `key`.
    ///
    /// Returns only once the broker confirmed the subscription.
    async fn open_consumer(&self, key: &SourceKey) -> Result<Box<dyn EventConsumer>>;

    /// Publishes one message; `Ok` is the broker acknowledgement.
    async fn produce(&self, topic: &str, payload: Bytes) -> Result<()>;

    async fn create_topic(&self, topic: &str, partitions: i32, replication: i32) -> Result<()>;

    /// Deleting a topic that does not exist succeeds.
    async fn delete_topic(&self, topic: &str) -> Result<()>;
}

/// Exponential backoff with jitter for transient broker failures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff_ms: 100,
            max_backoff_ms: 5_000,
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// A policy that gives up on the first failure
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (0-based), before jitter
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt.min(32) as i32);
        let millis = (self.initial_backoff_ms as f64 * factor).min(self.max_backoff_ms as f64);
        Duration::from_millis(millis as u64)
    }

    /// `base_delay` with up to ±20% jitter, capped at `max_backoff_ms`
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt).as_millis() as f64;
        let jitter = rand::thread_rng().gen_range(0.8..=1.2);
        let millis = (base * jitter).min(self.max_backoff_ms as f64);
        Duration::from_millis(millis as u64)
    }

    pub fn backoff(&self) -> Backoff {
        Backoff {
            policy: self.clone(),
            attempt: 0,
        }
    }
}

/// Retry state of one consumer
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    attempt: u32,
}

impl Backoff {
    /// Sleeps before the next retry; false once the budget is spent
    pub async fn wait(&mut self) -> bool {
        if self.attempt >= self.policy.max_retries {
            return false;
        }
        let delay = self.policy.delay(self.attempt);
        self.attempt += 1;
        debug!(attempt = self.attempt, delay_ms = delay.as_millis() as u64, "retrying event source");
        tokio::time::sleep(delay).await;
        true
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Event sources by provider id
#[derive(Default, Clone)]
pub struct SourceRegistry {
    sources: HashMap<String, Arc<dyn EventSource>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_source(mut self, source: Arc<dyn EventSource>) -> Self {
        self.insert(source);
        self
    }

    pub fn insert(&mut self, source: Arc<dyn EventSource>) {
        self.sources.insert(source.provider_id().to_string(), source);
    }

    pub fn get(&self, provider_id: &str) -> Result<Arc<dyn EventSource>> {
        self.sources
            .get(provider_id)
            .cloned()
            .ok_or_else(|| EventRouterError::NotFound(format!("event provider '{}'", provider_id)))
    }

    pub fn provider_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sources.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Connects every configured provider
    pub async fn from_config(providers: &[ProviderConfig]) -> Result<Self> {
        let mut registry = Self::new();
        for provider in providers {
            let source = connect_provider(provider).await?;
            info!(
                provider = %provider.id,
                backend = %provider.backend,
                "🔌 Event source ready"
            );
            registry.insert(source);
        }
        Ok(registry)
    }
}

async fn connect_provider(provider: &ProviderConfig) -> Result<Arc<dyn EventSource>> {
    match provider.backend {
        SourceBackend::Memory => Ok(Arc::new(memory::MemoryEventSource::with_retry(
            &provider.id,
            provider.retry.clone(),
        ))),
        SourceBackend::Nats => {
            let source =
                nats::NatsEventSource::connect(&provider.id, &provider.urls, provider.retry.clone())
                    .await?;
            Ok(Arc::new(source))
        }
        #[cfg(feature = "kafka")]
        SourceBackend::Kafka => {
            let source =
                kafka::KafkaEventSource::new(&provider.id, &provider.urls, provider.retry.clone())?;
            Ok(Arc::new(source))
        }
        #[cfg(not(feature = "kafka"))]
        SourceBackend::Kafka => Err(EventRouterError::Config(format!(
            "provider '{}' uses the kafka backend but the router was built without the `kafka` feature",
            provider.id
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_delay_grows_and_caps() {
        let policy = RetryPolicy {
            max_retries: 10,
            initial_backoff_ms: 100,
            max_backoff_ms: 1_000,
            multiplier: 2.0,
        };

        assert_eq!(policy.base_delay(0), Duration::from_millis(100));
        assert_eq!(policy.base_delay(1), Duration::from_millis(200));
        assert_eq!(policy.base_delay(3), Duration::from_millis(800));
        assert_eq!(policy.base_delay(4), Duration::from_millis(1_000));
        assert_eq!(policy.base_delay(30), Duration::from_millis(1_000));
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let policy = RetryPolicy::default();
        for attempt in 0..8 {
            let base = policy.base_delay(attempt).as_millis() as f64;
            let delay = policy.delay(attempt).as_millis() as f64;
            assert!(delay >= (base * 0.8).floor() - 1.0);
            assert!(delay <= policy.max_backoff_ms as f64);
        }
    }

    #[tokio::test]
    async fn test_backoff_budget() {
        let mut backoff = RetryPolicy {
            max_retries: 2,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
            multiplier: 2.0,
        }
        .backoff();

        assert!(backoff.wait().await);
        assert!(backoff.wait().await);
        assert!(!backoff.wait().await);
        assert_eq!(backoff.attempts(), 2);

        backoff.reset();
        assert!(backoff.wait().await);
        assert!(!RetryPolicy::none().backoff().wait().await);
    }

    #[test]
    fn test_registry_lookup() {
        let registry = SourceRegistry::new()
            .with_source(Arc::new(memory::MemoryEventSource::new("my-kafka")))
            .with_source(Arc::new(memory::MemoryEventSource::new("default")));

        assert_eq!(registry.provider_ids(), vec!["default".to_string(), "my-kafka".to_string()]);
        assert!(registry.get("my-kafka").is_ok());
        assert!(matches!(registry.get("missing"), Err(EventRouterError::NotFound(_))));
    }

    #[test]
    fn test_backend_names() {
        let backend: SourceBackend = serde_json::from_str("\"nats\"").unwrap();
        assert_eq!(backend, SourceBackend::Nats);
        assert_eq!(SourceBackend::Kafka.to_string(), "kafka");
    }
}
