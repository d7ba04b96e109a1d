// NATS event source

//! # NATS Event Source
//!
//! Consumers are core NATS subscriptions, one per subject of the source key,
//! merged into one stream. Topic administration maps a subject onto a
//! JetStream stream so that `create_topic`/`delete_topic` have a durable
//! counterpart on the server.
//!
//! ## Rust Learning Notes:
//!
//! ### Drop-based Cleanup
//! An `async_nats::Subscriber` unsubscribes when dropped. Closing a consumer
//! therefore only has to drop the merged stream.

use async_nats::jetstream::{self, stream, Context};
use async_nats::Client;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{select_all, BoxStream, SelectAll, StreamExt};
use tracing::{debug, info, warn};

use super::{Backoff, ConsumerPoll, EventConsumer, EventSource, RetryPolicy, SourceBackend};
use crate::models::{RawEvent, SourceKey};
use crate::{EventRouterError, Result};

pub struct NatsEventSource {
    provider_id: String,
    client: Client,
    jetstream: Context,
    retry: RetryPolicy,
}

impl NatsEventSource {
    /// Connects to the given servers (joined into one NATS URL list)
    pub async fn connect(
        provider_id: impl Into<String>,
        urls: &[String],
        retry: RetryPolicy,
    ) -> Result<Self> {
        let provider_id = provider_id.into();
        let servers = if urls.is_empty() {
            "nats://localhost:4222".to_string()
        } else {
            urls.join(",")
        };

        let client = async_nats::connect(&servers).await.map_err(|e| {
            EventRouterError::SourceUnavailable(format!("Failed to connect to NATS at {}: {}", servers, e))
        })?;
        let jetstream = jetstream::new(client.clone());
        info!(provider = %provider_id, servers = %servers, "Connected to NATS");

        Ok(Self {
            provider_id,
            client,
            jetstream,
            retry,
        })
    }
}

/// JetStream stream backing a subject: `employee.updated.>` → `EMPLOYEE_UPDATED`
pub fn stream_name(subject: &str) -> String {
    let name: String = subject
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    let trimmed = name.trim_matches('_');
    if trimmed.is_empty() {
        "EVENTS".to_string()
    } else {
        trimmed.to_string()
    }
}

async fn subscribe_all(client: &Client, key: &SourceKey) -> Result<SelectAll<BoxStream<'static, async_nats::Message>>> {
    let mut streams = Vec::with_capacity(key.topics.len());
    for subject in &key.topics {
        let subscriber = client.subscribe(subject.clone()).await.map_err(|e| {
            EventRouterError::SourceUnavailable(format!("Failed to subscribe to {}: {}", subject, e))
        })?;
        streams.push(subscriber.boxed());
    }
    // The server has processed the SUB once a flush round-trip completes
    client
        .flush()
        .await
        .map_err(|e| EventRouterError::SourceUnavailable(format!("Failed to flush NATS subscriptions: {}", e)))?;
    Ok(select_all(streams))
}

#[async_trait]
impl EventSource for NatsEventSource {
    fn provider_id(&self) -> &str {
        &self.provider_id
    }

    fn backend(&self) -> SourceBackend {
        SourceBackend::Nats
    }

    async fn open_consumer(&self, key: &SourceKey) -> Result<Box<dyn EventConsumer>> {
        let stream = subscribe_all(&self.client, key).await?;
        debug!(provider = %self.provider_id, key = %key, "NATS consumer opened");

        Ok(Box::new(NatsConsumer {
            client: self.client.clone(),
            key: key.clone(),
            stream: Some(stream),
            backoff: self.retry.backoff(),
            closed: false,
        }))
    }

    async fn produce(&self, topic: &str, payload: Bytes) -> Result<()> {
        self.client
            .publish(topic.to_string(), payload)
            .await
            .map_err(|e| EventRouterError::SourceUnavailable(format!("Failed to publish to {}: {}", topic, e)))?;
        self.client
            .flush()
            .await
            .map_err(|e| EventRouterError::SourceUnavailable(format!("Failed to flush publish to {}: {}", topic, e)))
    }

    async fn create_topic(&self, topic: &str, _partitions: i32, replication: i32) -> Result<()> {
        let name = stream_name(topic);
        let config = stream::Config {
            name: name.clone(),
            subjects: vec![topic.to_string()],
            num_replicas: replication.max(1) as usize,
            retention: stream::RetentionPolicy::Limits,
            ..Default::default()
        };

        self.jetstream
            .get_or_create_stream(config)
            .await
            .map_err(|e| EventRouterError::Source(format!("Failed to create stream {}: {}", name, e)))?;
        info!(provider = %self.provider_id, topic, stream = %name, "NATS topic ready");
        Ok(())
    }

    async fn delete_topic(&self, topic: &str) -> Result<()> {
        let name = stream_name(topic);
        if self.jetstream.get_stream(&name).await.is_err() {
            debug!(stream = %name, "stream not found, nothing to delete");
            return Ok(());
        }
        self.jetstream
            .delete_stream(&name)
            .await
            .map_err(|e| EventRouterError::Source(format!("Failed to delete stream {}: {}", name, e)))?;
        info!(provider = %self.provider_id, topic, stream = %name, "NATS topic deleted");
        Ok(())
    }
}

struct NatsConsumer {
    client: Client,
    key: SourceKey,
    stream: Option<SelectAll<BoxStream<'static, async_nats::Message>>>,
    backoff: Backoff,
    closed: bool,
}

#[async_trait]
impl EventConsumer for NatsConsumer {
    async fn next_event(&mut self) -> ConsumerPoll {
        loop {
            if self.closed {
                return ConsumerPoll::Eof;
            }

            if let Some(stream) = self.stream.as_mut() {
                match stream.next().await {
                    Some(message) => {
                        self.backoff.reset();
                        return ConsumerPoll::Event(RawEvent::new(
                            self.key.clone(),
                            message.subject.to_string(),
                            message.payload,
                        ));
                    }
                    None => {
                        warn!(key = %self.key, "NATS subscription ended, resubscribing");
                        self.stream = None;
                    }
                }
            }

            if !self.backoff.wait().await {
                return ConsumerPoll::Failed(EventRouterError::Source(format!(
                    "NATS subscription for {} lost after {} retries",
                    self.key,
                    self.backoff.attempts()
                )));
            }
            match subscribe_all(&self.client, &self.key).await {
                Ok(stream) => self.stream = Some(stream),
                Err(e) => warn!(key = %self.key, error = %e, "NATS resubscribe failed"),
            }
        }
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.stream = None;
        debug!(key = %self.key, "NATS consumer closed");
    }
}
