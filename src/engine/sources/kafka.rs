// Kafka event source (librdkafka)

//! # Kafka Event Source
//!
//! Built only with the `kafka` cargo feature. Each consumer is an rdkafka
//! `StreamConsumer` in its own consumer group so that every Binding sees
//! every message of its topics. New groups start at the latest offset, so a
//! consumer is handed out only after the group rebalance assigned it
//! partitions; anything produced after that point is delivered.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::RDKafkaErrorCode;
use rdkafka::message::{BorrowedMessage, Headers, Message};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::ClientConfig;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{Backoff, ConsumerPoll, EventConsumer, EventSource, RetryPolicy, SourceBackend};
use crate::models::{RawEvent, SourceKey};
use crate::{EventRouterError, Result};

const PRODUCE_TIMEOUT: Duration = Duration::from_secs(10);

/// How long `open_consumer` waits for the first partition assignment
pub const DEFAULT_ASSIGNMENT_TIMEOUT: Duration = Duration::from_secs(10);

/// Rebalances are served while the consumer is polled
const ASSIGNMENT_POLL: Duration = Duration::from_millis(100);

pub struct KafkaEventSource {
    provider_id: String,
    brokers: String,
    producer: FutureProducer,
    admin: AdminClient<DefaultClientContext>,
    retry: RetryPolicy,
    assignment_timeout: Duration,
}

impl KafkaEventSource {
    pub fn new(provider_id: impl Into<String>, brokers: &[String], retry: RetryPolicy) -> Result<Self> {
        let provider_id = provider_id.into();
        let brokers = if brokers.is_empty() {
            "localhost:9092".to_string()
        } else {
            brokers.join(",")
        };

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .set("message.timeout.ms", "10000")
            .create()
            .map_err(|e| EventRouterError::SourceUnavailable(format!("failed to create producer: {e}")))?;

        let admin: AdminClient<DefaultClientContext> = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .create()
            .map_err(|e| EventRouterError::SourceUnavailable(format!("failed to create admin client: {e}")))?;

        info!(provider = %provider_id, brokers = %brokers, "Kafka event source created");

        Ok(Self {
            provider_id,
            brokers,
            producer,
            admin,
            retry,
            assignment_timeout: DEFAULT_ASSIGNMENT_TIMEOUT,
        })
    }

    pub fn with_assignment_timeout(mut self, timeout: Duration) -> Self {
        self.assignment_timeout = timeout;
        self
    }

    fn consumer_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &self.brokers)
            .set("group.id", format!("event-router-{}", Uuid::new_v4()))
            .set("auto.offset.reset", "latest")
            .set("enable.auto.commit", "true")
            .set("enable.partition.eof", "false");
        config
    }
}

#[async_trait]
impl EventSource for KafkaEventSource {
    fn provider_id(&self) -> &str {
        &self.provider_id
    }

    fn backend(&self) -> SourceBackend {
        SourceBackend::Kafka
    }

    async fn open_consumer(&self, key: &SourceKey) -> Result<Box<dyn EventConsumer>> {
        let consumer: StreamConsumer = self
            .consumer_config()
            .create()
            .map_err(|e| EventRouterError::SourceUnavailable(format!("failed to create consumer: {e}")))?;

        let topics: Vec<&str> = key.topics.iter().map(String::as_str).collect();
        consumer
            .subscribe(&topics)
            .map_err(|e| EventRouterError::SourceUnavailable(format!("failed to subscribe: {e}")))?;

        let early = match wait_for_assignment(&consumer, key, self.assignment_timeout).await {
            Ok(early) => early,
            Err(e) => {
                consumer.unsubscribe();
                return Err(e);
            }
        };

        debug!(provider = %self.provider_id, key = %key, "Kafka consumer opened");
        Ok(Box::new(KafkaConsumer {
            key: key.clone(),
            consumer: Some(consumer),
            pending: early,
            backoff: self.retry.backoff(),
        }))
    }

    async fn produce(&self, topic: &str, payload: Bytes) -> Result<()> {
        let record = FutureRecord::<(), [u8]>::to(topic).payload(&payload[..]);
        self.producer
            .send(record, PRODUCE_TIMEOUT)
            .await
            .map(|_| ())
            .map_err(|(e, _)| EventRouterError::SourceUnavailable(format!("failed to produce to {topic}: {e}")))
    }

    async fn create_topic(&self, topic: &str, partitions: i32, replication: i32) -> Result<()> {
        let new_topic = NewTopic::new(topic, partitions.max(1), TopicReplication::Fixed(replication.max(1)));
        let results = self
            .admin
            .create_topics(&[new_topic], &AdminOptions::new())
            .await
            .map_err(|e| EventRouterError::Source(format!("failed to create topic {topic}: {e}")))?;

        for result in results {
            match result {
                Ok(_) | Err((_, RDKafkaErrorCode::TopicAlreadyExists)) => {}
                Err((name, code)) => {
                    return Err(EventRouterError::Source(format!(
                        "failed to create topic {name}: {code}"
                    )))
                }
            }
        }
        Ok(())
    }

    async fn delete_topic(&self, topic: &str) -> Result<()> {
        let results = self
            .admin
            .delete_topics(&[topic], &AdminOptions::new())
            .await
            .map_err(|e| EventRouterError::Source(format!("failed to delete topic {topic}: {e}")))?;

        for result in results {
            match result {
                Ok(_) | Err((_, RDKafkaErrorCode::UnknownTopicOrPartition)) => {}
                Err((name, code)) => {
                    return Err(EventRouterError::Source(format!(
                        "failed to delete topic {name}: {code}"
                    )))
                }
            }
        }
        Ok(())
    }
}

/// Polls `consumer` until the group assigned it partitions.
///
/// Messages that arrive while waiting are returned so nothing is lost.
async fn wait_for_assignment(
    consumer: &StreamConsumer,
    key: &SourceKey,
    timeout: Duration,
) -> Result<VecDeque<RawEvent>> {
    let deadline = Instant::now() + timeout;
    let mut early = VecDeque::new();

    loop {
        let assigned = consumer
            .assignment()
            .map(|partitions| partitions.count() > 0)
            .unwrap_or(false);
        if assigned {
            return Ok(early);
        }
        if Instant::now() >= deadline {
            return Err(EventRouterError::SourceUnavailable(format!(
                "no partitions assigned for {} within {}ms",
                key,
                timeout.as_millis()
            )));
        }

        match tokio::time::timeout(ASSIGNMENT_POLL, consumer.recv()).await {
            Ok(Ok(message)) => early.push_back(raw_event(key, &message)),
            Ok(Err(e)) => debug!(key = %key, error = %e, "Kafka error while waiting for assignment"),
            Err(_) => {}
        }
    }
}

fn raw_event(key: &SourceKey, message: &BorrowedMessage<'_>) -> RawEvent {
    let payload = message
        .payload()
        .map(Bytes::copy_from_slice)
        .unwrap_or_default();
    let headers = message
        .headers()
        .map(|headers| {
            headers
                .iter()
                .filter_map(|h| {
                    h.value
                        .map(|v| (h.key.to_string(), String::from_utf8_lossy(v).into_owned()))
                })
                .collect()
        })
        .unwrap_or_default();

    RawEvent::new(key.clone(), message.topic(), payload)
        .with_partition(message.partition())
        .with_headers(headers)
}

struct KafkaConsumer {
    key: SourceKey,
    consumer: Option<StreamConsumer>,
    /// Received before the consumer was handed out
    pending: VecDeque<RawEvent>,
    backoff: Backoff,
}

#[async_trait]
impl EventConsumer for KafkaConsumer {
    async fn next_event(&mut self) -> ConsumerPoll {
        if let Some(event) = self.pending.pop_front() {
            return ConsumerPoll::Event(event);
        }

        loop {
            let Some(consumer) = self.consumer.as_ref() else {
                return ConsumerPoll::Eof;
            };

            match consumer.recv().await {
                Ok(message) => {
                    self.backoff.reset();
                    return ConsumerPoll::Event(raw_event(&self.key, &message));
                }
                Err(e) => {
                    warn!(key = %self.key, error = %e, "Kafka consumer error");
                    if !self.backoff.wait().await {
                        return ConsumerPoll::Failed(EventRouterError::Source(format!(
                            "Kafka consumer for {} failed after {} retries: {e}",
                            self.key,
                            self.backoff.attempts()
                        )));
                    }
                }
            }
        }
    }

    async fn close(&mut self) {
        if let Some(consumer) = self.consumer.take() {
            consumer.unsubscribe();
            debug!(key = %self.key, "Kafka consumer closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_consumer_requires_partition_assignment() {
        // Nothing listens on this port, so the group never rebalances
        let source = KafkaEventSource::new("my-kafka", &["127.0.0.1:1".to_string()], RetryPolicy::default())
            .unwrap()
            .with_assignment_timeout(Duration::from_millis(300));

        let started = Instant::now();
        let result = source
            .open_consumer(&SourceKey::new("my-kafka", ["employeeUpdated"]))
            .await;

        assert!(matches!(result, Err(EventRouterError::SourceUnavailable(_))));
        assert!(started.elapsed() >= Duration::from_millis(300));
    }
}
