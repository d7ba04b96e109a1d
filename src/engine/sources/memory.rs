// In-process event source

//! # Memory Event Source
//!
//! A broker that lives inside the router process. Each topic is a tokio
//! broadcast channel with a single partition (`0`). It backs single-node
//! deployments and every engine test.
//!
//! Outages can be simulated with [`MemoryEventSource::set_available`]: while
//! unavailable, `produce` and `open_consumer` fail with `SourceUnavailable`
//! and open consumers enter their retry loop, failing the Binding once the
//! retry budget is spent.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::stream::{select_all, BoxStream, SelectAll, StreamExt};
use tokio::sync::{broadcast, watch};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, info, warn};

use super::{Backoff, ConsumerPoll, EventConsumer, EventSource, RetryPolicy, SourceBackend};
use crate::models::{RawEvent, SourceKey};
use crate::{EventRouterError, Result};

const TOPIC_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
struct MemoryRecord {
    payload: Bytes,
}

type TopicStream =
    BoxStream<'static, (String, std::result::Result<MemoryRecord, BroadcastStreamRecvError>)>;

struct MemoryTopic {
    sender: broadcast::Sender<MemoryRecord>,
    partitions: i32,
}

/// Consumer bookkeeping, used by tests to check consumer reuse and cleanup
#[derive(Debug, Default)]
pub struct MemoryStats {
    pub consumers_opened: AtomicUsize,
    pub consumers_closed: AtomicUsize,
    pub messages_produced: AtomicU64,
}

impl MemoryStats {
    pub fn consumers_opened(&self) -> usize {
        self.consumers_opened.load(Ordering::Acquire)
    }

    pub fn consumers_closed(&self) -> usize {
        self.consumers_closed.load(Ordering::Acquire)
    }

    pub fn messages_produced(&self) -> u64 {
        self.messages_produced.load(Ordering::Acquire)
    }
}

pub struct MemoryEventSource {
    provider_id: String,
    topics: DashMap<String, MemoryTopic>,
    retry: RetryPolicy,
    available: watch::Sender<bool>,
    stats: Arc<MemoryStats>,
}

impl MemoryEventSource {
    pub fn new(provider_id: impl Into<String>) -> Self {
        Self::with_retry(provider_id, RetryPolicy::default())
    }

    pub fn with_retry(provider_id: impl Into<String>, retry: RetryPolicy) -> Self {
        let (available, _) = watch::channel(true);
        Self {
            provider_id: provider_id.into(),
            topics: DashMap::new(),
            retry,
            available,
            stats: Arc::new(MemoryStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<MemoryStats> {
        Arc::clone(&self.stats)
    }

    /// Simulates a broker outage (`false`) or recovery (`true`)
    pub fn set_available(&self, available: bool) {
        self.available.send_replace(available);
        info!(provider = %self.provider_id, available, "memory broker availability changed");
    }

    pub fn is_available(&self) -> bool {
        *self.available.borrow()
    }

    pub fn topic_exists(&self, topic: &str) -> bool {
        self.topics.contains_key(topic)
    }

    fn ensure_available(&self) -> Result<()> {
        if self.is_available() {
            Ok(())
        } else {
            Err(EventRouterError::SourceUnavailable(format!(
                "memory broker '{}' is unavailable",
                self.provider_id
            )))
        }
    }

    // Topics are created on first use, like a broker with auto-create enabled
    fn sender(&self, topic: &str) -> broadcast::Sender<MemoryRecord> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| MemoryTopic {
                sender: broadcast::channel(TOPIC_CAPACITY).0,
                partitions: 1,
            })
            .sender
            .clone()
    }
}

#[async_trait]
impl EventSource for MemoryEventSource {
    fn provider_id(&self) -> &str {
        &self.provider_id
    }

    fn backend(&self) -> SourceBackend {
        SourceBackend::Memory
    }

    async fn open_consumer(&self, key: &SourceKey) -> Result<Box<dyn EventConsumer>> {
        self.ensure_available()?;

        let streams: Vec<TopicStream> = key
            .topics
            .iter()
            .map(|topic| {
                let name = topic.clone();
                BroadcastStream::new(self.sender(topic).subscribe())
                    .map(move |item| (name.clone(), item))
                    .boxed()
            })
            .collect();

        self.stats.consumers_opened.fetch_add(1, Ordering::AcqRel);
        debug!(provider = %self.provider_id, key = %key, "memory consumer opened");

        Ok(Box::new(MemoryConsumer {
            key: key.clone(),
            stream: select_all(streams),
            available: self.available.subscribe(),
            backoff: self.retry.backoff(),
            stats: Arc::clone(&self.stats),
            closed: false,
        }))
    }

    async fn produce(&self, topic: &str, payload: Bytes) -> Result<()> {
        self.ensure_available()?;
        let receivers = self.sender(topic).send(MemoryRecord { payload }).unwrap_or(0);
        self.stats.messages_produced.fetch_add(1, Ordering::AcqRel);
        debug!(provider = %self.provider_id, topic, receivers, "memory message produced");
        Ok(())
    }

    async fn create_topic(&self, topic: &str, partitions: i32, _replication: i32) -> Result<()> {
        self.ensure_available()?;
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| MemoryTopic {
                sender: broadcast::channel(TOPIC_CAPACITY).0,
                partitions: partitions.max(1),
            });
        Ok(())
    }

    async fn delete_topic(&self, topic: &str) -> Result<()> {
        self.ensure_available()?;
        if let Some((_, removed)) = self.topics.remove(topic) {
            debug!(topic, partitions = removed.partitions, "memory topic deleted");
        }
        Ok(())
    }
}

struct MemoryConsumer {
    key: SourceKey,
    stream: SelectAll<TopicStream>,
    available: watch::Receiver<bool>,
    backoff: Backoff,
    stats: Arc<MemoryStats>,
    closed: bool,
}

#[async_trait]
impl EventConsumer for MemoryConsumer {
    async fn next_event(&mut self) -> ConsumerPoll {
        loop {
            if self.closed {
                return ConsumerPoll::Eof;
            }

            let available = *self.available.borrow_and_update();
            if !available {
                if !self.backoff.wait().await {
                    return ConsumerPoll::Failed(EventRouterError::Source(format!(
                        "memory broker unavailable after {} retries",
                        self.backoff.attempts()
                    )));
                }
                continue;
            }

            tokio::select! {
                item = self.stream.next() => match item {
                    Some((topic, Ok(record))) => {
                        self.backoff.reset();
                        return ConsumerPoll::Event(
                            RawEvent::new(self.key.clone(), topic, record.payload).with_partition(0),
                        );
                    }
                    Some((topic, Err(BroadcastStreamRecvError::Lagged(skipped)))) => {
                        warn!(topic = %topic, skipped, "memory consumer lagged, messages dropped");
                    }
                    None => return ConsumerPoll::Eof,
                },
                changed = self.available.changed() => {
                    if changed.is_err() {
                        return ConsumerPoll::Eof;
                    }
                }
            }
        }
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.stream = select_all(Vec::new());
        self.stats.consumers_closed.fetch_add(1, Ordering::AcqRel);
        debug!(key = %self.key, "memory consumer closed");
    }
}
