// Client connections and outbound queues

//! # Connections
//!
//! A [`Connection`] is the engine-side half of one client transport (a
//! WebSocket or an SSE response). The engine pushes [`OutboundFrame`]s into
//! its bounded queue; the transport's writer task drains the queue onto the
//! socket.
//!
//! If the queue stays full for longer than the slow-consumer grace period the
//! connection is closed instead of stalling the subscription pipelines that
//! feed it. Closing a connection (for any reason) goes through
//! [`ConnectionManager::release`], which cancels every subscription the
//! connection owns.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::metrics::Counters;
use super::registry::SubscriptionRegistry;
use crate::models::{ConnectionId, GraphQLError, Outcome, ResolvedMessage, SubscriptionId, TransportKind};
use crate::{EventRouterError, Result};

/// What the engine asks a transport to send
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// A GraphQL response payload (`{"data":…}` or errors with null data)
    Next(Value),
    /// Per-message errors; the subscription stays open
    Error(Vec<GraphQLError>),
    /// The subscription ended
    Complete,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutboundFrame {
    /// Protocol-level subscription id chosen by the client
    pub client_id: String,
    pub frame: Frame,
}

impl OutboundFrame {
    pub fn next(client_id: impl Into<String>, payload: Value) -> Self {
        Self {
            client_id: client_id.into(),
            frame: Frame::Next(payload),
        }
    }

    pub fn error(client_id: impl Into<String>, errors: Vec<GraphQLError>) -> Self {
        Self {
            client_id: client_id.into(),
            frame: Frame::Error(errors),
        }
    }

    pub fn complete(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            frame: Frame::Complete,
        }
    }

    pub fn from_resolved(client_id: impl Into<String>, message: ResolvedMessage) -> Self {
        match message.outcome {
            Outcome::Data(_) => Self::next(client_id, message.to_payload()),
            Outcome::Errors(errors) => Self::error(client_id, errors),
        }
    }

    /// `next` and `error` frames count as sent messages
    pub fn is_message(&self) -> bool {
        !matches!(self.frame, Frame::Complete)
    }
}

/// Engine-side state of one client connection
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    kind: TransportKind,
    outbound: mpsc::Sender<OutboundFrame>,
    /// Owned subscriptions: server id → client id
    subscriptions: Mutex<HashMap<SubscriptionId, String>>,
    closed: AtomicBool,
    cancel: CancellationToken,
    grace: Duration,
    counters: Arc<Counters>,
}

impl Connection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Cancelled once the connection is closed
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Queues one frame, waiting at most the slow-consumer grace period.
    ///
    /// On timeout the connection is closed and `Transport` is returned.
    pub async fn deliver(&self, frame: OutboundFrame) -> Result<()> {
        if self.is_closed() {
            return Err(EventRouterError::Transport(format!("connection {} is closed", self.id)));
        }

        let counts = frame.is_message();
        match tokio::time::timeout(self.grace, self.outbound.send(frame)).await {
            Ok(Ok(())) => {
                if counts {
                    self.counters.message_sent();
                }
                Ok(())
            }
            Ok(Err(_)) => {
                self.close();
                Err(EventRouterError::Transport(format!(
                    "connection {} outbound queue is gone",
                    self.id
                )))
            }
            Err(_) => {
                warn!(
                    connection_id = %self.id,
                    grace_ms = self.grace.as_millis() as u64,
                    "slow consumer, closing connection"
                );
                self.close();
                Err(EventRouterError::Transport(format!(
                    "connection {} is too slow to keep up",
                    self.id
                )))
            }
        }
    }

    /// Marks the connection closed; true for the first caller only
    pub fn close(&self) -> bool {
        let first = {
            let _guard = self.lock_subscriptions();
            !self.closed.swap(true, Ordering::AcqRel)
        };
        if first {
            self.cancel.cancel();
        }
        first
    }

    /// Records an owned subscription; false if the connection already closed
    pub fn attach(&self, id: SubscriptionId, client_id: &str) -> bool {
        let mut subscriptions = self.lock_subscriptions();
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        subscriptions.insert(id, client_id.to_string());
        true
    }

    pub fn detach(&self, id: &SubscriptionId) -> bool {
        self.lock_subscriptions().remove(id).is_some()
    }

    pub fn subscription_for(&self, client_id: &str) -> Option<SubscriptionId> {
        self.lock_subscriptions()
            .iter()
            .find(|(_, owned)| owned.as_str() == client_id)
            .map(|(id, _)| *id)
    }

    pub fn subscription_ids(&self) -> Vec<SubscriptionId> {
        self.lock_subscriptions().keys().copied().collect()
    }

    pub fn subscription_count(&self) -> usize {
        self.lock_subscriptions().len()
    }

    fn lock_subscriptions(&self) -> std::sync::MutexGuard<'_, HashMap<SubscriptionId, String>> {
        // A poisoned map is still structurally valid
        self.subscriptions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Queue sizing for new connections
#[derive(Debug, Clone, Copy)]
pub struct ConnectionSettings {
    pub queue_size: usize,
    pub slow_consumer_grace: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            queue_size: 128,
            slow_consumer_grace: Duration::from_secs(5),
        }
    }
}

/// Tracks every open connection and tears them down
#[derive(Clone)]
pub struct ConnectionManager {
    connections: Arc<RwLock<HashMap<ConnectionId, Arc<Connection>>>>,
    registry: Arc<SubscriptionRegistry>,
    counters: Arc<Counters>,
    settings: ConnectionSettings,
}

impl ConnectionManager {
    pub fn new(registry: Arc<SubscriptionRegistry>, settings: ConnectionSettings) -> Self {
        let counters = registry.counters();
        Self {
            connections: Arc::new(RwLock::new(HashMap::new())),
            registry,
            counters,
            settings,
        }
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    /// Registers a new connection and returns the receiving end of its queue
    pub async fn open(&self, kind: TransportKind) -> (Arc<Connection>, mpsc::Receiver<OutboundFrame>) {
        let (outbound, receiver) = mpsc::channel(self.settings.queue_size.max(1));
        let connection = Arc::new(Connection {
            id: ConnectionId::new(),
            kind,
            outbound,
            subscriptions: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            grace: self.settings.slow_consumer_grace,
            counters: Arc::clone(&self.counters),
        });

        self.connections
            .write()
            .await
            .insert(connection.id(), Arc::clone(&connection));
        self.counters.connection_opened();
        debug!(connection_id = %connection.id(), transport = %kind, "connection opened");

        (connection, receiver)
    }

    /// Closes a connection and cancels everything it owns.
    ///
    /// Safe to call repeatedly; only the first call has an effect.
    pub async fn release(&self, id: ConnectionId) {
        let Some(connection) = self.connections.write().await.remove(&id) else {
            return;
        };

        connection.close();
        let owned = connection.subscription_ids();
        for subscription_id in &owned {
            self.registry.unsubscribe(*subscription_id).await;
        }
        self.counters.connection_closed();
        debug!(
            connection_id = %id,
            subscriptions = owned.len(),
            "connection released"
        );
    }

    pub async fn get(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.read().await.get(&id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }

    /// Closes every connection
    pub async fn shutdown(&self) {
        let ids: Vec<ConnectionId> = self.connections.read().await.keys().copied().collect();
        let count = ids.len();
        for id in ids {
            self.release(id).await;
        }
        if count > 0 {
            info!(connections = count, "closed remaining connections");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::catalog::EventsCatalog;
    use crate::engine::resolver::EventResolver;
    use crate::engine::sources::SourceRegistry;
    use serde_json::json;

    fn manager(settings: ConnectionSettings) -> (ConnectionManager, Arc<Counters>) {
        let counters = Arc::new(Counters::new());
        let registry = Arc::new(SubscriptionRegistry::new(
            Arc::new(SourceRegistry::new()),
            Arc::new(EventsCatalog::default()),
            Arc::new(EventResolver::new()),
            Arc::clone(&counters),
            4,
        ));
        (ConnectionManager::new(registry, settings), counters)
    }

    #[tokio::test]
    async fn test_open_and_release_update_counters_once() {
        let (manager, counters) = manager(ConnectionSettings::default());
        let (connection, _rx) = manager.open(TransportKind::WebSocket).await;
        assert_eq!(counters.open_connections(), 1);
        assert_eq!(manager.len().await, 1);

        manager.release(connection.id()).await;
        manager.release(connection.id()).await;

        assert_eq!(counters.open_connections(), 0);
        assert!(connection.is_closed());
        assert!(connection.cancellation().is_cancelled());
        assert!(manager.is_empty().await);
    }

    #[tokio::test]
    async fn test_deliver_counts_messages_not_completions() {
        let (manager, counters) = manager(ConnectionSettings::default());
        let (connection, mut rx) = manager.open(TransportKind::Sse).await;

        connection
            .deliver(OutboundFrame::next("1", json!({"data": {"a": 1}})))
            .await
            .unwrap();
        connection
            .deliver(OutboundFrame::error("1", vec![GraphQLError::internal()]))
            .await
            .unwrap();
        connection.deliver(OutboundFrame::complete("1")).await.unwrap();

        assert_eq!(counters.messages_sent(), 2);
        assert_eq!(rx.recv().await.map(|f| f.frame), Some(Frame::Next(json!({"data": {"a": 1}}))));
        assert!(matches!(rx.recv().await.map(|f| f.frame), Some(Frame::Error(_))));
        assert_eq!(rx.recv().await.map(|f| f.frame), Some(Frame::Complete));
    }

    #[tokio::test]
    async fn test_slow_consumer_is_closed() {
        let (manager, counters) = manager(ConnectionSettings {
            queue_size: 1,
            slow_consumer_grace: Duration::from_millis(20),
        });
        let (connection, _rx) = manager.open(TransportKind::WebSocket).await;

        connection.deliver(OutboundFrame::next("1", json!({}))).await.unwrap();
        let second = connection.deliver(OutboundFrame::next("1", json!({}))).await;

        assert!(matches!(second, Err(EventRouterError::Transport(_))));
        assert!(connection.is_closed());
        assert!(connection.cancellation().is_cancelled());
        assert_eq!(counters.messages_sent(), 1);
    }

    #[tokio::test]
    async fn test_attach_after_close_is_refused() {
        let (manager, _) = manager(ConnectionSettings::default());
        let (connection, _rx) = manager.open(TransportKind::WebSocket).await;
        let id = SubscriptionId::new();

        assert!(connection.attach(id, "a"));
        assert_eq!(connection.subscription_for("a"), Some(id));
        assert_eq!(connection.subscription_count(), 1);
        assert!(connection.detach(&id));
        assert!(!connection.detach(&id));

        assert!(connection.close());
        assert!(!connection.close());
        assert!(!connection.attach(SubscriptionId::new(), "b"));
    }
}
