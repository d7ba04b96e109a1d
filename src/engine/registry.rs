// Subscription registry

//! # Subscription Registry
//!
//! Maps every canonical [`SourceKey`] to a *Binding*: one open broker
//! consumer shared by all subscriptions whose operations render to that key.
//!
//! ## Tasks
//!
//! - one consumer task per Binding, pulling events and fanning them out
//! - one delivery pipeline per Subscription, resolving its events in order
//!   with permits from a shared semaphore and queueing the results on the
//!   owning connection
//!
//! ## Locking
//!
//! Bindings live in a concurrent map; each Binding guards its member set
//! with its own async mutex. A subscription is registered, activated and
//! counted while that lock is held, so shutdown and source failure (which
//! take the same lock) never miss one. Dispatch copies the member list under
//! the lock and does all resolution and delivery outside it. No lock spans
//! unrelated Bindings.
//!
//! ## Backpressure
//!
//! Each pipeline has a bounded inbox. When dispatch finds it full the
//! owning connection is closed as a slow consumer, the same policy the
//! outbound queue applies.
//!
//! ## Rust Learning Notes:
//!
//! ### `self: &Arc<Self>`
//! `subscribe` spawns a consumer task that must call back into the registry
//! when its broker fails. Taking `self: &Arc<Self>` lets the method hand an
//! owned clone of the registry to that task.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, Mutex, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::catalog::EventsCatalog;
use super::connection::{Connection, OutboundFrame};
use super::metrics::Counters;
use super::resolver::Resolver;
use super::sources::{ConsumerPoll, EventConsumer, SourceRegistry};
use crate::models::{
    GraphQLError, RawEvent, ResolvedMessage, SourceKey, Subscription, SubscriptionId,
    SubscriptionRequest,
};
use crate::{EventRouterError, Result};

/// Message shown to subscribers when their event source fails for good
pub const SOURCE_FAILED_MESSAGE: &str = "event source is unavailable, subscription closed";

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// How long shutdown waits for pipelines to flush their final frames
const PIPELINE_EXIT_GRACE: Duration = Duration::from_secs(1);

/// Events a pipeline may have queued before its connection counts as slow
pub const DEFAULT_INBOX_CAPACITY: usize = 128;

/// Sent to a pipeline to end it: an optional error, then `complete`
type Termination = Option<GraphQLError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BindingState {
    /// Created, consumer not open yet
    Opening,
    Open,
    /// Torn down; a fresh Binding must be created for this key
    Closed,
}

struct Member {
    subscription: Arc<Subscription>,
    connection: Arc<Connection>,
    inbox: mpsc::Sender<Arc<RawEvent>>,
}

struct BindingMembers {
    state: BindingState,
    members: HashMap<SubscriptionId, Member>,
}

struct Binding {
    key: SourceKey,
    inner: Mutex<BindingMembers>,
    /// Stops the consumer task
    cancel: CancellationToken,
}

impl BindingMembers {
    /// Marks an open Binding without members closed; true when it did
    fn close_if_idle(&mut self) -> bool {
        if self.members.is_empty() && self.state == BindingState::Open {
            self.state = BindingState::Closed;
            true
        } else {
            false
        }
    }
}

impl Binding {
    fn new(key: SourceKey) -> Self {
        Self {
            key,
            inner: Mutex::new(BindingMembers {
                state: BindingState::Opening,
                members: HashMap::new(),
            }),
            cancel: CancellationToken::new(),
        }
    }
}

struct Registration {
    subscription: Arc<Subscription>,
    connection: Arc<Connection>,
    binding: Arc<Binding>,
    terminate: oneshot::Sender<Termination>,
}

pub struct SubscriptionRegistry {
    sources: Arc<SourceRegistry>,
    catalog: Arc<EventsCatalog>,
    resolver: Arc<dyn Resolver>,
    counters: Arc<Counters>,
    bindings: DashMap<SourceKey, Arc<Binding>>,
    subscriptions: DashMap<SubscriptionId, Registration>,
    workers: Arc<Semaphore>,
    in_flight: Arc<AtomicUsize>,
    pipelines: Arc<AtomicUsize>,
    inbox_capacity: usize,
    accepting: AtomicBool,
}

impl SubscriptionRegistry {
    pub fn new(
        sources: Arc<SourceRegistry>,
        catalog: Arc<EventsCatalog>,
        resolver: Arc<dyn Resolver>,
        counters: Arc<Counters>,
        resolver_concurrency: usize,
    ) -> Self {
        Self {
            sources,
            catalog,
            resolver,
            counters,
            bindings: DashMap::new(),
            subscriptions: DashMap::new(),
            workers: Arc::new(Semaphore::new(resolver_concurrency.max(1))),
            in_flight: Arc::new(AtomicUsize::new(0)),
            pipelines: Arc::new(AtomicUsize::new(0)),
            inbox_capacity: DEFAULT_INBOX_CAPACITY,
            accepting: AtomicBool::new(true),
        }
    }

    /// Bounds every pipeline inbox; usually the outbound queue size
    pub fn with_inbox_capacity(mut self, capacity: usize) -> Self {
        self.inbox_capacity = capacity.max(1);
        self
    }

    pub fn counters(&self) -> Arc<Counters> {
        Arc::clone(&self.counters)
    }

    pub fn catalog(&self) -> &EventsCatalog {
        &self.catalog
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    /// Events scheduled to a pipeline but not yet delivered
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn get(&self, id: &SubscriptionId) -> Option<Arc<Subscription>> {
        self.subscriptions
            .get(id)
            .map(|registration| Arc::clone(&registration.subscription))
    }

    /// Keys of every Binding currently in the map
    pub fn active_bindings(&self) -> Vec<SourceKey> {
        let mut keys: Vec<SourceKey> = self.bindings.iter().map(|entry| entry.key().clone()).collect();
        keys.sort();
        keys
    }

    pub async fn binding_members(&self, key: &SourceKey) -> Vec<SubscriptionId> {
        let Some(binding) = self.bindings.get(key).map(|entry| Arc::clone(entry.value())) else {
            return Vec::new();
        };
        let inner = binding.inner.lock().await;
        inner.members.keys().copied().collect()
    }

    /// Registers a subscription for `connection`.
    ///
    /// Opens the broker consumer when this is the first subscription for its
    /// source key. The subscription is `Active` (and counted) only once the
    /// consumer is confirmed open.
    pub async fn subscribe(
        self: &Arc<Self>,
        connection: &Arc<Connection>,
        client_id: &str,
        request: &SubscriptionRequest,
    ) -> Result<SubscriptionId> {
        if !self.is_accepting() {
            return Err(EventRouterError::ShuttingDown);
        }
        if connection.is_closed() {
            return Err(EventRouterError::Transport(format!(
                "connection {} is closed",
                connection.id()
            )));
        }

        let compiled = self.catalog.compile(request)?;
        let source = self.sources.get(&compiled.source_key.provider_id)?;
        let key = compiled.source_key.clone();
        let subscription = Arc::new(Subscription::new(client_id, connection.id(), compiled));
        let id = subscription.id;
        let (inbox, work) = mpsc::channel(self.inbox_capacity);
        let (terminate, terminated) = oneshot::channel();

        loop {
            let binding = self.binding_for(&key);
            let mut inner = binding.inner.lock().await;
            let state = inner.state;
            match state {
                BindingState::Closed => {
                    drop(inner);
                    self.remove_binding(&binding);
                    continue;
                }
                BindingState::Opening => {
                    let mut consumer = match source.open_consumer(&key).await {
                        Ok(consumer) => consumer,
                        Err(e) => {
                            inner.state = BindingState::Closed;
                            drop(inner);
                            self.remove_binding(&binding);
                            warn!(key = %key, error = %e, "failed to open event consumer");
                            return Err(e);
                        }
                    };
                    // Shutdown started while the broker was confirming
                    if !self.is_accepting() {
                        inner.state = BindingState::Closed;
                        drop(inner);
                        self.remove_binding(&binding);
                        consumer.close().await;
                        return Err(EventRouterError::ShuttingDown);
                    }
                    inner.state = BindingState::Open;
                    self.spawn_consumer(Arc::clone(&binding), consumer);
                    info!(key = %key, "📡 Binding opened");
                }
                BindingState::Open => {
                    if !self.is_accepting() {
                        return Err(EventRouterError::ShuttingDown);
                    }
                }
            }

            inner.members.insert(
                id,
                Member {
                    subscription: Arc::clone(&subscription),
                    connection: Arc::clone(connection),
                    inbox,
                },
            );
            if subscription.activate() {
                self.counters.subscription_added();
            }
            self.subscriptions.insert(
                id,
                Registration {
                    subscription: Arc::clone(&subscription),
                    connection: Arc::clone(connection),
                    binding: Arc::clone(&binding),
                    terminate,
                },
            );

            if !connection.attach(id, client_id) {
                inner.members.remove(&id);
                let closed = inner.close_if_idle();
                drop(inner);
                if let Some((_, registration)) = self.subscriptions.remove(&id) {
                    if registration.subscription.cancel() {
                        self.counters.subscription_removed();
                    }
                }
                if closed {
                    binding.cancel.cancel();
                    self.remove_binding(&binding);
                }
                return Err(EventRouterError::Transport(format!(
                    "connection {} closed while subscribing",
                    connection.id()
                )));
            }
            // Terminated between registration and attach
            if !self.subscriptions.contains_key(&id) {
                connection.detach(&id);
            }
            break;
        }

        self.spawn_pipeline(Arc::clone(&subscription), Arc::clone(connection), work, terminated);
        debug!(
            subscription_id = %id,
            client_id,
            connection_id = %connection.id(),
            key = %key,
            "subscription active"
        );
        Ok(id)
    }

    /// Cancels a subscription. Unknown or already removed ids are ignored.
    pub async fn unsubscribe(&self, id: SubscriptionId) {
        let Some((_, registration)) = self.subscriptions.remove(&id) else {
            return;
        };

        if registration.subscription.cancel() {
            self.counters.subscription_removed();
        }
        registration.connection.detach(&id);
        self.leave_binding(&registration.binding, &id).await;
        debug!(subscription_id = %id, "subscription cancelled");
    }

    /// Fans one event out to every active member of its Binding.
    ///
    /// Returns the number of subscriptions the event was scheduled for.
    pub async fn dispatch(&self, event: RawEvent) -> usize {
        let Some(binding) = self
            .bindings
            .get(&event.source_key)
            .map(|entry| Arc::clone(entry.value()))
        else {
            return 0;
        };
        self.dispatch_to(&binding, event).await
    }

    /// Stops accepting subscriptions, waits up to `drain` for in-flight
    /// events, then completes every remaining subscription and closes every
    /// Binding.
    pub async fn shutdown(&self, drain: Duration) {
        self.accepting.store(false, Ordering::Release);

        let deadline = Instant::now() + drain;
        while self.in_flight() > 0 && Instant::now() < deadline {
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }
        let undelivered = self.in_flight();
        if undelivered > 0 {
            warn!(undelivered, "shutdown drain timed out");
        }

        let ids: Vec<SubscriptionId> = self.subscriptions.iter().map(|entry| *entry.key()).collect();
        let count = ids.len();
        for id in ids {
            self.terminate(id, None).await;
        }

        // Members registered after the snapshot above are still on their Binding
        let leftovers: Vec<Arc<Binding>> = self
            .bindings
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for binding in leftovers {
            let late: Vec<SubscriptionId> = {
                let mut inner = binding.inner.lock().await;
                inner.state = BindingState::Closed;
                inner.members.drain().map(|(id, _)| id).collect()
            };
            binding.cancel.cancel();
            self.remove_binding(&binding);
            for id in late {
                self.terminate(id, None).await;
            }
        }

        let deadline = Instant::now() + PIPELINE_EXIT_GRACE;
        while self.pipelines.load(Ordering::Acquire) > 0 && Instant::now() < deadline {
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }

        info!(subscriptions = count, "🛑 Subscription registry shut down");
    }

    fn binding_for(&self, key: &SourceKey) -> Arc<Binding> {
        let entry = self
            .bindings
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Binding::new(key.clone())));
        Arc::clone(entry.value())
    }

    fn remove_binding(&self, binding: &Arc<Binding>) {
        self.bindings
            .remove_if(&binding.key, |_, current| Arc::ptr_eq(current, binding));
    }

    async fn leave_binding(&self, binding: &Arc<Binding>, id: &SubscriptionId) {
        let closed = {
            let mut inner = binding.inner.lock().await;
            inner.members.remove(id);
            inner.close_if_idle()
        };

        if closed {
            binding.cancel.cancel();
            self.remove_binding(binding);
            info!(key = %binding.key, "Binding closed");
        }
    }

    /// Removes a subscription and lets its pipeline send the final frames
    async fn terminate(&self, id: SubscriptionId, error: Option<GraphQLError>) {
        let Some((_, registration)) = self.subscriptions.remove(&id) else {
            return;
        };

        if registration.subscription.retire() {
            self.counters.subscription_removed();
        }
        registration.connection.detach(&id);
        let Registration {
            binding, terminate, ..
        } = registration;
        let _ = terminate.send(error);
        self.leave_binding(&binding, &id).await;
    }

    async fn dispatch_to(&self, binding: &Binding, event: RawEvent) -> usize {
        let targets: Vec<(mpsc::Sender<Arc<RawEvent>>, Arc<Connection>)> = {
            let inner = binding.inner.lock().await;
            if inner.state != BindingState::Open {
                return 0;
            }
            inner
                .members
                .values()
                .filter(|member| member.subscription.is_active())
                .map(|member| (member.inbox.clone(), Arc::clone(&member.connection)))
                .collect()
        };

        let event = Arc::new(event);
        let mut scheduled = 0;
        for (inbox, connection) in targets {
            self.in_flight.fetch_add(1, Ordering::AcqRel);
            match inbox.try_send(Arc::clone(&event)) {
                Ok(()) => scheduled += 1,
                Err(TrySendError::Full(_)) => {
                    self.in_flight.fetch_sub(1, Ordering::AcqRel);
                    if connection.close() {
                        warn!(
                            connection_id = %connection.id(),
                            key = %binding.key,
                            capacity = self.inbox_capacity,
                            "subscription inbox full, closing slow connection"
                        );
                    }
                }
                Err(TrySendError::Closed(_)) => {
                    self.in_flight.fetch_sub(1, Ordering::AcqRel);
                }
            }
        }
        scheduled
    }

    /// Tears a Binding down after its consumer failed for good
    async fn fail_binding(&self, binding: &Arc<Binding>, failure: EventRouterError) {
        let members: Vec<Member> = {
            let mut inner = binding.inner.lock().await;
            inner.state = BindingState::Closed;
            inner.members.drain().map(|(_, member)| member).collect()
        };
        self.remove_binding(binding);

        error!(
            key = %binding.key,
            error = %failure,
            subscriptions = members.len(),
            "event source failed, closing binding"
        );
        for member in members {
            self.terminate(member.subscription.id, Some(GraphQLError::new(SOURCE_FAILED_MESSAGE)))
                .await;
        }
    }

    fn spawn_consumer(self: &Arc<Self>, binding: Arc<Binding>, mut consumer: Box<dyn EventConsumer>) {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let failure = loop {
                tokio::select! {
                    _ = binding.cancel.cancelled() => break None,
                    poll = consumer.next_event() => match poll {
                        ConsumerPoll::Event(event) => {
                            registry.dispatch_to(&binding, event).await;
                        }
                        ConsumerPoll::Eof => {
                            break Some(EventRouterError::Source(format!(
                                "event stream for {} ended",
                                binding.key
                            )))
                        }
                        ConsumerPoll::Failed(e) => break Some(e),
                    }
                }
            };

            consumer.close().await;
            if let Some(failure) = failure {
                registry.fail_binding(&binding, failure).await;
            }
        });
    }

    fn spawn_pipeline(
        &self,
        subscription: Arc<Subscription>,
        connection: Arc<Connection>,
        mut work: mpsc::Receiver<Arc<RawEvent>>,
        mut terminated: oneshot::Receiver<Termination>,
    ) {
        let resolver = Arc::clone(&self.resolver);
        let workers = Arc::clone(&self.workers);
        let in_flight = Arc::clone(&self.in_flight);
        let pipelines = Arc::clone(&self.pipelines);
        pipelines.fetch_add(1, Ordering::AcqRel);

        tokio::spawn(async move {
            let termination = loop {
                tokio::select! {
                    biased;
                    _ = subscription.cancelled() => break None,
                    termination = &mut terminated => break termination.ok(),
                    event = work.recv() => {
                        let Some(event) = event else {
                            break terminated.try_recv().ok();
                        };

                        let mut connected = true;
                        if subscription.is_active() {
                            let message =
                                resolve_isolated(&resolver, &workers, &subscription, event).await;
                            // Cancelled while resolving: drop the result
                            if subscription.is_active() {
                                let frame = OutboundFrame::from_resolved(
                                    subscription.client_id.clone(),
                                    message,
                                );
                                connected = connection.deliver(frame).await.is_ok();
                            }
                        }
                        in_flight.fetch_sub(1, Ordering::AcqRel);
                        if !connected {
                            break None;
                        }
                    }
                }
            };

            if let Some(error) = termination {
                if let Some(error) = error {
                    let _ = connection
                        .deliver(OutboundFrame::error(subscription.client_id.clone(), vec![error]))
                        .await;
                }
                let _ = connection
                    .deliver(OutboundFrame::complete(subscription.client_id.clone()))
                    .await;
            }

            work.close();
            while work.try_recv().is_ok() {
                in_flight.fetch_sub(1, Ordering::AcqRel);
            }
            pipelines.fetch_sub(1, Ordering::AcqRel);
        });
    }
}

/// Runs one resolution on its own task so a panic only costs this message
async fn resolve_isolated(
    resolver: &Arc<dyn Resolver>,
    workers: &Arc<Semaphore>,
    subscription: &Arc<Subscription>,
    event: Arc<RawEvent>,
) -> ResolvedMessage {
    let permit = match Arc::clone(workers).acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => return ResolvedMessage::errors(subscription.id, vec![GraphQLError::internal()]),
    };

    let resolver = Arc::clone(resolver);
    let task_subscription = Arc::clone(subscription);
    let handle = tokio::spawn(async move {
        let _permit = permit;
        resolver.resolve(&task_subscription, &event).await
    });

    match handle.await {
        Ok(message) => message,
        Err(e) => {
            error!(subscription_id = %subscription.id, error = %e, "resolver task failed");
            ResolvedMessage::errors(subscription.id, vec![GraphQLError::internal()])
        }
    }
}
