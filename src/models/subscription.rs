// Subscription identity and lifecycle

//! # Subscription Models
//!
//! A [`Subscription`] is one client's interest in one event field. It is
//! owned by the Connection it arrived on and referenced by exactly one
//! Binding in the registry.
//!
//! ## Rust Learning Notes:
//!
//! ### Atomic State Machines
//! The lifecycle `Pending → Active → Cancelled` is stored in an `AtomicU8`
//! and advanced with `compare_exchange`. Whichever caller wins the exchange
//! owns the side effect (e.g. decrementing the active-subscription counter),
//! so that side effect happens exactly once even when an unsubscribe races
//! a connection close.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use uuid::Uuid;

use super::operation::SubscriptionOperation;
use super::schema::{CompiledSubscription, EventFieldConfig};
use super::SourceKey;

/// Opaque server-side subscription identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of one client transport connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which long-lived transport a connection uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    WebSocket,
    Sse,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::WebSocket => write!(f, "websocket"),
            TransportKind::Sse => write!(f, "sse"),
        }
    }
}

/// Subscription lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionState {
    /// Registered but the broker consumer is not confirmed open yet
    Pending,
    /// Receiving events
    Active,
    /// Terminal
    Cancelled,
}

impl SubscriptionState {
    fn as_u8(self) -> u8 {
        match self {
            SubscriptionState::Pending => 0,
            SubscriptionState::Active => 1,
            SubscriptionState::Cancelled => 2,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => SubscriptionState::Pending,
            1 => SubscriptionState::Active,
            _ => SubscriptionState::Cancelled,
        }
    }
}

/// One client subscription
#[derive(Debug)]
pub struct Subscription {
    pub id: SubscriptionId,

    /// Protocol-level id chosen by the client (`"1"` for SSE)
    pub client_id: String,

    pub connection_id: ConnectionId,

    pub compiled: CompiledSubscription,

    state: AtomicU8,
    cancel: CancellationToken,
}

impl Subscription {
    pub fn new(
        client_id: impl Into<String>,
        connection_id: ConnectionId,
        compiled: CompiledSubscription,
    ) -> Self {
        Self {
            id: SubscriptionId::new(),
            client_id: client_id.into(),
            connection_id,
            compiled,
            state: AtomicU8::new(SubscriptionState::Pending.as_u8()),
            cancel: CancellationToken::new(),
        }
    }

    pub fn state(&self) -> SubscriptionState {
        SubscriptionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_active(&self) -> bool {
        self.state() == SubscriptionState::Active
    }

    /// `Pending → Active`; false if the subscription was cancelled first
    pub fn activate(&self) -> bool {
        self.transition(SubscriptionState::Pending, SubscriptionState::Active)
    }

    /// Moves to `Cancelled` without stopping the delivery pipeline.
    ///
    /// Returns true only for the call that left `Active`.
    pub fn retire(&self) -> bool {
        if self.transition(SubscriptionState::Active, SubscriptionState::Cancelled) {
            return true;
        }
        self.transition(SubscriptionState::Pending, SubscriptionState::Cancelled);
        false
    }

    /// Retires the subscription and stops its pipeline.
    ///
    /// Returns true only for the call that left `Active`.
    pub fn cancel(&self) -> bool {
        let was_active = self.retire();
        self.cancel.cancel();
        was_active
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    pub fn operation(&self) -> &SubscriptionOperation {
        &self.compiled.operation
    }

    pub fn field(&self) -> &EventFieldConfig {
        &self.compiled.field
    }

    pub fn source_key(&self) -> &SourceKey {
        &self.compiled.source_key
    }

    fn transition(&self, from: SubscriptionState, to: SubscriptionState) -> bool {
        self.state
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::schema::tests::employee_subscription;

    #[test]
    fn test_lifecycle_transitions_once() {
        let subscription = Subscription::new("1", ConnectionId::new(), employee_subscription());
        assert_eq!(subscription.state(), SubscriptionState::Pending);

        assert!(subscription.activate());
        assert!(!subscription.activate());
        assert!(subscription.is_active());

        assert!(subscription.cancel());
        assert!(!subscription.cancel());
        assert!(!subscription.retire());
        assert_eq!(subscription.state(), SubscriptionState::Cancelled);
        assert!(subscription.is_cancelled());
    }

    #[test]
    fn test_cancel_before_activation_is_not_counted() {
        let subscription = Subscription::new("1", ConnectionId::new(), employee_subscription());

        assert!(!subscription.cancel());
        assert!(!subscription.activate());
        assert_eq!(subscription.state(), SubscriptionState::Cancelled);
    }

    #[test]
    fn test_retire_keeps_pipeline_running() {
        let subscription = Subscription::new("7", ConnectionId::new(), employee_subscription());
        subscription.activate();

        assert!(subscription.retire());
        assert!(!subscription.is_active());
        assert!(!subscription.is_cancelled());
    }
}
