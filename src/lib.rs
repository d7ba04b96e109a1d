// Event Router - Rust Edition
// Event-driven GraphQL subscriptions for a federated router

//! # Event Router Library
//!
//! This is the main library crate for the event router, the subsystem of a
//! federated GraphQL router that bridges message brokers (in-process, NATS,
//! Kafka) to GraphQL subscription clients connected over WebSocket or
//! Server-Sent Events.
//!
//! ## Core Components
//!
//! ### Event Source Adapters
//! - [`EventSource`]: one capability interface per broker backend
//!   (open consumer, produce, create/delete topic)
//! - [`MemoryEventSource`], [`NatsEventSource`]: built-in backends
//!
//! ### Subscription Registry
//! - [`SubscriptionRegistry`]: maps a canonical [`SourceKey`] to the set of
//!   client subscriptions sharing one broker consumer (a *binding*) and fans
//!   every broker message out to them
//!
//! ### Resolver
//! - [`Resolver`] / [`EventResolver`]: turns one broker payload into one
//!   GraphQL response per subscription, isolating failures per subscription
//!
//! ### Transports
//! - [`RouterServer`]: axum server exposing `graphql-transport-ws`,
//!   legacy `graphql-ws` and SSE subscription endpoints
//!
//! ### Counters
//! - [`Counters`]: atomic counts of active subscriptions, open connections
//!   and messages sent
//!
//! ## Data Flow
//!
//! ```text
//! broker message
//!   ↓ EventConsumer (adapter decodes)
//! SubscriptionRegistry (binding lookup by source key)
//!   ↓ one unit of work per subscription
//! Resolver (bounded worker pool)
//!   ↓ ResolvedMessage
//! Connection outbound queue → WebSocket / SSE writer
//! ```

// Domain models: subscriptions, events, operations
pub mod models;

// Engine: sources, registry, resolver, connections, counters
pub mod engine;

// HTTP transports (WebSocket + SSE)
pub mod server;

// Router configuration
pub mod config;

pub use config::{EngineConfig, ProviderConfig, RouterConfig, SecurityConfig};

pub use models::{
    CompiledSubscription, ConnectionId, EventFieldConfig, GraphQLError, RawEvent,
    ResolvedMessage, Selection, SourceKey, Subscription, SubscriptionId, SubscriptionOperation,
    SubscriptionRequest, SubscriptionState, TransportKind,
};

pub use engine::{
    catalog::EventsCatalog,
    connection::{Connection, ConnectionManager, Frame, OutboundFrame},
    entities::{EntitySource, StaticEntitySource, SubgraphEntitySource},
    metrics::{Counters, CountersSnapshot},
    registry::SubscriptionRegistry,
    resolver::{EventResolver, Resolver},
    sources::{
        memory::MemoryEventSource, nats::NatsEventSource, ConsumerPoll, EventConsumer,
        EventSource, RetryPolicy, SourceBackend, SourceRegistry,
    },
};

pub use server::{AppState, ReadinessStrategy, RouterServer, RouterServerBuilder, WsProtocol};

use thiserror::Error;

/// Error taxonomy for the event router
///
/// Message-level variants (`Decode`, `Resolution`) never terminate a
/// subscription; they are turned into a GraphQL error for the one
/// subscription that triggered them. `Transport` is terminal for a single
/// connection, `Source` is terminal for a whole binding.
#[derive(Error, Debug)]
pub enum EventRouterError {
    /// Connection-level failure (socket closed, slow consumer, queue gone)
    #[error("Transport error: {0}")]
    Transport(String),

    /// Broker payload could not be decoded into the expected shape
    #[error("Decode error: {0}")]
    Decode(String),

    /// GraphQL null propagation; `message` is already client-facing
    #[error("{message}")]
    Resolution {
        message: String,
        path: Vec<serde_json::Value>,
    },

    /// The broker could not be reached when opening a consumer or producing
    #[error("Event source unavailable: {0}")]
    SourceUnavailable(String),

    /// The broker failed after the retry budget was spent
    #[error("Event source error: {0}")]
    Source(String),

    /// Unexpected internal fault inside a unit of work
    #[error("Fatal error: {0}")]
    Fatal(String),

    /// The subscription document is not something this engine can serve
    #[error("{0}")]
    InvalidOperation(String),

    #[error("operation type 'subscription' is blocked")]
    SubscriptionsBlocked,

    #[error("Router is shutting down")]
    ShuttingDown,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl EventRouterError {
    /// Message that may be shown to a GraphQL client.
    ///
    /// Internals (broker addresses, decode details) stay in the server log.
    pub fn client_message(&self) -> String {
        match self {
            EventRouterError::Resolution { message, .. } => message.clone(),
            EventRouterError::InvalidOperation(message) => message.clone(),
            EventRouterError::SubscriptionsBlocked | EventRouterError::ShuttingDown => {
                self.to_string()
            }
            _ => models::INTERNAL_SERVER_ERROR.to_string(),
        }
    }
}

impl From<std::io::Error> for EventRouterError {
    fn from(err: std::io::Error) -> Self {
        EventRouterError::Internal(err.to_string())
    }
}

impl From<::config::ConfigError> for EventRouterError {
    fn from(err: ::config::ConfigError) -> Self {
        EventRouterError::Config(err.to_string())
    }
}

/// Type alias for Results that use our custom error type
pub type Result<T> = std::result::Result<T, EventRouterError>;
