// Event Router Engine
// Everything between a broker consumer and a client connection queue

//! # Event Router Engine Module
//!
//! The engine is the layer between the domain models and the HTTP
//! transports. Transports hand it a connection and a subscription request;
//! the engine opens (or reuses) a broker consumer, resolves every event per
//! subscription and pushes the results into the connection's outbound queue.
//!
//! ## Engine Components
//!
//! ### Event Sources (`sources` module)
//! - `EventSource` / `EventConsumer` traits, one implementation per backend
//! - retry policy with exponential backoff and jitter
//!
//! ### Subscription Registry (`registry` module)
//! - one Binding per canonical source key, shared by all matching subscriptions
//! - per-subscription delivery pipelines fed by the Binding's consumer task
//!
//! ### Resolver (`resolver`, `entities` modules)
//! - payload decoding, `__typename` checks, entity completion, projection
//!
//! ### Connections (`connection` module)
//! - bounded outbound queue per client connection, slow-consumer eviction
//!
//! ### Counters (`metrics` module)
//! - active subscriptions, open connections, messages sent
//!
//! ## Rust Learning Notes:
//!
//! ### Trait Objects at the Seams
//! Brokers, resolvers and entity sources are all reached through
//! `Arc<dyn Trait>`. Tests swap in the in-memory broker or a static entity
//! source without touching the registry.

/// Field catalogue: compiles subscription requests into source keys
pub mod catalog;

/// Client connections and their outbound queues
pub mod connection;

/// Entity completion collaborators (static records, subgraph `_entities`)
pub mod entities;

/// Atomic counters and test synchronisation helpers
pub mod metrics;

/// Subscription registry: bindings, dispatch and lifecycle
pub mod registry;

/// Event resolution: payload → GraphQL response
pub mod resolver;

/// Event source adapters and their registry
pub mod sources;


pub use catalog::EventsCatalog;
pub use connection::{Connection, ConnectionManager, Frame, OutboundFrame};
pub use entities::{EntitySource, StaticEntitySource, SubgraphEntitySource};
pub use metrics::{Counters, CountersSnapshot};
pub use registry::SubscriptionRegistry;
pub use resolver::{EventResolver, Resolver};
pub use sources::{EventConsumer, EventSource, RetryPolicy, SourceBackend, SourceRegistry};
