// Core domain models for the event router
// Plain data shared by the engine and the transports

//! # Domain Models Module
//!
//! This module contains the data structures that flow through the event
//! router: what a broker delivered ([`RawEvent`]), what a client asked for
//! ([`SubscriptionRequest`] / [`SubscriptionOperation`]), how a field maps
//! to broker topics ([`EventFieldConfig`]) and what the client receives
//! ([`ResolvedMessage`]).
//!
//! ## Rust Learning Notes:
//!
//! ### Newtype Identifiers
//! `SubscriptionId` and `ConnectionId` wrap a `Uuid` instead of using it
//! directly. The compiler then refuses to pass a connection id where a
//! subscription id is expected, at zero runtime cost.
//!
//! ### Re-exports for Clean APIs
//! The `pub use` statements at the bottom create a flat API, so callers can
//! write `use event_router::models::SourceKey` without knowing which file
//! defines it.

// Broker-side values: SourceKey, RawEvent and the client-facing results
pub mod event;

// Subscription identity and lifecycle state
pub mod subscription;

// GraphQL subscription documents parsed into a selection tree
pub mod operation;

// Field-to-topic mapping and the compiled form of a subscription
pub mod schema;

/// Generic error text shown to clients for any internal failure
pub const INTERNAL_SERVER_ERROR: &str = "Internal server error";

/// Re-export broker event and result types
/// - SourceKey: canonical provider + topic set, the Binding identity
/// - RawEvent: one decoded broker message
/// - GraphQLError / ResolvedMessage / Outcome: per-subscription results
pub use event::{GraphQLError, Outcome, RawEvent, ResolvedMessage, SourceKey};

/// Re-export subscription lifecycle types
pub use subscription::{
    ConnectionId, Subscription, SubscriptionId, SubscriptionState, TransportKind,
};

/// Re-export operation types
pub use operation::{Selection, SubscriptionOperation, SubscriptionRequest};

/// Re-export schema mapping types
pub use schema::{CompiledSubscription, EventFieldConfig};
