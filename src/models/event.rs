// Broker event models and per-subscription results

//! # Event Models
//!
//! - `SourceKey`: identity of a broker consumer (provider + rendered topics)
//! - `RawEvent`: one message as decoded by an event source adapter
//! - `GraphQLError`: client-facing error object
//! - `ResolvedMessage`: the outcome of resolving one event for one subscription
//!
//! ## Rust Learning Notes:
//!
//! ### `bytes::Bytes`
//! Payloads are kept as `Bytes`, a reference-counted buffer. Fanning one
//! event out to many subscriptions clones the handle, never the payload.

use std::collections::HashMap;
use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::subscription::SubscriptionId;
use super::INTERNAL_SERVER_ERROR;

/// Canonical identity of a broker consumer
///
/// Two subscriptions whose operations render to the same provider and topic
/// set share one Binding, whatever their selection sets look like. Topics
/// are sorted and de-duplicated on construction so the key is order
/// independent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceKey {
    pub provider_id: String,
    pub topics: Vec<String>,
}

impl SourceKey {
    pub fn new<I, S>(provider_id: impl Into<String>, topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut topics: Vec<String> = topics.into_iter().map(Into::into).collect();
        topics.sort();
        topics.dedup();
        Self {
            provider_id: provider_id.into(),
            topics,
        }
    }
}

impl fmt::Display for SourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.provider_id, self.topics.join(","))
    }
}

/// One message delivered by an event source
#[derive(Debug, Clone)]
pub struct RawEvent {
    /// Binding this event was consumed for
    pub source_key: SourceKey,

    /// Concrete topic (or NATS subject) the message arrived on
    pub topic: String,

    pub payload: Bytes,

    pub headers: Option<HashMap<String, String>>,

    /// Partition, for backends that have them
    pub partition: Option<i32>,

    pub received_at: DateTime<Utc>,
}

impl RawEvent {
    pub fn new(source_key: SourceKey, topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            source_key,
            topic: topic.into(),
            payload: payload.into(),
            headers: None,
            partition: None,
            received_at: Utc::now(),
        }
    }

    pub fn with_partition(mut self, partition: i32) -> Self {
        self.partition = Some(partition);
        self
    }

    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        if !headers.is_empty() {
            self.headers = Some(headers);
        }
        self
    }
}

/// Client-facing GraphQL error object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphQLError {
    pub message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<Vec<Value>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Value>,
}

impl GraphQLError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            path: None,
            extensions: None,
        }
    }

    /// The generic error shown for decode failures and internal faults
    pub fn internal() -> Self {
        Self::new(INTERNAL_SERVER_ERROR)
    }

    pub fn with_path(mut self, path: Vec<Value>) -> Self {
        if !path.is_empty() {
            self.path = Some(path);
        }
        self
    }

    pub fn with_extensions(mut self, extensions: Value) -> Self {
        self.extensions = Some(extensions);
        self
    }
}

/// Result of resolving one event for one subscription
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Data(Value),
    Errors(Vec<GraphQLError>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedMessage {
    pub subscription_id: SubscriptionId,
    pub outcome: Outcome,
}

impl ResolvedMessage {
    pub fn data(subscription_id: SubscriptionId, data: Value) -> Self {
        Self {
            subscription_id,
            outcome: Outcome::Data(data),
        }
    }

    pub fn errors(subscription_id: SubscriptionId, errors: Vec<GraphQLError>) -> Self {
        Self {
            subscription_id,
            outcome: Outcome::Errors(errors),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self.outcome, Outcome::Errors(_))
    }

    /// GraphQL response body: `{"data":…}` or `{"errors":[…],"data":null}`
    pub fn to_payload(&self) -> Value {
        match &self.outcome {
            Outcome::Data(data) => json!({ "data": data }),
            Outcome::Errors(errors) => errors_payload(errors),
        }
    }
}

/// Response body for an error-only result, `errors` first
pub fn errors_payload(errors: &[GraphQLError]) -> Value {
    json!({ "errors": errors, "data": Value::Null })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_key_is_order_independent() {
        let a = SourceKey::new("my-kafka", ["employeeUpdated", "employeeCreated", "employeeUpdated"]);
        let b = SourceKey::new("my-kafka", ["employeeCreated", "employeeUpdated"]);

        assert_eq!(a, b);
        assert_eq!(a.to_string(), "my-kafka:employeeCreated,employeeUpdated");
        assert_ne!(a, SourceKey::new("my-nats", ["employeeCreated", "employeeUpdated"]));
    }

    #[test]
    fn test_error_payload_shape() {
        let message = ResolvedMessage::errors(
            SubscriptionId::new(),
            vec![GraphQLError::new("operation type 'subscription' is blocked")],
        );

        assert!(message.is_error());
        assert_eq!(
            serde_json::to_string(&message.to_payload()).unwrap(),
            r#"{"errors":[{"message":"operation type 'subscription' is blocked"}],"data":null}"#
        );
    }

    #[test]
    fn test_data_payload_and_error_path() {
        let id = SubscriptionId::new();
        let message = ResolvedMessage::data(id, json!({"employeeUpdated": {"id": 1}}));
        assert_eq!(
            serde_json::to_string(&message.to_payload()).unwrap(),
            r#"{"data":{"employeeUpdated":{"id":1}}}"#
        );

        let error = GraphQLError::new("boom").with_path(vec![json!("employeeUpdated"), json!("id")]);
        assert_eq!(
            serde_json::to_value(&error).unwrap(),
            json!({"message": "boom", "path": ["employeeUpdated", "id"]})
        );
        assert_eq!(GraphQLError::new("x").with_path(vec![]).path, None);
    }
}
