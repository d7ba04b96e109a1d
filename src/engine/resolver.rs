// Event resolution

//! # Resolver
//!
//! Turns one broker payload into one GraphQL response for one subscription.
//! Every failure here is message level: the caller receives a
//! [`ResolvedMessage`] carrying errors, and the subscription stays active.
//!
//! ## Pipeline
//!
//! 1. decode the payload as a JSON object
//! 2. check `__typename` against the field's entity type (absent is fine)
//! 3. complete the entity through the [`EntitySource`] when the selection
//!    needs fields the payload does not carry and every key is present
//! 4. project the selection set (aliases, nested objects, lists,
//!    `__typename`), enforcing non-null fields
//!
//! Decode failures and collaborator faults are reported to the client as
//! `Internal server error`; the details only reach the server log.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::{error, warn};

use super::entities::EntitySource;
use crate::models::{
    EventFieldConfig, GraphQLError, RawEvent, ResolvedMessage, Selection, Subscription,
};
use crate::{EventRouterError, Result};

/// Resolves events for subscriptions
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, subscription: &Subscription, event: &RawEvent) -> ResolvedMessage;
}

/// Payload projection with optional entity completion
#[derive(Clone, Default)]
pub struct EventResolver {
    entities: Option<Arc<dyn EntitySource>>,
}

impl EventResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entity_source(mut self, entities: Arc<dyn EntitySource>) -> Self {
        self.entities = Some(entities);
        self
    }

    /// The `data` object for one event, or the error that replaces it
    pub async fn resolve_data(&self, subscription: &Subscription, event: &RawEvent) -> Result<Value> {
        let field = subscription.field();
        let root = &subscription.operation().root;

        let mut object = match serde_json::from_slice::<Value>(&event.payload) {
            Ok(Value::Object(object)) => object,
            Ok(other) => {
                return Err(EventRouterError::Decode(format!(
                    "expected a JSON object, got {}",
                    json_kind(&other)
                )))
            }
            Err(e) => return Err(EventRouterError::Decode(format!("invalid JSON payload: {}", e))),
        };

        match object.get("__typename") {
            None | Some(Value::Null) => {}
            Some(Value::String(name)) if *name == field.type_name => {}
            Some(other) => {
                return Err(EventRouterError::Decode(format!(
                    "payload __typename {} does not match {}",
                    other, field.type_name
                )))
            }
        }

        if let Some(entities) = &self.entities {
            if needs_entity(&object, &root.selection_set) {
                if let Some(representation) = representation(field, &object) {
                    let entity = entities
                        .fetch(&field.type_name, &representation, &root.selection_set)
                        .await?;
                    if let Some(entity) = entity {
                        for (key, value) in entity {
                            object.entry(key).or_insert(value);
                        }
                    }
                }
            }
        }

        let mut projection = Projection {
            field,
            root,
            schema_path: Vec::new(),
            response_path: Vec::new(),
        };
        let projected = projection.object(&object, &root.selection_set, true)?;

        let mut data = Map::new();
        data.insert(root.response_key.clone(), Value::Object(projected));
        Ok(Value::Object(data))
    }
}

#[async_trait]
impl Resolver for EventResolver {
    async fn resolve(&self, subscription: &Subscription, event: &RawEvent) -> ResolvedMessage {
        match self.resolve_data(subscription, event).await {
            Ok(data) => ResolvedMessage::data(subscription.id, data),
            Err(EventRouterError::Resolution { message, path }) => ResolvedMessage::errors(
                subscription.id,
                vec![GraphQLError::new(message).with_path(path)],
            ),
            Err(EventRouterError::Decode(detail)) => {
                warn!(
                    subscription_id = %subscription.id,
                    topic = %event.topic,
                    error = %detail,
                    "could not decode event payload"
                );
                ResolvedMessage::errors(subscription.id, vec![GraphQLError::internal()])
            }
            Err(other) => {
                error!(
                    subscription_id = %subscription.id,
                    topic = %event.topic,
                    error = %other,
                    "event resolution failed"
                );
                ResolvedMessage::errors(subscription.id, vec![GraphQLError::internal()])
            }
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn needs_entity(object: &Map<String, Value>, selections: &[Selection]) -> bool {
    selections
        .iter()
        .any(|s| !s.is_typename() && !object.contains_key(&s.field_name))
}

/// Federation representation, `None` when a key field is missing
fn representation(field: &EventFieldConfig, object: &Map<String, Value>) -> Option<Map<String, Value>> {
    let mut representation = Map::new();
    representation.insert("__typename".to_string(), Value::String(field.type_name.clone()));
    for key in &field.key_fields {
        match object.get(key) {
            Some(value) if !value.is_null() => {
                representation.insert(key.clone(), value.clone());
            }
            _ => return None,
        }
    }
    Some(representation)
}

struct Projection<'a> {
    field: &'a EventFieldConfig,
    root: &'a Selection,
    /// Field names below the root, for non-null rules and messages
    schema_path: Vec<String>,
    /// Response keys and list indices below the root, for the error path
    response_path: Vec<Value>,
}

impl Projection<'_> {
    fn object(
        &mut self,
        source: &Map<String, Value>,
        selections: &[Selection],
        is_root: bool,
    ) -> Result<Map<String, Value>> {
        let mut out = Map::new();
        for selection in selections {
            if selection.is_typename() {
                let typename = if is_root {
                    Value::String(self.field.type_name.clone())
                } else {
                    source.get("__typename").cloned().unwrap_or(Value::Null)
                };
                out.insert(selection.response_key.clone(), typename);
                continue;
            }

            self.schema_path.push(selection.field_name.clone());
            self.response_path.push(Value::String(selection.response_key.clone()));
            let value = source.get(&selection.field_name).cloned().unwrap_or(Value::Null);
            let projected = self.value(value, selection);
            self.schema_path.pop();
            self.response_path.pop();

            out.insert(selection.response_key.clone(), projected?);
        }
        Ok(out)
    }

    fn value(&mut self, value: Value, selection: &Selection) -> Result<Value> {
        match value {
            Value::Null => {
                let path: Vec<&str> = self.schema_path.iter().map(String::as_str).collect();
                if self.field.is_non_null(&path) {
                    Err(self.non_null_error())
                } else {
                    Ok(Value::Null)
                }
            }
            Value::Array(items) => {
                let mut projected = Vec::with_capacity(items.len());
                for (index, item) in items.into_iter().enumerate() {
                    self.response_path.push(Value::from(index));
                    let result = if item.is_null() {
                        Ok(Value::Null)
                    } else {
                        self.value(item, selection)
                    };
                    self.response_path.pop();
                    projected.push(result?);
                }
                Ok(Value::Array(projected))
            }
            Value::Object(object) if !selection.selection_set.is_empty() => Ok(Value::Object(
                self.object(&object, &selection.selection_set, false)?,
            )),
            Value::Object(_) => Err(EventRouterError::Decode(format!(
                "field '{}' is an object but was selected as a scalar",
                self.schema_path.join(".")
            ))),
            scalar if !selection.selection_set.is_empty() => Err(EventRouterError::Decode(format!(
                "field '{}' expected an object, got {}",
                self.schema_path.join("."),
                json_kind(&scalar)
            ))),
            scalar => Ok(scalar),
        }
    }

    fn non_null_error(&self) -> EventRouterError {
        let mut path = vec![Value::String(self.root.response_key.clone())];
        path.extend(self.response_path.iter().cloned());
        EventRouterError::Resolution {
            message: format!(
                "Cannot return null for non-nullable field 'Subscription.{}.{}'.",
                self.root.field_name,
                self.schema_path.join(".")
            ),
            path,
        }
    }
}
