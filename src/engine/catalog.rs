// Event field catalogue

//! # Events Catalog
//!
//! Knows which subscription root fields are event driven and compiles a
//! client request into a [`CompiledSubscription`]: parsed operation, field
//! configuration and the canonical [`SourceKey`] with argument templates
//! rendered (`employeeUpdated.{{ args.employeeID }}` → `employeeUpdated.3`).

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::models::{
    CompiledSubscription, EventFieldConfig, SourceKey, SubscriptionOperation, SubscriptionRequest,
};
use crate::{EventRouterError, Result};

#[derive(Debug, Default, Clone)]
pub struct EventsCatalog {
    fields: HashMap<String, Arc<EventFieldConfig>>,
}

impl EventsCatalog {
    pub fn new(fields: impl IntoIterator<Item = EventFieldConfig>) -> Self {
        Self {
            fields: fields
                .into_iter()
                .map(|field| (field.field_name.clone(), Arc::new(field)))
                .collect(),
        }
    }

    pub fn get(&self, field_name: &str) -> Option<Arc<EventFieldConfig>> {
        self.fields.get(field_name).cloned()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn compile(&self, request: &SubscriptionRequest) -> Result<CompiledSubscription> {
        let operation = SubscriptionOperation::parse(request)?;
        let field = self.get(operation.field_name()).ok_or_else(|| {
            EventRouterError::InvalidOperation(format!(
                "Cannot query field \"{}\" on type \"Subscription\".",
                operation.field_name()
            ))
        })?;

        let topics = field
            .topics
            .iter()
            .map(|template| render_topic(template, &operation.arguments))
            .collect::<Result<Vec<_>>>()?;

        Ok(CompiledSubscription {
            source_key: SourceKey::new(field.provider_id.clone(), topics),
            operation: Arc::new(operation),
            field,
        })
    }
}

/// Replaces every `{{ args.<name> }}` with the argument's value
pub fn render_topic(template: &str, arguments: &Map<String, Value>) -> Result<String> {
    let mut rendered = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        rendered.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after.find("}}").ok_or_else(|| {
            EventRouterError::Config(format!("unterminated template in topic '{}'", template))
        })?;

        let expression = after[..end].trim();
        let name = expression.strip_prefix("args.").ok_or_else(|| {
            EventRouterError::Config(format!(
                "unsupported template '{}' in topic '{}'",
                expression, template
            ))
        })?;

        let value = match arguments.get(name) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            Some(Value::Bool(b)) => b.to_string(),
            Some(Value::Null) | None => {
                return Err(EventRouterError::InvalidOperation(format!(
                    "argument \"{}\" is required to subscribe",
                    name
                )))
            }
            Some(other) => {
                return Err(EventRouterError::InvalidOperation(format!(
                    "argument \"{}\" must be a scalar, got {}",
                    name, other
                )))
            }
        };
        rendered.push_str(&value);
        rest = &after[end + 2..];
    }

    rendered.push_str(rest);
    Ok(rendered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn catalog() -> EventsCatalog {
        EventsCatalog::new([
            EventFieldConfig::new(
                "employeeUpdatedMyKafka",
                "my-kafka",
                vec!["employeeUpdated".to_string()],
                "Employee",
            ),
            EventFieldConfig::new(
                "employeeUpdated",
                "default",
                vec!["employeeUpdated.{{ args.employeeID }}".to_string()],
                "Employee",
            ),
        ])
    }

    #[test]
    fn test_render_topic_templates() {
        let args = json!({"employeeID": 3, "name": "jens", "active": true});
        let args = args.as_object().unwrap();

        assert_eq!(render_topic("plain", args).unwrap(), "plain");
        assert_eq!(render_topic("a.{{ args.employeeID }}", args).unwrap(), "a.3");
        assert_eq!(render_topic("{{args.name}}-{{ args.active }}", args).unwrap(), "jens-true");
        assert!(matches!(
            render_topic("a.{{ args.missing }}", args),
            Err(EventRouterError::InvalidOperation(_))
        ));
        assert!(matches!(render_topic("a.{{ args.x", args), Err(EventRouterError::Config(_))));
    }

    #[test]
    fn test_same_rendered_topics_share_a_key() {
        let catalog = catalog();
        let a = catalog
            .compile(&SubscriptionRequest::new(
                "subscription { employeeUpdatedMyKafka(employeeID: 3) { id } }",
            ))
            .unwrap();
        let b = catalog
            .compile(&SubscriptionRequest::new(
                "subscription { employeeUpdatedMyKafka(employeeID: 1) { id details { forename } } }",
            ))
            .unwrap();

        // employeeID is not part of this field's topic, so both share one binding
        assert_eq!(a.source_key, b.source_key);
        assert_eq!(a.source_key, SourceKey::new("my-kafka", ["employeeUpdated"]));
    }

    #[test]
    fn test_templated_topics_split_keys() {
        let catalog = catalog();
        let query = "subscription($id: Int!) { employeeUpdated(employeeID: $id) { id } }";
        let one = catalog
            .compile(&SubscriptionRequest::new(query).with_variables(json!({"id": 1})))
            .unwrap();
        let two = catalog
            .compile(&SubscriptionRequest::new(query).with_variables(json!({"id": 2})))
            .unwrap();

        assert_eq!(one.source_key.topics, vec!["employeeUpdated.1".to_string()]);
        assert_ne!(one.source_key, two.source_key);
    }

    #[test]
    fn test_unknown_field_is_rejected() {
        let result = catalog().compile(&SubscriptionRequest::new("subscription { countHits { n } }"));
        match result {
            Err(EventRouterError::InvalidOperation(message)) => {
                assert_eq!(message, "Cannot query field \"countHits\" on type \"Subscription\".")
            }
            other => panic!("unexpected result: {:?}", other.map(|c| c.source_key)),
        }
    }
}
