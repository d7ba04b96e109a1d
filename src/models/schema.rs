// Event field configuration and compiled subscriptions

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::event::SourceKey;
use super::operation::SubscriptionOperation;

fn default_key_fields() -> Vec<String> {
    vec!["id".to_string()]
}

/// How one subscription root field maps onto broker topics
///
/// Topics may contain argument templates such as
/// `employeeUpdated.{{ args.employeeID }}`; they are rendered per
/// subscription when it is compiled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventFieldConfig {
    /// Subscription root field name, e.g. `employeeUpdatedMyKafka`
    pub field_name: String,

    /// Provider (event source) the topics live on
    pub provider_id: String,

    pub topics: Vec<String>,

    /// Entity type the payload describes, e.g. `Employee`
    pub type_name: String,

    /// Entity key fields; always non-nullable
    #[serde(default = "default_key_fields")]
    pub key_fields: Vec<String>,

    /// Further non-nullable fields as dotted paths relative to the entity
    #[serde(default)]
    pub non_null_fields: Vec<String>,
}

impl EventFieldConfig {
    pub fn new(
        field_name: impl Into<String>,
        provider_id: impl Into<String>,
        topics: Vec<String>,
        type_name: impl Into<String>,
    ) -> Self {
        Self {
            field_name: field_name.into(),
            provider_id: provider_id.into(),
            topics,
            type_name: type_name.into(),
            key_fields: default_key_fields(),
            non_null_fields: Vec::new(),
        }
    }

    pub fn with_non_null_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.non_null_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    /// Whether the field at `path` (entity-relative) may not be null
    pub fn is_non_null(&self, path: &[&str]) -> bool {
        if path.len() == 1 && self.key_fields.iter().any(|k| k == path[0]) {
            return true;
        }
        let dotted = path.join(".");
        self.non_null_fields.iter().any(|f| *f == dotted)
    }
}

/// A subscription request compiled against the event field catalogue
#[derive(Debug, Clone)]
pub struct CompiledSubscription {
    pub operation: Arc<SubscriptionOperation>,
    pub field: Arc<EventFieldConfig>,
    pub source_key: SourceKey,
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::operation::SubscriptionRequest;

    pub(crate) const EMPLOYEE_QUERY: &str =
        "subscription { employeeUpdatedMyKafka(employeeID: 3) { id details { forename surname } } }";

    pub(crate) fn employee_field() -> EventFieldConfig {
        EventFieldConfig::new(
            "employeeUpdatedMyKafka",
            "my-kafka",
            vec!["employeeUpdated".to_string()],
            "Employee",
        )
    }

    pub(crate) fn employee_subscription() -> CompiledSubscription {
        let operation = SubscriptionOperation::parse(&SubscriptionRequest::new(EMPLOYEE_QUERY))
            .expect("valid employee subscription");
        CompiledSubscription {
            operation: Arc::new(operation),
            field: Arc::new(employee_field()),
            source_key: SourceKey::new("my-kafka", ["employeeUpdated"]),
        }
    }

    #[test]
    fn test_key_fields_are_non_null() {
        let field = employee_field().with_non_null_fields(["details.forename"]);

        assert!(field.is_non_null(&["id"]));
        assert!(field.is_non_null(&["details", "forename"]));
        assert!(!field.is_non_null(&["details"]));
        assert!(!field.is_non_null(&["details", "surname"]));
    }

    #[test]
    fn test_defaults_from_yaml_like_json() {
        let field: EventFieldConfig = serde_json::from_value(serde_json::json!({
            "field_name": "employeeUpdated",
            "provider_id": "default",
            "topics": ["employeeUpdated.{{ args.employeeID }}"],
            "type_name": "Employee"
        }))
        .unwrap();

        assert_eq!(field.key_fields, vec!["id".to_string()]);
        assert!(field.non_null_fields.is_empty());
    }
}
