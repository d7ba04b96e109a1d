// Entity completion collaborators

//! # Entity Sources
//!
//! Broker payloads usually carry only an entity's keys (`{"__typename":
//! "Employee","id":1}`). When a subscription selects more than the payload
//! holds, the resolver asks an [`EntitySource`] for the rest, using a
//! federation representation (`__typename` + key fields).
//!
//! - [`StaticEntitySource`]: records from configuration, used by tests and
//!   demos
//! - [`SubgraphEntitySource`]: a federation `_entities` query against the
//!   owning subgraph

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::models::operation::render_selection_set;
use crate::models::{GraphQLError, Selection};
use crate::{EventRouterError, Result};

#[async_trait]
pub trait EntitySource: Send + Sync {
    /// Looks up one entity; `Ok(None)` when it does not exist
    async fn fetch(
        &self,
        type_name: &str,
        representation: &Map<String, Value>,
        selection: &[Selection],
    ) -> Result<Option<Map<String, Value>>>;
}

/// Entities held in memory, keyed by type name
#[derive(Debug, Default, Clone)]
pub struct StaticEntitySource {
    records: HashMap<String, Vec<Map<String, Value>>>,
}

impl StaticEntitySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_record(mut self, type_name: impl Into<String>, record: Value) -> Self {
        if let Value::Object(record) = record {
            self.records.entry(type_name.into()).or_default().push(record);
        }
        self
    }

    pub fn from_records(records: HashMap<String, Vec<Value>>) -> Self {
        records
            .into_iter()
            .flat_map(|(type_name, values)| values.into_iter().map(move |v| (type_name.clone(), v)))
            .fold(Self::new(), |source, (type_name, value)| {
                source.with_record(type_name, value)
            })
    }
}

#[async_trait]
impl EntitySource for StaticEntitySource {
    async fn fetch(
        &self,
        type_name: &str,
        representation: &Map<String, Value>,
        _selection: &[Selection],
    ) -> Result<Option<Map<String, Value>>> {
        // config files may lowercase map keys
        let records = self.records.get(type_name).or_else(|| {
            self.records
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case(type_name))
                .map(|(_, records)| records)
        });
        let Some(records) = records else {
            return Ok(None);
        };

        let found = records.iter().find(|record| {
            representation
                .iter()
                .filter(|(key, _)| key.as_str() != "__typename")
                .all(|(key, value)| record.get(key) == Some(value))
        });
        Ok(found.cloned())
    }
}

#[derive(Debug, Deserialize)]
struct EntitiesResponse {
    #[serde(default)]
    data: Option<EntitiesData>,
    #[serde(default)]
    errors: Vec<GraphQLError>,
}

#[derive(Debug, Deserialize)]
struct EntitiesData {
    #[serde(rename = "_entities", default)]
    entities: Vec<Value>,
}

/// Federation `_entities` lookups against a subgraph
#[derive(Debug, Clone)]
pub struct SubgraphEntitySource {
    client: reqwest::Client,
    url: String,
}

impl SubgraphEntitySource {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EventRouterError::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

/// `_entities` query text for one type and selection
pub fn entities_query(type_name: &str, selection: &[Selection]) -> String {
    format!(
        "query($representations: [_Any!]!) {{ _entities(representations: $representations) {{ ... on {} {} }} }}",
        type_name,
        render_selection_set(selection)
    )
}

#[async_trait]
impl EntitySource for SubgraphEntitySource {
    async fn fetch(
        &self,
        type_name: &str,
        representation: &Map<String, Value>,
        selection: &[Selection],
    ) -> Result<Option<Map<String, Value>>> {
        let body = json!({
            "query": entities_query(type_name, selection),
            "variables": { "representations": [representation] },
        });

        debug!(url = %self.url, type_name, "fetching entity from subgraph");
        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| EventRouterError::Fatal(format!("entity fetch failed: {}", e)))?
            .error_for_status()
            .map_err(|e| EventRouterError::Fatal(format!("entity fetch failed: {}", e)))?;

        let response: EntitiesResponse = response
            .json()
            .await
            .map_err(|e| EventRouterError::Fatal(format!("invalid entity response: {}", e)))?;

        if let Some(error) = response.errors.first() {
            return Err(EventRouterError::Fatal(format!(
                "subgraph returned errors: {}",
                error.message
            )));
        }

        match response.data.and_then(|d| d.entities.into_iter().next()) {
            Some(Value::Object(entity)) => Ok(Some(entity)),
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn representation(id: i64) -> Map<String, Value> {
        json!({"__typename": "Employee", "id": id})
            .as_object()
            .cloned()
            .unwrap()
    }

    #[tokio::test]
    async fn test_static_source_matches_keys() {
        let source = StaticEntitySource::new()
            .with_record(
                "Employee",
                json!({"id": 1, "details": {"forename": "Jens", "surname": "Neuse"}}),
            )
            .with_record("Employee", json!({"id": 2, "details": {"forename": "Dustin"}}));

        let found = source.fetch("Employee", &representation(1), &[]).await.unwrap();
        assert_eq!(
            found.and_then(|e| e.get("details").cloned()),
            Some(json!({"forename": "Jens", "surname": "Neuse"}))
        );

        assert!(source.fetch("Employee", &representation(9), &[]).await.unwrap().is_none());
        assert!(source.fetch("Team", &representation(1), &[]).await.unwrap().is_none());
    }

    #[test]
    fn test_from_records() {
        let mut records = HashMap::new();
        records.insert("Employee".to_string(), vec![json!({"id": 1}), json!("not an object")]);

        let source = StaticEntitySource::from_records(records);
        assert_eq!(source.records.get("Employee").map(Vec::len), Some(1));
    }

    #[test]
    fn test_entities_query_text() {
        let selection = vec![Selection::object(
            "details",
            vec![Selection::leaf("forename"), Selection::leaf("surname")],
        )];
        assert_eq!(
            entities_query("Employee", &selection),
            "query($representations: [_Any!]!) { _entities(representations: $representations) { ... on Employee { details { forename surname } } } }"
        );
    }
}
