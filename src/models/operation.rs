// GraphQL subscription documents

//! # Operation Models
//!
//! A client sends a [`SubscriptionRequest`] (the standard GraphQL-over-HTTP
//! body). It is parsed once, on subscribe, into a [`SubscriptionOperation`]:
//! the single root field, its arguments with variables already bound, and the
//! selection tree used to project every event payload afterwards.
//!
//! Parsing uses the `async-graphql` parser; only the executable subset this
//! engine needs is kept (fields, aliases, fragments, inline fragments).

use std::collections::{HashMap, HashSet};

use async_graphql::parser::parse_query;
use async_graphql::parser::types::{
    DocumentOperations, ExecutableDocument, OperationDefinition, OperationType, Selection as Node,
    SelectionSet,
};
use async_graphql::parser::Positioned;
use async_graphql::{Name, Value as ConstValue};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{EventRouterError, Result};

/// GraphQL request body as sent by clients
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionRequest {
    pub query: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variables: Option<Value>,

    #[serde(default, rename = "operationName", skip_serializing_if = "Option::is_none")]
    pub operation_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Value>,
}

impl SubscriptionRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Default::default()
        }
    }

    pub fn with_variables(mut self, variables: Value) -> Self {
        self.variables = Some(variables);
        self
    }

    pub fn with_operation_name(mut self, name: impl Into<String>) -> Self {
        self.operation_name = Some(name.into());
        self
    }
}

/// One selected field, fragments already flattened
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    /// Key in the response object (the alias when one is given)
    pub response_key: String,
    pub field_name: String,
    pub selection_set: Vec<Selection>,
}

impl Selection {
    pub fn leaf(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            response_key: name.clone(),
            field_name: name,
            selection_set: Vec::new(),
        }
    }

    pub fn object(name: impl Into<String>, selection_set: Vec<Selection>) -> Self {
        let mut selection = Self::leaf(name);
        selection.selection_set = selection_set;
        selection
    }

    pub fn is_typename(&self) -> bool {
        self.field_name == "__typename"
    }

    /// Renders the selection back to GraphQL text, without aliases
    pub fn to_graphql(&self) -> String {
        if self.selection_set.is_empty() {
            self.field_name.clone()
        } else {
            format!("{} {}", self.field_name, render_selection_set(&self.selection_set))
        }
    }
}

/// `{ a b { c } }` for a list of selections
pub fn render_selection_set(selections: &[Selection]) -> String {
    let fields: Vec<String> = selections.iter().map(Selection::to_graphql).collect();
    format!("{{ {} }}", fields.join(" "))
}

/// A parsed subscription with variables bound
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionOperation {
    pub operation_name: Option<String>,

    /// The single root subscription field
    pub root: Selection,

    /// Root field arguments as JSON, variables substituted
    pub arguments: Map<String, Value>,
}

impl SubscriptionOperation {
    pub fn parse(request: &SubscriptionRequest) -> Result<Self> {
        let document = parse_query(&request.query)
            .map_err(|e| EventRouterError::InvalidOperation(format!("Invalid query: {}", e)))?;

        let operation = select_operation(&document, request.operation_name.as_deref())?;
        let kind = match operation.ty {
            OperationType::Subscription => None,
            OperationType::Query => Some("query"),
            OperationType::Mutation => Some("mutation"),
        };
        if let Some(kind) = kind {
            return Err(EventRouterError::InvalidOperation(format!(
                "operation type '{}' is not supported on this endpoint",
                kind
            )));
        }

        let variables = bind_variables(operation, request.variables.as_ref());

        let mut visited = HashSet::new();
        let mut fields = Vec::new();
        collect_fields(&document, &operation.selection_set.node, &mut visited, &mut fields)?;
        let mut roots = fields.into_iter();
        let (root_node, root) = match (roots.next(), roots.next()) {
            (Some(root), None) => root,
            _ => {
                return Err(EventRouterError::InvalidOperation(
                    "Subscription must select only one top level field.".to_string(),
                ))
            }
        };

        let mut arguments = Map::new();
        for (name, value) in &root_node.arguments {
            let bound = value
                .node
                .clone()
                .into_const_with(|variable: Name| {
                    variables
                        .get(variable.as_str())
                        .cloned()
                        .map(ConstValue::from_json)
                        .unwrap_or(Ok(ConstValue::Null))
                })
                .and_then(ConstValue::into_json)
                .map_err(|e| {
                    EventRouterError::InvalidOperation(format!(
                        "Invalid value for argument '{}': {}",
                        name.node, e
                    ))
                })?;
            arguments.insert(name.node.to_string(), bound);
        }

        Ok(Self {
            operation_name: request.operation_name.clone(),
            root,
            arguments,
        })
    }

    pub fn field_name(&self) -> &str {
        &self.root.field_name
    }

    pub fn response_key(&self) -> &str {
        &self.root.response_key
    }

    pub fn argument(&self, name: &str) -> Option<&Value> {
        self.arguments.get(name)
    }
}

fn select_operation<'a>(
    document: &'a ExecutableDocument,
    operation_name: Option<&str>,
) -> Result<&'a OperationDefinition> {
    match (&document.operations, operation_name) {
        (DocumentOperations::Single(operation), _) => Ok(&operation.node),
        (DocumentOperations::Multiple(operations), Some(name)) => operations
            .iter()
            .find(|(key, _)| key.as_str() == name)
            .map(|(_, operation)| &operation.node)
            .ok_or_else(|| {
                EventRouterError::InvalidOperation(format!("Unknown operation named \"{}\".", name))
            }),
        (DocumentOperations::Multiple(operations), None) if operations.len() == 1 => operations
            .values()
            .next()
            .map(|operation| &operation.node)
            .ok_or_else(|| EventRouterError::InvalidOperation("Missing operation".to_string())),
        (DocumentOperations::Multiple(_), None) => Err(EventRouterError::InvalidOperation(
            "Must provide operation name if query contains multiple operations.".to_string(),
        )),
    }
}

/// Request variables merged over the declared defaults
fn bind_variables(operation: &OperationDefinition, provided: Option<&Value>) -> Map<String, Value> {
    let mut variables = Map::new();
    for definition in &operation.variable_definitions {
        if let Some(default) = &definition.node.default_value {
            if let Ok(value) = default.node.clone().into_json() {
                variables.insert(definition.node.name.node.to_string(), value);
            }
        }
    }
    if let Some(Value::Object(provided)) = provided {
        for (name, value) in provided {
            variables.insert(name.clone(), value.clone());
        }
    }
    variables
}

type FieldNode = async_graphql::parser::types::Field;

/// Flattens fragments and returns every field with its converted selection
fn collect_fields<'a>(
    document: &'a ExecutableDocument,
    selection_set: &'a SelectionSet,
    visited: &mut HashSet<String>,
    out: &mut Vec<(&'a FieldNode, Selection)>,
) -> Result<()> {
    for item in &selection_set.items {
        match &item.node {
            Node::Field(field) => {
                let selection = convert_field(document, &field.node, visited)?;
                out.push((&field.node, selection));
            }
            Node::InlineFragment(fragment) => {
                collect_fields(document, &fragment.node.selection_set.node, visited, out)?;
            }
            Node::FragmentSpread(spread) => {
                let name = spread.node.fragment_name.node.to_string();
                if !visited.insert(name.clone()) {
                    return Err(EventRouterError::InvalidOperation(format!(
                        "Cannot spread fragment \"{}\" within itself.",
                        name
                    )));
                }
                let fragment = document
                    .fragments
                    .get(&spread.node.fragment_name.node)
                    .ok_or_else(|| {
                        EventRouterError::InvalidOperation(format!(
                            "Unknown fragment \"{}\".",
                            name
                        ))
                    })?;
                collect_fields(document, &fragment.node.selection_set.node, visited, out)?;
                visited.remove(&name);
            }
        }
    }
    Ok(())
}

fn convert_field(
    document: &ExecutableDocument,
    field: &FieldNode,
    visited: &mut HashSet<String>,
) -> Result<Selection> {
    let field_name = field.name.node.to_string();
    let response_key = field
        .alias
        .as_ref()
        .map(|alias: &Positioned<Name>| alias.node.to_string())
        .unwrap_or_else(|| field_name.clone());

    let mut children = Vec::new();
    collect_fields(document, &field.selection_set.node, visited, &mut children)?;

    // Same response key selected twice (e.g. through a fragment) is merged
    let mut merged: Vec<Selection> = Vec::with_capacity(children.len());
    let mut positions: HashMap<String, usize> = HashMap::new();
    for (_, child) in children {
        match positions.get(&child.response_key) {
            Some(&index) => {
                let existing = &mut merged[index];
                for grandchild in child.selection_set {
                    if !existing
                        .selection_set
                        .iter()
                        .any(|s| s.response_key == grandchild.response_key)
                    {
                        existing.selection_set.push(grandchild);
                    }
                }
            }
            None => {
                positions.insert(child.response_key.clone(), merged.len());
                merged.push(child);
            }
        }
    }

    Ok(Selection {
        response_key,
        field_name,
        selection_set: merged,
    })
}
