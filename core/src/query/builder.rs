//! Fluent query construction.
//!
//! [`Query`] is a plain value: a selector string and the transforms to
//! apply. [`ClientQuery`] and [`QueryGroup`] bind queries to a
//! [`TreeClient`] so they can be sent:
//!
//! ```ignore
//! client.query("room > light").attr("on").run()?;
//!
//! let mut group = client.group();
//! group.add(Query::new("light").set_attr("on", "0"));
//! group.add(Query::new("switch").set_attr("armed", "1"));
//! group.run()?;
//! ```

use serde_json::Value;

use super::engine::QueryResult;
use super::selector::path_to_query;
use super::transform::{QuerySpec, Transform};
use crate::client::{ReplyHandle, TreeClient};
use crate::error::{ClientError, TreeError};
use crate::namespace::NodeDescriptor;


/// Kind of the nodes created for nested values by
/// [`QueryGroup::reflect_as_properties`].
pub const PROPERTY_GROUP_KIND: &str = "property-group";

/// Kind of the leaf nodes created by [`QueryGroup::reflect_as_properties`].
pub const PROPERTY_KIND: &str = "property";

/// Attribute holding a property leaf's value.
pub const PROPERTY_VALUE_ATTRIBUTE: &str = "value";


/// Chainable transform methods shared by every query builder.
pub trait Transforms: Sized {
    fn push_transform(&mut self, transform: Transform);

    /// Read an attribute on every node.
    fn attr(mut self, name: &str) -> Self {
        self.push_transform(Transform::Attr {
            name: name.to_string(),
            value: None,
        });
        self
    }

    fn set_attr(mut self, name: &str, value: &str) -> Self {
        self.push_transform(Transform::Attr {
            name: name.to_string(),
            value: Some(value.to_string()),
        });
        self
    }

    /// Read a style property on every node.
    fn css(mut self, name: &str) -> Self {
        self.push_transform(Transform::Css {
            name: name.to_string(),
            value: None,
        });
        self
    }

    fn set_css(mut self, name: &str, value: &str) -> Self {
        self.push_transform(Transform::Css {
            name: name.to_string(),
            value: Some(value.to_string()),
        });
        self
    }

    fn append(mut self, descriptor: NodeDescriptor) -> Self {
        self.push_transform(Transform::Append(descriptor));
        self
    }

    fn after(mut self, descriptor: NodeDescriptor) -> Self {
        self.push_transform(Transform::After(descriptor));
        self
    }

    fn empty(mut self) -> Self {
        self.push_transform(Transform::Empty);
        self
    }

    fn parent(mut self) -> Self {
        self.push_transform(Transform::Parent);
        self
    }

    fn children(mut self) -> Self {
        self.push_transform(Transform::Children);
        self
    }
}


// ---------------------------------------------------------------------------
// Query
// ---------------------------------------------------------------------------

/// A selector and its transforms, not yet bound to a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub selector: String,
    pub transforms: Vec<Transform>,
}

impl Query {
    pub fn new(selector: &str) -> Self {
        Query {
            selector: selector.to_string(),
            transforms: Vec::new(),
        }
    }

    /// A query addressing exactly the node at `path`.
    pub fn path(path: &str) -> Result<Self, TreeError> {
        Ok(Query::new(&path_to_query(path)?))
    }

    pub fn to_spec(&self) -> QuerySpec {
        QuerySpec {
            query: self.selector.clone(),
            transforms: self.transforms.iter().map(Transform::to_raw).collect(),
        }
    }
}

impl Transforms for Query {
    fn push_transform(&mut self, transform: Transform) {
        self.transforms.push(transform);
    }
}


/// A query bound to a client. Built by [`TreeClient::query`].
pub struct ClientQuery<'c> {
    client: &'c TreeClient,
    query: Query,
}

impl<'c> ClientQuery<'c> {
    pub(crate) fn new(client: &'c TreeClient, selector: &str) -> Self {
        ClientQuery {
            client,
            query: Query::new(selector),
        }
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    /// Send and wait for the result.
    pub fn run(self) -> Result<QueryResult, ClientError> {
        self.run_async()?.wait()
    }

    /// Send and return a handle for the result.
    pub fn run_async(self) -> Result<ReplyHandle<QueryResult>, ClientError> {
        self.client.single_query_async(self.query.to_spec())
    }
}

impl Transforms for ClientQuery<'_> {
    fn push_transform(&mut self, transform: Transform) {
        self.query.push_transform(transform);
    }
}


// ---------------------------------------------------------------------------
// QueryGroup
// ---------------------------------------------------------------------------

/// Several queries sent as one request and executed in order.
/// Built by [`TreeClient::group`].
pub struct QueryGroup<'c> {
    client: &'c TreeClient,
    queries: Vec<Query>,
}

impl<'c> QueryGroup<'c> {
    pub(crate) fn new(client: &'c TreeClient) -> Self {
        QueryGroup {
            client,
            queries: Vec::new(),
        }
    }

    pub fn add(&mut self, query: Query) -> &mut Self {
        self.queries.push(query);
        self
    }

    pub fn len(&self) -> usize {
        self.queries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }

    /// Mirror a JSON value as nodes under every match of `selector`.
    /// See [`property_queries`].
    pub fn reflect_as_properties(&mut self, selector: &str, props: &Value) -> &mut Self {
        self.queries.extend(property_queries(selector, props));
        self
    }

    pub fn specs(&self) -> Vec<QuerySpec> {
        self.queries.iter().map(Query::to_spec).collect()
    }

    /// Send and wait. Each member reports its own success or error.
    pub fn run(&self) -> Result<Vec<Result<QueryResult, TreeError>>, ClientError> {
        self.run_async()?.wait()
    }

    pub fn run_async(&self) -> Result<ReplyHandle<Vec<Result<QueryResult, TreeError>>>, ClientError> {
        self.client.group_query_async(self.specs())
    }
}


/// Expand a JSON value into the queries that mirror it as nodes.
///
/// Objects and arrays become `property-group` nodes (array items are
/// named by index), scalars become `property` nodes carrying the value
/// in their `value` attribute. Spaces in keys become underscores. The
/// queries must run in order: nested groups are addressed through the
/// group created just before them.
pub fn property_queries(selector: &str, props: &Value) -> Vec<Query> {
    let mut out = Vec::new();
    expand_properties(selector, props, &mut out);
    out
}

fn expand_properties(selector: &str, props: &Value, out: &mut Vec<Query>) {
    let entries: Vec<(String, &Value)> = match props {
        Value::Object(map) => map.iter().map(|(k, v)| (k.clone(), v)).collect(),
        Value::Array(items) => items
            .iter()
            .enumerate()
            .map(|(i, v)| (i.to_string(), v))
            .collect(),
        _ => Vec::new(),
    };
    for (key, value) in entries {
        let key = key.replace(' ', "_");
        match value {
            Value::Object(_) | Value::Array(_) => {
                out.push(
                    Query::new(selector).append(NodeDescriptor::new(PROPERTY_GROUP_KIND, &key)),
                );
                let nested = format!(
                    "{} > {}[name=\"{}\"]",
                    selector,
                    PROPERTY_GROUP_KIND,
                    key.replace('\\', "\\\\").replace('"', "\\\"")
                );
                expand_properties(&nested, value, out);
            }
            scalar => {
                let text = match scalar {
                    Value::String(s) => s.clone(),
                    Value::Null => String::new(),
                    other => other.to_string(),
                };
                out.push(Query::new(selector).append(
                    NodeDescriptor::new(PROPERTY_KIND, &key)
                        .with_attribute(PROPERTY_VALUE_ATTRIBUTE, &text),
                ));
            }
        }
    }
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
