//! Transform executor.
//!
//! A query is a selector plus an ordered list of transforms. The wire form
//! ([`RawTransform`]: a method name and JSON arguments) is compiled into the
//! closed [`Transform`] enum before anything touches the tree, so unknown
//! methods and malformed arguments fail `InvalidTransform` up front.
//!
//! Execution keeps a working set of node ids, seeded by the selector and
//! rewritten by navigation. Each transform applies to every node currently
//! in the set, left to right. The first failure stops that query; changes
//! already made stand.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use super::engine::{self, QueryResult};
use super::selector::Selector;
use crate::error::TreeError;
use crate::namespace::{Change, NodeDescriptor, NodeId, Tree, NAME_ATTRIBUTE};


// ---------------------------------------------------------------------------
// Wire form
// ---------------------------------------------------------------------------

/// One transform as it travels on the wire: `{"method": "attr", "args": [..]}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawTransform {
    pub method: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

/// One member of a query group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuerySpec {
    pub query: String,
    #[serde(default)]
    pub transforms: Vec<RawTransform>,
}


// ---------------------------------------------------------------------------
// Transform
// ---------------------------------------------------------------------------

/// The closed set of operations a query can apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transform {
    /// Read (`value: None`) or write an attribute.
    Attr { name: String, value: Option<String> },
    /// Read or write a style property. Selectors never see these.
    Css { name: String, value: Option<String> },
    /// Create a child of each node.
    Append(NodeDescriptor),
    /// Create a sibling of each node.
    After(NodeDescriptor),
    /// Remove every descendant of each node.
    Empty,
    /// Replace the working set with the parents of its nodes.
    Parent,
    /// Replace the working set with the children of its nodes.
    Children,
}

impl Transform {
    pub fn method(&self) -> &'static str {
        match self {
            Transform::Attr { .. } => "attr",
            Transform::Css { .. } => "css",
            Transform::Append(_) => "append",
            Transform::After(_) => "after",
            Transform::Empty => "empty",
            Transform::Parent => "parent",
            Transform::Children => "children",
        }
    }

    /// True for transforms that change the tree.
    pub fn is_mutating(&self) -> bool {
        match self {
            Transform::Attr { value, .. } | Transform::Css { value, .. } => value.is_some(),
            Transform::Append(_) | Transform::After(_) | Transform::Empty => true,
            Transform::Parent | Transform::Children => false,
        }
    }

    /// Back to the wire form.
    pub fn to_raw(&self) -> RawTransform {
        let args = match self {
            Transform::Attr { name, value } | Transform::Css { name, value } => {
                let mut args = vec![Value::String(name.clone())];
                if let Some(v) = value {
                    args.push(Value::String(v.clone()));
                }
                args
            }
            Transform::Append(d) | Transform::After(d) => {
                vec![json!({
                    "kind": d.kind,
                    "name": d.name,
                    "attributes": d.attributes,
                })]
            }
            Transform::Empty | Transform::Parent | Transform::Children => Vec::new(),
        };
        RawTransform {
            method: self.method().to_string(),
            args,
        }
    }
}

impl TryFrom<&RawTransform> for Transform {
    type Error = TreeError;

    fn try_from(raw: &RawTransform) -> Result<Self, TreeError> {
        let method = raw.method.as_str();
        match method {
            "attr" | "css" => {
                let (name, value) = match raw.args.as_slice() {
                    [name] => (string_arg(method, name)?, None),
                    [name, value] => (string_arg(method, name)?, Some(scalar_arg(method, value)?)),
                    _ => {
                        return Err(TreeError::transform(
                            method,
                            format!("expected 1 or 2 arguments, got {}", raw.args.len()),
                        ))
                    }
                };
                if method == "attr" {
                    Ok(Transform::Attr { name, value })
                } else {
                    Ok(Transform::Css { name, value })
                }
            }
            "append" | "after" => {
                let descriptor = match raw.args.as_slice() {
                    [d] => serde_json::from_value::<NodeDescriptor>(d.clone())
                        .map_err(|e| TreeError::transform(method, format!("bad descriptor: {}", e)))?,
                    _ => {
                        return Err(TreeError::transform(
                            method,
                            format!("expected 1 argument, got {}", raw.args.len()),
                        ))
                    }
                };
                if method == "append" {
                    Ok(Transform::Append(descriptor))
                } else {
                    Ok(Transform::After(descriptor))
                }
            }
            "empty" | "parent" | "children" => {
                if !raw.args.is_empty() {
                    return Err(TreeError::transform(method, "takes no arguments"));
                }
                Ok(match method {
                    "empty" => Transform::Empty,
                    "parent" => Transform::Parent,
                    _ => Transform::Children,
                })
            }
            other => Err(TreeError::transform(other, "unknown method")),
        }
    }
}

fn string_arg(method: &str, v: &Value) -> Result<String, TreeError> {
    match v {
        Value::String(s) if !s.is_empty() => Ok(s.clone()),
        other => Err(TreeError::transform(
            method,
            format!("expected a non-empty string name, got {}", other),
        )),
    }
}

/// Attribute values are strings; numbers and booleans are accepted in
/// their JSON text form.
fn scalar_arg(method: &str, v: &Value) -> Result<String, TreeError> {
    match v {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => Err(TreeError::transform(
            method,
            format!("expected a scalar value, got {}", other),
        )),
    }
}


// ---------------------------------------------------------------------------
// Compiled queries and groups
// ---------------------------------------------------------------------------

/// A parsed selector with its typed transforms.
#[derive(Debug, Clone)]
pub struct CompiledQuery {
    pub selector: Selector,
    pub transforms: Vec<Transform>,
}

impl CompiledQuery {
    pub fn compile(spec: &QuerySpec) -> Result<Self, TreeError> {
        let selector = Selector::parse(&spec.query)?;
        let transforms = spec
            .transforms
            .iter()
            .map(Transform::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(CompiledQuery { selector, transforms })
    }

    pub fn is_mutating(&self) -> bool {
        self.transforms.iter().any(Transform::is_mutating)
    }
}


/// What a group execution produced.
#[derive(Debug, Default)]
pub struct GroupOutcome {
    /// One entry per member, in request order.
    pub results: Vec<Result<QueryResult, TreeError>>,
    /// Every change made, in the order it was made.
    pub changes: Vec<Change>,
}


/// A compiled query group. Members that failed to compile keep their
/// error and report it in their result slot.
#[derive(Debug)]
pub struct GroupPlan {
    members: Vec<Result<CompiledQuery, TreeError>>,
}

impl GroupPlan {
    pub fn compile(specs: &[QuerySpec]) -> Self {
        GroupPlan {
            members: specs.iter().map(CompiledQuery::compile).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// True if any successfully compiled member changes the tree.
    pub fn is_mutating(&self) -> bool {
        self.members
            .iter()
            .any(|m| m.as_ref().map(CompiledQuery::is_mutating).unwrap_or(false))
    }

    /// Run every member in order with write access.
    pub fn execute(&self, tree: &mut Tree) -> GroupOutcome {
        let mut access = Access::Exclusive(tree);
        self.run(&mut access)
    }

    /// Run a read-only plan. Mutating members fail `Protocol`.
    pub fn execute_read(&self, tree: &Tree) -> Vec<Result<QueryResult, TreeError>> {
        let mut access = Access::Shared(tree);
        self.run(&mut access).results
    }

    fn run(&self, access: &mut Access<'_>) -> GroupOutcome {
        let mut outcome = GroupOutcome::default();
        for (index, member) in self.members.iter().enumerate() {
            let result = match member {
                Ok(query) => execute_query(access, query, &mut outcome.changes),
                Err(e) => Err(e.clone()),
            };
            if let Err(e) = &result {
                debug!(member = index, error = %e, "query member failed");
            }
            outcome.results.push(result);
        }
        outcome
    }
}


// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

enum Access<'t> {
    Shared(&'t Tree),
    Exclusive(&'t mut Tree),
}

impl Access<'_> {
    fn tree(&self) -> &Tree {
        match self {
            Access::Shared(t) => *t,
            Access::Exclusive(t) => &**t,
        }
    }

    fn tree_mut(&mut self, method: &str) -> Result<&mut Tree, TreeError> {
        match self {
            Access::Exclusive(t) => Ok(&mut **t),
            Access::Shared(_) => Err(TreeError::Protocol {
                reason: format!("'{}' needs write access", method),
            }),
        }
    }
}


fn execute_query(
    access: &mut Access<'_>,
    query: &CompiledQuery,
    changes: &mut Vec<Change>,
) -> Result<QueryResult, TreeError> {
    let mut working = engine::select(access.tree(), &query.selector);
    let mut values: HashMap<NodeId, Option<String>> = HashMap::new();

    for transform in &query.transforms {
        let method = transform.method();
        match transform {
            Transform::Attr { name, value: None } => {
                let tree = access.tree();
                for &id in &working {
                    values.insert(id, read_attribute(tree, id, name));
                }
            }
            Transform::Css { name, value: None } => {
                let tree = access.tree();
                for &id in &working {
                    let v = tree.entry(id).and_then(|e| e.style.get(name).cloned());
                    values.insert(id, v);
                }
            }
            Transform::Attr { name, value: Some(v) } => {
                let tree = access.tree_mut(method)?;
                for &id in &working {
                    changes.push(tree.set_attribute(id, name, v)?);
                }
            }
            Transform::Css { name, value: Some(v) } => {
                let tree = access.tree_mut(method)?;
                for &id in &working {
                    changes.push(tree.set_style(id, name, v)?);
                }
            }
            Transform::Append(descriptor) => {
                let tree = access.tree_mut(method)?;
                for &id in &working {
                    changes.push(tree.insert_child(id, descriptor)?);
                }
            }
            Transform::After(descriptor) => {
                let tree = access.tree_mut(method)?;
                for &id in &working {
                    let parent = tree
                        .entry(id)
                        .and_then(|e| e.parent)
                        .ok_or_else(|| TreeError::NoSuchNode {
                            path: "/..".to_string(),
                        })?;
                    changes.push(tree.insert_child(parent, descriptor)?);
                }
            }
            Transform::Empty => {
                let tree = access.tree_mut(method)?;
                for &id in &working {
                    changes.extend(tree.empty(id));
                }
            }
            Transform::Parent => {
                let tree = access.tree();
                working = working
                    .iter()
                    .filter_map(|&id| tree.entry(id).and_then(|e| e.parent))
                    .collect();
            }
            Transform::Children => {
                let tree = access.tree();
                working = working
                    .iter()
                    .filter_map(|&id| tree.entry(id))
                    .flat_map(|e| e.children.values().copied())
                    .collect();
            }
        }
        let tree = access.tree();
        dedupe_live(tree, &mut working);
        // Freed slots are reused by later appends; a read must not outlive its node.
        values.retain(|id, _| tree.contains(*id));
    }

    Ok(engine::collect(access.tree(), &working, &values))
}

fn read_attribute(tree: &Tree, id: NodeId, name: &str) -> Option<String> {
    let entry = tree.entry(id)?;
    if name == NAME_ATTRIBUTE {
        return entry.path.name().map(str::to_string);
    }
    entry.attributes.get(name).cloned()
}

/// Drop ids whose nodes are gone and keep the first occurrence of each.
fn dedupe_live(tree: &Tree, working: &mut Vec<NodeId>) {
    let mut seen = HashSet::new();
    working.retain(|id| tree.contains(*id) && seen.insert(*id));
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
