//! Node tree store.
//!
//! An arena of nodes addressed by stable [`NodeId`]s. Each node owns a
//! name-indexed map of child ids and keeps its parent as a plain id, so the
//! hierarchy never holds a cyclic owning reference and removal never leaves
//! anything dangling. There is no re-parenting operation: the store is
//! always a tree.
//!
//! Every mutating primitive returns the [`Change`] records it produced so
//! the subscription registry can be triggered by the caller.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use super::path::{validate_component, TreePath};
use crate::error::TreeError;
use crate::query::selector::Facet;


/// Kind carried by the root node and by nothing else.
pub const ROOT_KIND: &str = "root";

/// Kind given to nodes created without one.
pub const DEFAULT_KIND: &str = "node";

/// Pseudo-attribute exposing a node's name to selectors and `attr()`.
pub const NAME_ATTRIBUTE: &str = "name";


/// Stable handle into the arena. Only meaningful while the node lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);


/// Arena slot contents.
#[derive(Debug, Clone)]
pub(crate) struct NodeEntry {
    pub(crate) path: TreePath,
    pub(crate) kind: String,
    pub(crate) attributes: BTreeMap<String, String>,
    pub(crate) style: BTreeMap<String, String>,
    pub(crate) children: BTreeMap<String, NodeId>,
    pub(crate) parent: Option<NodeId>,
}

impl Facet for NodeEntry {
    fn name(&self) -> Option<&str> {
        self.path.name()
    }

    fn kind(&self) -> &str {
        &self.kind
    }

    fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(|s| s.as_str())
    }
}


/// Read-only snapshot of a node, as returned by [`Tree::get_node`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub path: String,
    /// `None` for the root.
    #[serde(default)]
    pub name: Option<String>,
    pub kind: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub style: BTreeMap<String, String>,
    #[serde(default)]
    pub children: BTreeSet<String>,
}


/// Name, kind and attributes of one node, detached from the arena.
///
/// Changes carry the lineage of the changed node as a list of these so a
/// selector can still be tested after the node itself is gone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSummary {
    pub name: Option<String>,
    pub kind: String,
    pub attributes: BTreeMap<String, String>,
}

impl Facet for NodeSummary {
    fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn kind(&self) -> &str {
        &self.kind
    }

    fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(|s| s.as_str())
    }
}


/// Structured description of a node to create via `append`/`after`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub kind: String,
    pub name: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl NodeDescriptor {
    pub fn new(kind: &str, name: &str) -> Self {
        NodeDescriptor {
            kind: kind.to_string(),
            name: name.to_string(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: &str, value: &str) -> Self {
        self.attributes.insert(key.to_string(), value.to_string());
        self
    }
}


/// What happened to a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ChangeEvent {
    Created { kind: String },
    Removed,
    Attribute { name: String, value: String },
    Style { name: String, value: String },
}


/// One mutation, with the lineage (root first, changed node last) as it
/// stood when the change happened. Removals capture it before removal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub path: TreePath,
    pub event: ChangeEvent,
    pub lineage: Vec<NodeSummary>,
}


/// Check a kind token: `[A-Za-z0-9_-]+`, never the reserved root kind.
pub fn validate_kind(kind: &str) -> Result<(), TreeError> {
    let well_formed = !kind.is_empty()
        && kind
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if !well_formed || kind == ROOT_KIND {
        return Err(TreeError::InvalidKind {
            kind: kind.to_string(),
        });
    }
    Ok(())
}


/// The hierarchical node store.
#[derive(Debug, Clone)]
pub struct Tree {
    slots: Vec<Option<NodeEntry>>,
    free: Vec<usize>,
    root: NodeId,
    live: usize,
}

impl Tree {
    /// A tree holding only the root.
    pub fn new() -> Self {
        let root = NodeEntry {
            path: TreePath::root(),
            kind: ROOT_KIND.to_string(),
            attributes: BTreeMap::new(),
            style: BTreeMap::new(),
            children: BTreeMap::new(),
            parent: None,
        };
        Tree {
            slots: vec![Some(root)],
            free: Vec::new(),
            root: NodeId(0),
            live: 1,
        }
    }

    /// Create `name` under `parent_path` with the default kind and no attributes.
    pub fn create_child(&mut self, parent_path: &str, name: &str) -> Result<Change, TreeError> {
        self.create_child_of_kind(parent_path, name, DEFAULT_KIND)
    }

    /// Create `name` under `parent_path` with an explicit kind.
    pub fn create_child_of_kind(
        &mut self,
        parent_path: &str,
        name: &str,
        kind: &str,
    ) -> Result<Change, TreeError> {
        let parent_path = TreePath::parse(parent_path)?;
        validate_component(name)?;
        validate_kind(kind)?;
        let parent = self.lookup(&parent_path)?;
        self.insert_child(parent, &NodeDescriptor::new(kind, name))
    }

    /// Detach and destroy the childless node `name` under `parent_path`.
    pub fn remove_child(&mut self, parent_path: &str, name: &str) -> Result<Change, TreeError> {
        let parent_path = TreePath::parse(parent_path)?;
        validate_component(name)?;
        let parent = self.lookup(&parent_path)?;
        let target = self
            .entry(parent)
            .and_then(|p| p.children.get(name).copied())
            .ok_or_else(|| TreeError::NoSuchNode {
                path: parent_path.join(name).map(|p| p.to_string()).unwrap_or_default(),
            })?;
        let entry = self.live_entry(target)?;
        if !entry.children.is_empty() {
            return Err(TreeError::NodeContainsChildren {
                path: entry.path.to_string(),
            });
        }
        Ok(self.detach(target))
    }

    /// Names of the children of `path`.
    pub fn list_children(&self, path: &str) -> Result<BTreeSet<String>, TreeError> {
        let path = TreePath::parse(path)?;
        let id = self.lookup(&path)?;
        Ok(self.live_entry(id)?.children.keys().cloned().collect())
    }

    /// Snapshot of the node at `path`.
    pub fn get_node(&self, path: &str) -> Result<Node, TreeError> {
        let path = TreePath::parse(path)?;
        let id = self.lookup(&path)?;
        self.snapshot(id)
    }

    /// Number of live nodes, root included.
    pub fn len(&self) -> usize {
        self.live
    }

    /// Only the root is present.
    pub fn is_empty(&self) -> bool {
        self.live == 1
    }

    // -------------------------------------------------------------------
    // Crate-internal primitives (selector engine, transform executor)
    // -------------------------------------------------------------------

    pub(crate) fn root_id(&self) -> NodeId {
        self.root
    }

    pub(crate) fn entry(&self, id: NodeId) -> Option<&NodeEntry> {
        self.slots.get(id.0).and_then(|s| s.as_ref())
    }

    fn entry_mut(&mut self, id: NodeId) -> Option<&mut NodeEntry> {
        self.slots.get_mut(id.0).and_then(|s| s.as_mut())
    }

    fn live_entry(&self, id: NodeId) -> Result<&NodeEntry, TreeError> {
        self.entry(id).ok_or_else(|| TreeError::NoSuchNode {
            path: format!("<node {}>", id.0),
        })
    }

    pub(crate) fn contains(&self, id: NodeId) -> bool {
        self.entry(id).is_some()
    }

    /// Resolve a canonical path to its node id.
    pub(crate) fn lookup(&self, path: &TreePath) -> Result<NodeId, TreeError> {
        let mut current = self.root;
        for name in path.components() {
            current = self
                .entry(current)
                .and_then(|e| e.children.get(name).copied())
                .ok_or_else(|| TreeError::NoSuchNode {
                    path: path.to_string(),
                })?;
        }
        Ok(current)
    }

    pub(crate) fn snapshot(&self, id: NodeId) -> Result<Node, TreeError> {
        let e = self.live_entry(id)?;
        Ok(Node {
            path: e.path.to_string(),
            name: e.path.name().map(|s| s.to_string()),
            kind: e.kind.clone(),
            attributes: e.attributes.clone(),
            style: e.style.clone(),
            children: e.children.keys().cloned().collect(),
        })
    }

    /// Summaries from the root down to `id` inclusive.
    pub(crate) fn lineage(&self, id: NodeId) -> Vec<NodeSummary> {
        let mut out = Vec::new();
        let mut cursor = Some(id);
        while let Some(cur) = cursor {
            match self.entry(cur) {
                Some(e) => {
                    out.push(NodeSummary {
                        name: e.path.name().map(|s| s.to_string()),
                        kind: e.kind.clone(),
                        attributes: e.attributes.clone(),
                    });
                    cursor = e.parent;
                }
                None => break,
            }
        }
        out.reverse();
        out
    }

    /// Create a child of `parent` from a descriptor.
    pub(crate) fn insert_child(
        &mut self,
        parent: NodeId,
        descriptor: &NodeDescriptor,
    ) -> Result<Change, TreeError> {
        validate_component(&descriptor.name)?;
        validate_kind(&descriptor.kind)?;
        let parent_entry = self.live_entry(parent)?;
        let path = parent_entry.path.join(&descriptor.name)?;
        if descriptor.attributes.contains_key(NAME_ATTRIBUTE) {
            return Err(TreeError::ImmutableAttribute {
                path: path.to_string(),
                attribute: NAME_ATTRIBUTE.to_string(),
            });
        }
        if parent_entry.children.contains_key(&descriptor.name) {
            return Err(TreeError::NodeAlreadyExists {
                path: path.to_string(),
            });
        }

        let entry = NodeEntry {
            path: path.clone(),
            kind: descriptor.kind.clone(),
            attributes: descriptor.attributes.clone(),
            style: BTreeMap::new(),
            children: BTreeMap::new(),
            parent: Some(parent),
        };
        let id = match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(entry);
                NodeId(slot)
            }
            None => {
                self.slots.push(Some(entry));
                NodeId(self.slots.len() - 1)
            }
        };
        self.live += 1;
        if let Some(p) = self.entry_mut(parent) {
            p.children.insert(descriptor.name.clone(), id);
        }

        Ok(Change {
            path,
            event: ChangeEvent::Created {
                kind: descriptor.kind.clone(),
            },
            lineage: self.lineage(id),
        })
    }

    /// Write one attribute. `name` is read-only.
    pub(crate) fn set_attribute(
        &mut self,
        id: NodeId,
        name: &str,
        value: &str,
    ) -> Result<Change, TreeError> {
        let entry = self
            .entry_mut(id)
            .ok_or_else(|| TreeError::NoSuchNode {
                path: format!("<node {}>", id.0),
            })?;
        if name == NAME_ATTRIBUTE {
            return Err(TreeError::ImmutableAttribute {
                path: entry.path.to_string(),
                attribute: name.to_string(),
            });
        }
        entry.attributes.insert(name.to_string(), value.to_string());
        let path = entry.path.clone();
        Ok(Change {
            path,
            event: ChangeEvent::Attribute {
                name: name.to_string(),
                value: value.to_string(),
            },
            lineage: self.lineage(id),
        })
    }

    /// Write one style property.
    pub(crate) fn set_style(
        &mut self,
        id: NodeId,
        name: &str,
        value: &str,
    ) -> Result<Change, TreeError> {
        let entry = self
            .entry_mut(id)
            .ok_or_else(|| TreeError::NoSuchNode {
                path: format!("<node {}>", id.0),
            })?;
        entry.style.insert(name.to_string(), value.to_string());
        let path = entry.path.clone();
        Ok(Change {
            path,
            event: ChangeEvent::Style {
                name: name.to_string(),
                value: value.to_string(),
            },
            lineage: self.lineage(id),
        })
    }

    /// Remove every descendant of `id`, deepest first.
    pub(crate) fn empty(&mut self, id: NodeId) -> Vec<Change> {
        let mut changes = Vec::new();
        let children: Vec<NodeId> = match self.entry(id) {
            Some(e) => e.children.values().copied().collect(),
            None => return changes,
        };
        for child in children {
            changes.extend(self.empty(child));
            changes.push(self.detach(child));
        }
        changes
    }

    /// Unlink a childless node from its parent and free its slot.
    fn detach(&mut self, id: NodeId) -> Change {
        let lineage = self.lineage(id);
        let entry = self.slots[id.0].take();
        let path = match entry {
            Some(e) => {
                self.live -= 1;
                self.free.push(id.0);
                if let (Some(parent), Some(name)) = (e.parent, e.path.name()) {
                    if let Some(p) = self.entry_mut(parent) {
                        p.children.remove(name);
                    }
                }
                e.path
            }
            None => TreePath::root(),
        };
        Change {
            path,
            event: ChangeEvent::Removed,
            lineage,
        }
    }
}

impl Default for Tree {
    fn default() -> Self {
        Self::new()
    }
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
