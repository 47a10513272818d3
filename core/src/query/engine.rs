//! Selector evaluation against a live tree.
//!
//! One depth-first walk from the root carries the lineage of the current
//! node; every chain of the selector is tested against it. A node that
//! satisfies any chain is collected once, in walk order.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::selector::Selector;
use crate::namespace::store::NodeEntry;
use crate::namespace::{NodeId, Tree};


/// Read-only view of a node in a query result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchedNode {
    pub kind: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub style: BTreeMap<String, String>,
    /// Result of the last `attr`/`css` read on this node, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

/// Path → node for every node a query ended on.
pub type QueryResult = BTreeMap<String, MatchedNode>;


/// Ids of every node matching `selector`, in depth-first order.
pub(crate) fn select(tree: &Tree, selector: &Selector) -> Vec<NodeId> {
    let mut out = Vec::new();
    let mut lineage: Vec<&NodeEntry> = Vec::new();
    walk(tree, tree.root_id(), selector, &mut lineage, &mut out);
    out
}

fn walk<'t>(
    tree: &'t Tree,
    id: NodeId,
    selector: &Selector,
    lineage: &mut Vec<&'t NodeEntry>,
    out: &mut Vec<NodeId>,
) {
    let entry = match tree.entry(id) {
        Some(e) => e,
        None => return,
    };
    lineage.push(entry);
    if selector.matches_lineage(lineage.as_slice()) {
        out.push(id);
    }
    for &child in entry.children.values() {
        walk(tree, child, selector, lineage, out);
    }
    lineage.pop();
}


/// Snapshot the given nodes into a result map, attaching read values.
pub(crate) fn collect(
    tree: &Tree,
    ids: &[NodeId],
    values: &std::collections::HashMap<NodeId, Option<String>>,
) -> QueryResult {
    let mut result = QueryResult::new();
    for &id in ids {
        if let Some(e) = tree.entry(id) {
            result.insert(
                e.path.to_string(),
                MatchedNode {
                    kind: e.kind.clone(),
                    attributes: e.attributes.clone(),
                    style: e.style.clone(),
                    value: values.get(&id).cloned().flatten(),
                },
            );
        }
    }
    result
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use crate::namespace::TreePath;

    fn house() -> Tree {
        let mut tree = Tree::new();
        tree.create_child_of_kind("/", "kitchen", "room").unwrap();
        tree.create_child_of_kind("/", "hall", "room").unwrap();
        tree.create_child_of_kind("/kitchen", "ceiling", "light").unwrap();
        tree.create_child_of_kind("/kitchen", "counter", "light").unwrap();
        tree.create_child_of_kind("/hall", "lamp", "light").unwrap();
        tree.create_child_of_kind("/hall", "box", "fixture").unwrap();
        tree.create_child_of_kind("/hall/box", "bulb", "light").unwrap();
        let id = tree.lookup(&TreePath::parse("/kitchen/ceiling").unwrap()).unwrap();
        tree.set_attribute(id, "on", "1").unwrap();
        tree
    }

    fn paths(tree: &Tree, sel: &str) -> Vec<String> {
        let selector = Selector::parse(sel).unwrap();
        select(tree, &selector)
            .into_iter()
            .map(|id| tree.entry(id).unwrap().path.to_string())
            .collect()
    }

    #[test]
    fn kind_selects_every_depth() {
        let tree = house();
        assert_eq!(
            paths(&tree, "light"),
            vec!["/hall/box/bulb", "/hall/lamp", "/kitchen/ceiling", "/kitchen/counter"]
        );
    }

    #[test]
    fn child_combinator_is_strict() {
        let tree = house();
        assert_eq!(
            paths(&tree, "room > light"),
            vec!["/hall/lamp", "/kitchen/ceiling", "/kitchen/counter"]
        );
    }

    #[test]
    fn attribute_filter() {
        let tree = house();
        assert_eq!(paths(&tree, "light[on=1]"), vec!["/kitchen/ceiling"]);
        assert_eq!(paths(&tree, "*[on]"), vec!["/kitchen/ceiling"]);
    }

    #[test]
    fn alternatives_union_without_duplicates() {
        let tree = house();
        let got = paths(&tree, "[name=lamp], light, fixture");
        assert_eq!(
            got,
            vec![
                "/hall/box",
                "/hall/box/bulb",
                "/hall/lamp",
                "/kitchen/ceiling",
                "/kitchen/counter"
            ]
        );
    }

    #[test]
    fn root_anchor_addresses_one_path() {
        let tree = house();
        let q = super::super::selector::path_to_query("/hall/box").unwrap();
        assert_eq!(paths(&tree, &q), vec!["/hall/box"]);
        assert_eq!(paths(&tree, "root"), vec!["/"]);
    }

    #[test]
    fn no_match_is_empty() {
        let tree = house();
        assert!(paths(&tree, "garage").is_empty());
    }

    #[test]
    fn collect_snapshots_with_values() {
        let tree = house();
        let ids = select(&tree, &Selector::parse("light[on]").unwrap());
        let mut values = HashMap::new();
        values.insert(ids[0], Some("1".to_string()));
        let result = collect(&tree, &ids, &values);
        let node = result.get("/kitchen/ceiling").unwrap();
        assert_eq!(node.kind, "light");
        assert_eq!(node.value.as_deref(), Some("1"));
        assert_eq!(node.attributes.get("on").map(String::as_str), Some("1"));
    }
}
