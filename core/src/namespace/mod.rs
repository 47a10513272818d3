//! Namespace: the hierarchical node tree and its path rules.
//!
//! Provides absolute `/`-delimited addressing (e.g. `/room/kitchen/light`),
//! wildcard path patterns for subscriptions, and the arena-backed [`Tree`].

pub mod path;
pub mod store;

pub use path::{validate_component, PathPattern, PathSegment, TreePath};
pub use store::{
    validate_kind, Change, ChangeEvent, Node, NodeDescriptor, NodeId, NodeSummary, Tree,
    DEFAULT_KIND, NAME_ATTRIBUTE, ROOT_KIND,
};
