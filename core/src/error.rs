//! Error taxonomy.
//!
//! [`TreeError`] covers everything the store, selector engine and
//! transform executor can reject. It is serializable so the server can
//! return it inside an `error` frame correlated by token, and the client
//! rebuilds the same typed value on its side.
//!
//! [`ClientError`] adds the conditions that only exist on the client's
//! end of a connection: the transport failing and local timeouts.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::protocol::Token;
use crate::wire::WireError;


/// A request the tree (or one of its query layers) refused.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum TreeError {
    /// The path is not absolute, has empty components, or uses `.`/`..`.
    #[error("malformed path '{path}': {reason}")]
    MalformedPath { path: String, reason: String },

    /// A node name is empty, contains `/`, or is `.`/`..`.
    #[error("invalid path component '{component}'")]
    InvalidPathComponent { component: String },

    #[error("no such node: {path}")]
    NoSuchNode { path: String },

    #[error("node already exists: {path}")]
    NodeAlreadyExists { path: String },

    #[error("node contains children: {path}")]
    NodeContainsChildren { path: String },

    #[error("invalid selector '{selector}': {reason}")]
    InvalidSelector { selector: String, reason: String },

    /// Unknown transform method or arguments of the wrong shape.
    #[error("invalid transform '{method}': {reason}")]
    InvalidTransform { method: String, reason: String },

    /// Kinds are `[A-Za-z0-9_-]+` and `root` belongs to the root node alone.
    #[error("invalid node kind '{kind}'")]
    InvalidKind {
        #[serde(rename = "node_kind")]
        kind: String,
    },

    #[error("attribute '{attribute}' of {path} cannot be written")]
    ImmutableAttribute { path: String, attribute: String },

    #[error("no such subscription: {id}")]
    NoSuchSubscription { id: u64 },

    /// The request was well-formed JSON but not something a server accepts.
    #[error("protocol error: {reason}")]
    Protocol { reason: String },
}

impl TreeError {
    /// Stable variant name, used in log lines.
    pub fn name(&self) -> &'static str {
        match self {
            TreeError::MalformedPath { .. } => "MalformedPath",
            TreeError::InvalidPathComponent { .. } => "InvalidPathComponent",
            TreeError::NoSuchNode { .. } => "NoSuchNode",
            TreeError::NodeAlreadyExists { .. } => "NodeAlreadyExists",
            TreeError::NodeContainsChildren { .. } => "NodeContainsChildren",
            TreeError::InvalidSelector { .. } => "InvalidSelector",
            TreeError::InvalidTransform { .. } => "InvalidTransform",
            TreeError::InvalidKind { .. } => "InvalidKind",
            TreeError::ImmutableAttribute { .. } => "ImmutableAttribute",
            TreeError::NoSuchSubscription { .. } => "NoSuchSubscription",
            TreeError::Protocol { .. } => "Protocol",
        }
    }

    pub(crate) fn malformed(path: &str, reason: &str) -> Self {
        TreeError::MalformedPath {
            path: path.to_string(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn selector(selector: &str, reason: impl Into<String>) -> Self {
        TreeError::InvalidSelector {
            selector: selector.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn transform(method: &str, reason: impl Into<String>) -> Self {
        TreeError::InvalidTransform {
            method: method.to_string(),
            reason: reason.into(),
        }
    }
}


/// Failures seen by a [`TreeClient`](crate::client::TreeClient) caller.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Handshake failed, the socket closed, or the receive loop is gone.
    #[error("connection error: {0}")]
    Connection(String),

    /// No reply within the local bound. The server is not told; the token
    /// stays reserved and its late reply is discarded.
    #[error("{operation} (token {token}) timed out after {after:?}")]
    Timeout {
        token: Token,
        operation: &'static str,
        after: Duration,
    },

    /// The server answered with a typed error for this request.
    #[error("{operation} failed: {error}")]
    Tree { operation: String, error: TreeError },

    /// The server answered with a message that does not fit the request.
    #[error("unexpected reply to {operation}: {reply}")]
    Protocol { operation: &'static str, reply: String },
}

impl ClientError {
    /// The remote tree error, if this is one.
    pub fn tree_error(&self) -> Option<&TreeError> {
        match self {
            ClientError::Tree { error, .. } => Some(error),
            _ => None,
        }
    }
}

impl From<WireError> for ClientError {
    fn from(e: WireError) -> Self {
        ClientError::Connection(e.to_string())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tree_error_serializes_with_kind_tag() {
        let err = TreeError::NoSuchNode { path: "/missing".into() };
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("\"kind\":\"NoSuchNode\""));
        let back: TreeError = serde_json::from_str(&json).unwrap();
        assert_eq!(back, err);
    }

    #[test]
    fn invalid_kind_keeps_its_kind_under_another_key() {
        let err = TreeError::InvalidKind { kind: "root".into() };
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"], "InvalidKind");
        assert_eq!(json["node_kind"], "root");
        let back: TreeError = serde_json::from_value(json).unwrap();
        assert_eq!(back, err);
    }

    #[test]
    fn display_carries_context() {
        let err = TreeError::malformed("/../etc", "'..' is not allowed");
        assert_eq!(err.to_string(), "malformed path '/../etc': '..' is not allowed");
        assert_eq!(err.name(), "MalformedPath");
    }

    #[test]
    fn client_error_exposes_tree_error() {
        let err = ClientError::Tree {
            operation: "create_child".into(),
            error: TreeError::NodeAlreadyExists { path: "/a".into() },
        };
        assert!(matches!(
            err.tree_error(),
            Some(TreeError::NodeAlreadyExists { .. })
        ));
        assert!(err.to_string().starts_with("create_child failed"));
    }
}
