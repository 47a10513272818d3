//! Wire protocol.
//!
//! Every frame is `{"token": N, "message": {...}}`. Requests carry a token
//! from the client's per-connection counter and the reply echoes it.
//! Token 0 is reserved for the handshake ping/pong and for pushes, which
//! are routed by subscription id instead of by token.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TreeError;
use crate::namespace::{ChangeEvent, Node};
use crate::query::{QueryResult, QuerySpec};


/// Request/reply correlation id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Token(pub u64);

/// Reserved for the handshake and for unsolicited pushes.
pub const HANDSHAKE_TOKEN: Token = Token(0);

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}


/// One framed message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub token: Token,
    pub message: Message,
}

impl Frame {
    pub fn new(token: Token, message: Message) -> Self {
        Frame { token, message }
    }

    pub fn push(push: Push) -> Self {
        Frame {
            token: HANDSHAKE_TOKEN,
            message: Message::Push(push),
        }
    }
}


/// Everything that can travel inside a [`Frame`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    // --- Handshake ---
    Ping {
        ping: String,
    },
    Pong {
        pong: String,
    },

    // --- Subscriptions ---
    Subscribe {
        target: String,
    },
    Subscribed {
        subscription_id: u64,
        target: String,
    },
    Unsubscribe {
        subscription_id: u64,
    },

    // --- Queries ---
    Query {
        query_group: Vec<QuerySpec>,
    },
    QueryResult {
        results: Vec<Result<QueryResult, TreeError>>,
    },

    // --- Structural operations ---
    CreateChild {
        parent_path: String,
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        kind: Option<String>,
    },
    RemoveChild {
        parent_path: String,
        name: String,
    },
    ListChildren {
        path: String,
    },
    Children {
        children: BTreeSet<String>,
    },
    GetNode {
        path: String,
    },
    Node {
        node: Node,
    },

    // --- Control ---
    Ok,
    Shutdown,
    Error {
        operation: String,
        error: TreeError,
    },
    Push(Push),
}

impl Message {
    /// The `type` tag, for logs and error frames.
    pub fn name(&self) -> &'static str {
        match self {
            Message::Ping { .. } => "ping",
            Message::Pong { .. } => "pong",
            Message::Subscribe { .. } => "subscribe",
            Message::Subscribed { .. } => "subscribed",
            Message::Unsubscribe { .. } => "unsubscribe",
            Message::Query { .. } => "query",
            Message::QueryResult { .. } => "query_result",
            Message::CreateChild { .. } => "create_child",
            Message::RemoveChild { .. } => "remove_child",
            Message::ListChildren { .. } => "list_children",
            Message::Children { .. } => "children",
            Message::GetNode { .. } => "get_node",
            Message::Node { .. } => "node",
            Message::Ok => "ok",
            Message::Shutdown => "shutdown",
            Message::Error { .. } => "error",
            Message::Push(_) => "push",
        }
    }
}


/// Unsolicited notification for one subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Push {
    pub subscription_id: u64,
    pub target: String,
    pub changed_paths: Vec<String>,
    pub context: Vec<ChangeRecord>,
}

/// One change as reported in a push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub path: String,
    #[serde(flatten)]
    pub event: ChangeEvent,
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
