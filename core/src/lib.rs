//! homedb core: the shared home-automation namespace.
//!
//! Rooms, switches, lights and colors live in one hierarchical node tree
//! that many automation processes query, mutate and watch over a single
//! multiplexed connection each.
//!
//! # Layers
//!
//! | Module | Role |
//! |--------|------|
//! | [`namespace`] | path validation and the arena-backed node tree |
//! | [`query`] | selector parser, matching engine, transform executor, builders |
//! | [`subscription`] | standing interest in paths/selectors, push fan-out |
//! | [`types`] | wire protocol frames and messages |
//! | [`wire`] / [`transport`] | length-prefixed JSON framing over Unix or TCP streams |
//! | [`service`] / [`daemon`] | server side: per-connection dispatch and the accept loop |
//! | [`client`] | token multiplexer with a single receive loop |
//! | [`config`] | YAML settings |

pub mod client;
pub mod config;
pub mod daemon;
pub mod error;
pub mod namespace;
pub mod query;
pub mod service;
pub mod subscription;
pub mod transport;
pub mod types;
pub mod wire;

pub use client::{ReplyHandle, TreeClient};
pub use error::{ClientError, TreeError};
pub use namespace::{Node, Tree, TreePath};
pub use query::{path_to_query, Query, QueryGroup, Selector, Transform, Transforms};
