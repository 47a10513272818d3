//! Selector parsing, matching and the transform pipeline.

pub mod builder;
pub mod engine;
pub mod selector;
pub mod transform;

pub use builder::{property_queries, ClientQuery, Query, QueryGroup, Transforms};
pub use engine::{MatchedNode, QueryResult};
pub use selector::{path_to_query, Facet, Selector};
pub use transform::{CompiledQuery, GroupOutcome, GroupPlan, QuerySpec, RawTransform, Transform};
