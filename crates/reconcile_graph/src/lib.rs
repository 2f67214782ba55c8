//! # reconcile_graph - key-value dependency graph
//!
//! An in-memory graph of every key-value pair the engine knows about:
//! - Nodes keyed by string, sorted for deterministic traversal
//! - Labelled relations to exact keys or to any-of key selectors
//! - Reverse lookup (which nodes point at a key)
//! - Per-descriptor metadata maps kept in sync with node metadata
//! - Last known flags of removed nodes
//!
//! The graph is generic over the per-node flag payload so the scheduler
//! decides what a node's lifecycle state looks like.
//!
//! ## Example
//!
//! ```ignore
//! use reconcile_graph::prelude::*;
//!
//! let mut graph: Graph<()> = Graph::new();
//! graph.upsert("rule/x");
//! graph.set_targets("rule/x", vec![
//!     RelationTarget::key(Relation::DependsOn, "iface", "iface/a"),
//! ]);
//! assert_eq!(graph.sources("iface/a", Relation::DependsOn).len(), 1);
//! ```

pub mod graph;
pub mod node;

pub use graph::{Graph, TargetNodes};
pub use node::{Node, Relation, RelationTarget};

pub mod prelude {
    pub use crate::graph::{Graph, TargetNodes};
    pub use crate::node::{Node, Relation, RelationTarget};
}
