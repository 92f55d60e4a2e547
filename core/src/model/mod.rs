//! Graph IR: reference-counted nodes, attribute-carrying graphs and the
//! densely indexed read-only view the passes iterate on.

mod graph;
mod indexed;
mod node;

pub use self::graph::{attributes, Graph, GraphAttr};
pub use self::indexed::{IndexedEntry, IndexedGraph, IndexedNode};
pub use self::node::{Node, NodeAttrs, NodeEntry, NodeId, OpParams};

use crate::internal::*;

/// Per-edge type information handed to weight pre-packing callbacks.
#[derive(Debug, Clone, PartialEq, Eq, new)]
pub struct TensorFact {
    pub shape: Shape,
    pub datum_type: DatumType,
}
