use serde::{Deserialize, Serialize};
use std::fmt::{self, Debug, Display};
use std::sync::Arc;

use crate::node_id::NodeId;

/// A node in a sum-product network graph.
pub trait Node: Debug {
    fn id(&self) -> NodeId;
    fn name(&self) -> &str;
}

/// A node whose output is laid out as `[scope, decomp, batch, node]` blocks.
///
/// Layers that consume block-structured children (e.g. [crate::product::BlockPermuteProduct])
/// depend only on this contract, never on a concrete layer type.
pub trait BlockLayer: Node {
    /// Number of disjoint scope slots.
    fn dim_scope(&self) -> usize;
    /// Number of parallel decompositions.
    fn dim_decomps(&self) -> usize;
    /// Number of value-bearing nodes per `(scope, decomp)` slot.
    fn dim_nodes(&self) -> usize;

    fn dims(&self) -> BlockDims {
        BlockDims {
            scope: self.dim_scope(),
            decomps: self.dim_decomps(),
            nodes: self.dim_nodes(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct BlockDims {
    pub scope: usize,
    pub decomps: usize,
    pub nodes: usize,
}

/// An input connected to a node, tagged by whether it satisfies [BlockLayer].
#[derive(Debug, Clone)]
pub enum Input {
    Block(Arc<dyn BlockLayer>),
    Flat(Arc<dyn Node>),
}

impl Display for BlockDims {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[scope={}, decomps={}, nodes={}]",
            self.scope, self.decomps, self.nodes
        )
    }
}
