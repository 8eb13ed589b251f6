//! Block-structured product layers for sum-product networks.
//!
//! The central piece is [product::BlockPermuteProduct], which combines `num_factors` adjacent
//! scope slots of a block-structured child layer by taking the log-domain outer product of their
//! node values, and which redistributes per-combination credit back to the child during MPE
//! (most-probable-explanation) backward passes.

pub mod block;
pub mod common;
pub mod dims;
pub mod expand;
pub mod leaf;
pub mod memo;
pub mod node_id;
pub mod product;
pub mod reduce;

pub use block::{BlockDims, BlockLayer, Input, Node};
pub use common::{InferenceType, LogScalar};
pub use memo::EvalPass;
pub use product::{BlockPermuteProduct, NodeError, ProductOptions, ProductParams};
