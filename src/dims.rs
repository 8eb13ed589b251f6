//! Derives the dimensions of a block permutation product from its child's dimensions.
//!
//! Nothing here is stored on a node: every value is recomputed from the child and the factor
//! count whenever it is needed.

use itertools::repeat_n;
use smallvec::SmallVec;

use crate::block::BlockDims;

/// A shape with a handful of axes, used for the temporary `3 + num_factors`-axis tensors.
pub type AxisShape = SmallVec<[usize; 8]>;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("A product layer needs at least one factor")]
    ZeroFactors,
    #[error("Factor count {0} is too large")]
    TooManyFactors(usize),
    #[error("A product layer needs exactly one child, but none was given")]
    NoChildren,
    #[error("A product layer supports exactly one child, but {0} were given")]
    MultipleChildren(usize),
    #[error("Input '{0}' is not a block-structured layer")]
    NotBlockStructured(String),
    #[error("Child scope count {child_scope} is not divisible by factor count {num_factors}")]
    IndivisibleScope {
        child_scope: usize,
        num_factors: usize,
    },
    #[error("{child_nodes}^{num_factors} output nodes overflows usize")]
    NodeCountOverflow {
        child_nodes: usize,
        num_factors: usize,
    },
    #[error("Configured {what} count {configured} does not match derived count {derived}")]
    MetadataMismatch {
        what: &'static str,
        configured: usize,
        derived: usize,
    },
}

/// The index algebra relating a child's `[scope, decomp, batch, node]` tensor to the product
/// layer's output.
///
/// The child's scope axis is split into `[dim_scope, num_factors]` (scope-major), and each
/// output node is one combination of child nodes, one per factor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FactorGeometry {
    pub dim_scope: usize,
    pub num_factors: usize,
    pub dim_decomps: usize,
    pub child_nodes: usize,
}

impl FactorGeometry {
    /// Validates `num_factors` against the child's dimensions and derives the geometry.
    pub fn derive(child: BlockDims, num_factors: usize) -> Result<Self, ConfigError> {
        if num_factors == 0 {
            return Err(ConfigError::ZeroFactors);
        }
        let exponent =
            u32::try_from(num_factors).map_err(|_| ConfigError::TooManyFactors(num_factors))?;
        if child.scope % num_factors != 0 {
            return Err(ConfigError::IndivisibleScope {
                child_scope: child.scope,
                num_factors,
            });
        }
        if child.nodes.checked_pow(exponent).is_none() {
            return Err(ConfigError::NodeCountOverflow {
                child_nodes: child.nodes,
                num_factors,
            });
        }
        Ok(Self::unchecked(child, num_factors))
    }

    /// Derives the geometry without validation. `child` and `num_factors` must already have
    /// passed [FactorGeometry::derive].
    pub(crate) fn unchecked(child: BlockDims, num_factors: usize) -> Self {
        FactorGeometry {
            dim_scope: child.scope / num_factors,
            num_factors,
            dim_decomps: child.decomps,
            child_nodes: child.nodes,
        }
    }

    pub fn child_scope(&self) -> usize {
        self.dim_scope * self.num_factors
    }

    /// `child_nodes ^ num_factors`
    pub fn out_nodes(&self) -> usize {
        self.child_nodes.pow(self.num_factors as u32)
    }

    pub fn out_dims(&self) -> BlockDims {
        BlockDims {
            scope: self.dim_scope,
            decomps: self.dim_decomps,
            nodes: self.out_nodes(),
        }
    }

    pub fn child_dims(&self) -> BlockDims {
        BlockDims {
            scope: self.child_scope(),
            decomps: self.dim_decomps,
            nodes: self.child_nodes,
        }
    }

    /// The shape `[dim_scope, dim_decomps, batch, child_nodes, ..., child_nodes]` with one
    /// trailing axis per factor.
    pub fn expanded_shape(&self, batch: usize) -> AxisShape {
        let mut shape = AxisShape::with_capacity(3 + self.num_factors);
        shape.extend_from_slice(&[self.dim_scope, self.dim_decomps, batch]);
        shape.extend(repeat_n(self.child_nodes, self.num_factors));
        shape
    }

    /// The shape of factor `factor`'s contribution before broadcasting: like
    /// [FactorGeometry::expanded_shape], but every trailing axis except `factor`'s is 1.
    pub fn factor_broadcast_shape(&self, factor: usize, batch: usize) -> AxisShape {
        let mut shape = AxisShape::with_capacity(3 + self.num_factors);
        shape.extend_from_slice(&[self.dim_scope, self.dim_decomps, batch]);
        shape.extend((0..self.num_factors).map(|j| {
            if j == factor {
                self.child_nodes
            } else {
                1
            }
        }));
        shape
    }

    /// Flattens one child node index per factor into an output node index. Factor 0 varies
    /// slowest.
    pub fn combination_index(&self, combination: &[usize]) -> usize {
        debug_assert_eq!(combination.len(), self.num_factors);
        combination.iter().fold(0, |acc, &n| {
            debug_assert!(n < self.child_nodes);
            acc * self.child_nodes + n
        })
    }

    /// Inverse of [FactorGeometry::combination_index].
    pub fn combination_of(&self, mut index: usize) -> AxisShape {
        debug_assert!(index < self.out_nodes());
        let mut combination = AxisShape::from_elem(0, self.num_factors);
        for slot in combination.iter_mut().rev() {
            *slot = index % self.child_nodes;
            index /= self.child_nodes;
        }
        combination
    }
}
