//! Backward reduction: redistributes per-combination credit to each factor's child nodes.
//!
//! This is the adjoint of [crate::expand::expand_log_product]. Output node `(n_0, ..., n_k-1)`
//! was a sum of independent per-factor terms, so the credit for factor `i`'s node `n_i` is the
//! total credit over every combination sharing `n_i`. Each unit of parent credit therefore
//! reaches the child once per factor.

use ndarray::{Array4, Array5, ArrayView4, ArrayViewD, Axis, CowArray, Ix4, IxDyn};

use crate::common::LogScalar;
use crate::dims::FactorGeometry;
use crate::expand::{check_block_shape, ShapeMismatchError};

/// Reduces `counts`, shaped `[dim_scope, dim_decomps, batch, child_nodes ^ num_factors]`, to
/// per-factor child credit shaped like the child: `[dim_scope * num_factors, dim_decomps, batch,
/// child_nodes]`.
pub fn reduce_counts<T: LogScalar>(
    geom: &FactorGeometry,
    counts: ArrayView4<T>,
) -> Result<Array4<T>, ShapeMismatchError> {
    let batch = check_block_shape("counts", counts.shape(), geom.out_dims())?;
    log::debug!(
        "Reducing counts {:?} onto {} factors of {} nodes",
        counts.shape(),
        geom.num_factors,
        geom.child_nodes
    );

    let standard = counts.as_standard_layout();
    let expanded = standard
        .view()
        .into_shape(IxDyn(&geom.expanded_shape(batch)))?;

    // [dim_scope, num_factors, dim_decomps, batch, child_nodes], kept in standard layout so the
    // first two axes merge into the child scope axis.
    let mut per_factor = Array5::<T>::zeros((
        geom.dim_scope,
        geom.num_factors,
        geom.dim_decomps,
        batch,
        geom.child_nodes,
    ));
    for factor in 0..geom.num_factors {
        let reduced = reduce_to_factor(expanded.view(), factor, geom.num_factors)?;
        per_factor.index_axis_mut(Axis(1), factor).assign(&reduced);
    }
    Ok(per_factor.into_shape((
        geom.child_scope(),
        geom.dim_decomps,
        batch,
        geom.child_nodes,
    ))?)
}

/// Sums `expanded` over every trailing factor axis except `factor`'s.
fn reduce_to_factor<T: LogScalar>(
    expanded: ArrayViewD<T>,
    factor: usize,
    num_factors: usize,
) -> Result<Array4<T>, ShapeMismatchError> {
    let mut reduced = CowArray::from(expanded);
    // Highest axis first, so lower axis indices stay put.
    for other in (0..num_factors).rev().filter(|&j| j != factor) {
        reduced = CowArray::from(reduced.sum_axis(Axis(3 + other)));
    }
    Ok(reduced.into_owned().into_dimensionality::<Ix4>()?)
}
