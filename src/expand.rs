//! Forward expansion: the log-domain outer product across factors.

use ndarray::{Array4, ArrayD, ArrayView4, Axis, IxDyn};

use crate::block::BlockDims;
use crate::common::LogScalar;
use crate::dims::FactorGeometry;

#[derive(thiserror::Error, Debug)]
pub enum ShapeMismatchError {
    #[error("{tensor} has {actual} entries along its {axis} axis, but {expected} were expected")]
    Axis {
        tensor: &'static str,
        axis: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("Counts have batch size {counts}, but the child log-value has batch size {child}")]
    BatchMismatch { counts: usize, child: usize },
    #[error("Reshape failed: {0}")]
    Reshape(#[from] ndarray::ShapeError),
}

/// Checks a `[scope, decomp, batch, node]` shape against `expected` and returns its batch size.
pub(crate) fn check_block_shape(
    tensor: &'static str,
    shape: &[usize],
    expected: BlockDims,
) -> Result<usize, ShapeMismatchError> {
    debug_assert_eq!(shape.len(), 4);
    for (axis, expected, actual) in [
        ("scope", expected.scope, shape[0]),
        ("decomp", expected.decomps, shape[1]),
        ("node", expected.nodes, shape[3]),
    ] {
        if expected != actual {
            return Err(ShapeMismatchError::Axis {
                tensor,
                axis,
                expected,
                actual,
            });
        }
    }
    Ok(shape[2])
}

/// Computes every combination of one child node per factor, summing their log-values.
///
/// `child_log_value` has the child's shape `[dim_scope * num_factors, dim_decomps, batch,
/// child_nodes]`, where the `num_factors` adjacent scope slots of each output scope slot are the
/// factors. The result has shape `[dim_scope, dim_decomps, batch, child_nodes ^ num_factors]`;
/// output node `Σ_i n_i · child_nodes^(num_factors - 1 - i)` holds `Σ_i log_value_i[n_i]`.
pub fn expand_log_product<T: LogScalar>(
    geom: &FactorGeometry,
    child_log_value: ArrayView4<T>,
) -> Result<Array4<T>, ShapeMismatchError> {
    let batch = check_block_shape("child log-value", child_log_value.shape(), geom.child_dims())?;
    log::debug!(
        "Expanding {:?} into {} factors of {} nodes",
        child_log_value.shape(),
        geom.num_factors,
        geom.child_nodes
    );

    let split = child_log_value.as_standard_layout().into_shape((
        geom.dim_scope,
        geom.num_factors,
        geom.dim_decomps,
        batch,
        geom.child_nodes,
    ))?;

    let mut expanded = ArrayD::<T>::zeros(IxDyn(&geom.expanded_shape(batch)));
    for (factor, log_value) in split.axis_iter(Axis(1)).enumerate() {
        // Move this factor's node axis to trailing position `factor`, with unit axes elsewhere,
        // so that adding it broadcasts across every other factor's choice.
        let mut contribution = log_value.into_dyn();
        for _ in 0..factor {
            contribution.insert_axis_inplace(Axis(3));
        }
        for _ in factor + 1..geom.num_factors {
            contribution.insert_axis_inplace(Axis(contribution.ndim()));
        }
        debug_assert_eq!(
            contribution.shape(),
            geom.factor_broadcast_shape(factor, batch).as_slice()
        );
        expanded += &contribution;
    }

    Ok(expanded.into_shape((geom.dim_scope, geom.dim_decomps, batch, geom.out_nodes()))?)
}
