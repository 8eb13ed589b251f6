//! A minimal indicator leaf layer, producing block-structured one-hot log-values from integer
//! evidence.

use ndarray::{Array2, Array4, ArrayView2, ArrayView4, Axis};

use crate::block::{BlockLayer, Node};
use crate::common::LogScalar;
use crate::expand::{check_block_shape, ShapeMismatchError};
use crate::node_id::NodeId;

#[derive(thiserror::Error, Debug)]
pub enum EvidenceError {
    #[error("Evidence has {actual} variables, but the leaf has {expected}")]
    Shape { expected: usize, actual: usize },
    #[error("Evidence value {value} for variable {var} is outside 0..{num_components}")]
    OutOfRange {
        var: usize,
        value: i64,
        num_components: usize,
    },
}

/// One indicator per component for each of `num_vars` variables, replicated across
/// decompositions. Each variable is its own scope slot.
#[derive(Debug)]
pub struct IndicatorLeaf {
    id: NodeId,
    name: String,
    num_vars: usize,
    num_components: usize,
    num_decomps: usize,
}

impl IndicatorLeaf {
    pub fn new(num_vars: usize, num_components: usize, num_decomps: usize) -> Self {
        IndicatorLeaf {
            id: NodeId::fresh(),
            name: String::from("IndicatorLeaf"),
            num_vars,
            num_components,
            num_decomps,
        }
    }

    /// Computes log-indicators `[num_vars, num_decomps, batch, num_components]` for `evidence`
    /// shaped `[batch, num_vars]`.
    ///
    /// The observed component gets `0` and every other component `-inf`. A negative evidence
    /// value marks the variable as missing: all of its indicators are `0`, marginalizing it out.
    pub fn compute_log_value<T: LogScalar>(
        &self,
        evidence: ArrayView2<i64>,
    ) -> Result<Array4<T>, EvidenceError> {
        let (batch, vars) = evidence.dim();
        if vars != self.num_vars {
            return Err(EvidenceError::Shape {
                expected: self.num_vars,
                actual: vars,
            });
        }
        if let Some(((_, var), &value)) = evidence
            .indexed_iter()
            .find(|(_, &v)| usize::try_from(v).map_or(false, |v| v >= self.num_components))
        {
            return Err(EvidenceError::OutOfRange {
                var,
                value,
                num_components: self.num_components,
            });
        }

        Ok(Array4::from_shape_fn(
            (self.num_vars, self.num_decomps, batch, self.num_components),
            |(var, _, b, component)| {
                let observed = evidence[[b, var]];
                if observed < 0 || observed as usize == component {
                    T::zero()
                } else {
                    T::neg_infinity()
                }
            },
        ))
    }

    /// The component index of every indicator, shaped `[num_vars, num_decomps, batch,
    /// num_components]`.
    pub fn leaf_representation<T: LogScalar>(&self, batch: usize) -> Array4<T> {
        Array4::from_shape_fn(
            (self.num_vars, self.num_decomps, batch, self.num_components),
            |(_, _, _, component)| T::from(component).unwrap_or_else(T::nan),
        )
    }

    /// Reads the most probable state of each variable off backward credit shaped like this
    /// leaf's output. Credit is summed over decompositions; ties go to the lowest component.
    /// Returns states shaped `[batch, num_vars]`.
    pub fn mpe_states<T: LogScalar>(
        &self,
        counts: ArrayView4<T>,
    ) -> Result<Array2<usize>, ShapeMismatchError> {
        let batch = check_block_shape("leaf counts", counts.shape(), self.dims())?;
        let per_var = counts.sum_axis(Axis(1));
        Ok(Array2::from_shape_fn((batch, self.num_vars), |(b, var)| {
            let credit = per_var.slice(ndarray::s![var, b, ..]);
            credit
                .iter()
                .enumerate()
                .fold((0, T::neg_infinity()), |(best, best_credit), (c, &v)| {
                    if v > best_credit {
                        (c, v)
                    } else {
                        (best, best_credit)
                    }
                })
                .0
        }))
    }
}

impl Node for IndicatorLeaf {
    fn id(&self) -> NodeId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl BlockLayer for IndicatorLeaf {
    fn dim_scope(&self) -> usize {
        self.num_vars
    }

    fn dim_decomps(&self) -> usize {
        self.num_decomps
    }

    fn dim_nodes(&self) -> usize {
        self.num_components
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_one_hot_log_values() {
        let leaf = IndicatorLeaf::new(2, 3, 1);
        let evidence = array![[2, 0], [-1, 1]];
        let log_value: Array4<f64> = leaf.compute_log_value(evidence.view()).unwrap();
        let ninf = f64::NEG_INFINITY;
        // [var, decomp, batch, component]
        let expected = Array4::from_shape_vec(
            (2, 1, 2, 3),
            vec![
                ninf, ninf, 0.0, 0.0, 0.0, 0.0, //
                0.0, ninf, ninf, ninf, 0.0, ninf,
            ],
        )
        .unwrap();
        assert_eq!(log_value, expected);
    }

    #[test]
    fn test_log_values_replicate_over_decomps() {
        let leaf = IndicatorLeaf::new(1, 2, 3);
        let log_value: Array4<f32> = leaf.compute_log_value(array![[1]].view()).unwrap();
        assert_eq!(log_value.shape(), &[1, 3, 1, 2]);
        for d in 0..3 {
            assert_eq!(log_value[[0, d, 0, 0]], f32::NEG_INFINITY);
            assert_eq!(log_value[[0, d, 0, 1]], 0.0);
        }
    }

    #[test]
    fn test_evidence_errors() {
        let leaf = IndicatorLeaf::new(2, 2, 1);
        assert!(matches!(
            leaf.compute_log_value::<f64>(array![[0, 1, 1]].view()),
            Err(EvidenceError::Shape {
                expected: 2,
                actual: 3
            })
        ));
        assert!(matches!(
            leaf.compute_log_value::<f64>(array![[0, 2]].view()),
            Err(EvidenceError::OutOfRange {
                var: 1,
                value: 2,
                ..
            })
        ));
    }

    #[test]
    fn test_leaf_representation() {
        let leaf = IndicatorLeaf::new(2, 3, 2);
        let rep: Array4<f32> = leaf.leaf_representation(4);
        assert_eq!(rep.shape(), &[2, 2, 4, 3]);
        assert_eq!(rep[[1, 1, 3, 2]], 2.0);
        assert_eq!(rep[[0, 0, 0, 0]], 0.0);
    }

    #[test]
    fn test_mpe_states_pick_highest_credit() {
        let leaf = IndicatorLeaf::new(2, 3, 2);
        let mut counts = Array4::<f64>::zeros((2, 2, 1, 3));
        counts[[0, 0, 0, 1]] = 1.0;
        counts[[0, 1, 0, 2]] = 0.75;
        counts[[0, 1, 0, 1]] = 0.5;
        counts[[1, 1, 0, 2]] = 2.0;
        let states = leaf.mpe_states(counts.view()).unwrap();
        assert_eq!(states, array![[1, 2]]);
    }
}
