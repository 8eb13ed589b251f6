use ndarray::{Array4, ArrayView4};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::block::{BlockLayer, Input, Node};
use crate::common::{InferenceType, LogScalar};
use crate::dims::{ConfigError, FactorGeometry};
use crate::expand::{check_block_shape, expand_log_product, ShapeMismatchError};
use crate::memo::{EvalPass, SharedTensor};
use crate::node_id::NodeId;
use crate::reduce::reduce_counts;

pub const DEFAULT_NAME: &str = "TensorProduct";
pub const DEFAULT_LAYOUT: &str = "SDBN";

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnsupportedOpError {
    #[error("A product layer binds exactly one child; add_values is not supported")]
    AddValues,
    #[error("Serialization is not supported for product layers")]
    Serialize,
    #[error("Deserialization is not supported for product layers")]
    Deserialize,
    #[error("Input deserialization is not supported for product layers")]
    DeserializeInputs,
    #[error("Scope computation is not supported for product layers")]
    ComputeScope,
    #[error("Validity computation is not supported for product layers")]
    ComputeValid,
}

#[derive(thiserror::Error, Debug)]
pub enum NodeError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(#[from] UnsupportedOpError),
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(#[from] ShapeMismatchError),
}

/// Optional construction parameters of a [BlockPermuteProduct].
///
/// `input_layout` and `output_layout` are opaque tags for the surrounding framework. The
/// product layer itself always works in `[scope, decomp, batch, node]` order.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ProductOptions {
    pub num_decomps: Option<usize>,
    pub num_scopes: Option<usize>,
    pub inference_type: InferenceType,
    pub name: String,
    pub input_layout: String,
    pub output_layout: String,
}

/// The stable construction parameters of a [BlockPermuteProduct], for use by an external
/// registry.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ProductParams {
    pub child: String,
    pub num_factors: usize,
    pub options: ProductOptions,
}

/// Combines `num_factors` adjacent scope slots of one block-structured child by taking the
/// log-domain outer product of their nodes.
///
/// For a child with dimensions `[scope, decomps, nodes]`, the product has
/// `[scope / num_factors, decomps, nodes ^ num_factors]`. All dimensions are derived from the
/// child on demand.
#[derive(Debug)]
pub struct BlockPermuteProduct {
    id: NodeId,
    child: Arc<dyn BlockLayer>,
    num_factors: usize,
    options: ProductOptions,
}

impl Default for ProductOptions {
    fn default() -> Self {
        ProductOptions {
            num_decomps: None,
            num_scopes: None,
            inference_type: InferenceType::default(),
            name: String::from(DEFAULT_NAME),
            input_layout: String::from(DEFAULT_LAYOUT),
            output_layout: String::from(DEFAULT_LAYOUT),
        }
    }
}

impl ProductOptions {
    pub fn num_decomps(mut self, num_decomps: usize) -> Self {
        self.num_decomps = Some(num_decomps);
        self
    }

    pub fn num_scopes(mut self, num_scopes: usize) -> Self {
        self.num_scopes = Some(num_scopes);
        self
    }

    pub fn inference_type(mut self, inference_type: InferenceType) -> Self {
        self.inference_type = inference_type;
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn layouts(
        mut self,
        input_layout: impl Into<String>,
        output_layout: impl Into<String>,
    ) -> Self {
        self.input_layout = input_layout.into();
        self.output_layout = output_layout.into();
        self
    }
}

impl BlockPermuteProduct {
    pub fn new(child: Input, num_factors: usize) -> Result<Self, ConfigError> {
        Self::with_options(child, num_factors, ProductOptions::default())
    }

    pub fn with_options(
        child: Input,
        num_factors: usize,
        options: ProductOptions,
    ) -> Result<Self, ConfigError> {
        let child = Self::validate_child(&[child], num_factors, &options)?;
        let product = BlockPermuteProduct {
            id: NodeId::fresh(),
            child,
            num_factors,
            options,
        };
        log::debug!(
            "Constructed {} {} ({} inference) over '{}' with {} factors: {} -> {}",
            product.options.name,
            product.id,
            product.options.inference_type,
            product.child.name(),
            num_factors,
            product.child.dims(),
            product.dims()
        );
        Ok(product)
    }

    /// Checks that `values` is a single block-structured child compatible with `num_factors` and
    /// any configured metadata.
    fn validate_child(
        values: &[Input],
        num_factors: usize,
        options: &ProductOptions,
    ) -> Result<Arc<dyn BlockLayer>, ConfigError> {
        let child = match values {
            [] => return Err(ConfigError::NoChildren),
            [Input::Block(child)] => child,
            [Input::Flat(other)] => {
                return Err(ConfigError::NotBlockStructured(other.name().to_owned()))
            }
            _ => return Err(ConfigError::MultipleChildren(values.len())),
        };
        let geom = FactorGeometry::derive(child.dims(), num_factors)?;
        for (what, configured, derived) in [
            ("decomposition", options.num_decomps, geom.dim_decomps),
            ("scope", options.num_scopes, geom.dim_scope),
        ] {
            if let Some(configured) = configured {
                if configured != derived {
                    return Err(ConfigError::MetadataMismatch {
                        what,
                        configured,
                        derived,
                    });
                }
            }
        }
        Ok(Arc::clone(child))
    }

    pub fn child(&self) -> &Arc<dyn BlockLayer> {
        &self.child
    }

    pub fn num_factors(&self) -> usize {
        self.num_factors
    }

    pub fn options(&self) -> &ProductOptions {
        &self.options
    }

    pub fn inference_type(&self) -> InferenceType {
        self.options.inference_type
    }

    pub fn set_inference_type(&mut self, inference_type: InferenceType) {
        self.options.inference_type = inference_type;
    }

    pub fn geometry(&self) -> FactorGeometry {
        FactorGeometry::unchecked(self.child.dims(), self.num_factors)
    }

    pub fn params(&self) -> ProductParams {
        ProductParams {
            child: self.child.name().to_owned(),
            num_factors: self.num_factors,
            options: self.options.clone(),
        }
    }

    /// Replaces the child. Exactly one block-structured child compatible with this node's
    /// factor count must be given; on error the current child is kept.
    ///
    /// The node takes a fresh [NodeId], so values memoized for the old child are never served
    /// for the new one.
    pub fn set_values(&mut self, values: &[Input]) -> Result<(), ConfigError> {
        let child = Self::validate_child(values, self.num_factors, &self.options)?;
        let id = NodeId::fresh();
        log::warn!(
            "Replacing child '{}' of {} with '{}' as {}",
            self.child.name(),
            self.id,
            child.name(),
            id
        );
        self.child = child;
        self.id = id;
        Ok(())
    }

    /// Always fails: a product layer never combines more than one child.
    pub fn add_values(&mut self, _values: &[Input]) -> Result<(), UnsupportedOpError> {
        Err(UnsupportedOpError::AddValues)
    }

    /// Computes the product's log-value from the child's log-value, memoized in `pass`.
    pub fn compute_log_value<T: LogScalar>(
        &self,
        pass: &mut EvalPass<T>,
        child_log_value: &SharedTensor<T>,
    ) -> Result<SharedTensor<T>, ShapeMismatchError> {
        let geom = self.geometry();
        pass.log_value_or_try_insert(self.id, child_log_value, || {
            expand_log_product(&geom, child_log_value.view())
        })
    }

    /// Identical to [BlockPermuteProduct::compute_log_value]: a product of independent factors
    /// has no branch to choose. Shares the memo entry, so both return the same tensor.
    pub fn compute_log_mpe_value<T: LogScalar>(
        &self,
        pass: &mut EvalPass<T>,
        child_log_value: &SharedTensor<T>,
    ) -> Result<SharedTensor<T>, ShapeMismatchError> {
        self.compute_log_value(pass, child_log_value)
    }

    /// Computes the value for this node's configured [InferenceType].
    pub fn compute_value<T: LogScalar>(
        &self,
        pass: &mut EvalPass<T>,
        child_log_value: &SharedTensor<T>,
    ) -> Result<SharedTensor<T>, ShapeMismatchError> {
        match self.options.inference_type {
            InferenceType::Marginal => self.compute_log_value(pass, child_log_value),
            InferenceType::Mpe => self.compute_log_mpe_value(pass, child_log_value),
        }
    }

    /// Redistributes per-combination `counts` to the child. When given, `child_log_value` must
    /// have the child's shape and the same batch size as `counts`.
    pub fn compute_log_mpe_path<T: LogScalar>(
        &self,
        counts: ArrayView4<T>,
        child_log_value: Option<ArrayView4<T>>,
    ) -> Result<(Array4<T>,), ShapeMismatchError> {
        let geom = self.geometry();
        if let Some(child_log_value) = child_log_value {
            let child_batch =
                check_block_shape("child log-value", child_log_value.shape(), geom.child_dims())?;
            let counts_batch = counts.shape()[2];
            if child_batch != counts_batch {
                return Err(ShapeMismatchError::BatchMismatch {
                    counts: counts_batch,
                    child: child_batch,
                });
            }
        }
        Ok((reduce_counts(&geom, counts)?,))
    }

    pub fn serialize(&self) -> Result<ProductParams, UnsupportedOpError> {
        Err(UnsupportedOpError::Serialize)
    }

    pub fn deserialize(&mut self, _data: &ProductParams) -> Result<(), UnsupportedOpError> {
        Err(UnsupportedOpError::Deserialize)
    }

    pub fn deserialize_inputs(
        &mut self,
        _data: &ProductParams,
        _nodes_by_name: &[Input],
    ) -> Result<(), UnsupportedOpError> {
        Err(UnsupportedOpError::DeserializeInputs)
    }

    pub fn compute_scope(&self) -> Result<(), UnsupportedOpError> {
        Err(UnsupportedOpError::ComputeScope)
    }

    pub fn compute_valid(&self) -> Result<(), UnsupportedOpError> {
        Err(UnsupportedOpError::ComputeValid)
    }
}

impl Node for BlockPermuteProduct {
    fn id(&self) -> NodeId {
        self.id
    }

    fn name(&self) -> &str {
        &self.options.name
    }
}

impl BlockLayer for BlockPermuteProduct {
    fn dim_scope(&self) -> usize {
        self.child.dim_scope() / self.num_factors
    }

    fn dim_decomps(&self) -> usize {
        self.child.dim_decomps()
    }

    fn dim_nodes(&self) -> usize {
        self.geometry().out_nodes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockDims;
    use crate::expand::tests::block;
    use crate::leaf::IndicatorLeaf;
    use ndarray::{array, Array, Axis};
    use proptest::prelude::*;

    #[derive(Debug)]
    struct FlatNode(NodeId);

    impl Node for FlatNode {
        fn id(&self) -> NodeId {
            self.0
        }

        fn name(&self) -> &str {
            "Concat"
        }
    }

    fn leaf(num_vars: usize, num_components: usize, num_decomps: usize) -> Input {
        Input::Block(Arc::new(IndicatorLeaf::new(
            num_vars,
            num_components,
            num_decomps,
        )))
    }

    fn flat() -> Input {
        Input::Flat(Arc::new(FlatNode(NodeId::fresh())))
    }

    #[test]
    fn test_dims_are_derived_from_child() {
        let product = BlockPermuteProduct::new(leaf(6, 3, 2), 2).unwrap();
        assert_eq!(
            product.dims(),
            BlockDims {
                scope: 3,
                decomps: 2,
                nodes: 9
            }
        );
        assert_eq!(product.num_factors(), 2);
        assert_eq!(product.name(), DEFAULT_NAME);
    }

    #[test]
    fn test_construction_errors() {
        assert!(matches!(
            BlockPermuteProduct::new(leaf(4, 2, 1), 0),
            Err(ConfigError::ZeroFactors)
        ));
        assert!(matches!(
            BlockPermuteProduct::new(leaf(5, 2, 1), 2),
            Err(ConfigError::IndivisibleScope { .. })
        ));
        assert!(matches!(
            BlockPermuteProduct::new(flat(), 1),
            Err(ConfigError::NotBlockStructured(name)) if name == "Concat"
        ));
        assert_eq!(
            BlockPermuteProduct::with_options(
                leaf(4, 2, 3),
                2,
                ProductOptions::default().num_decomps(2)
            )
            .unwrap_err(),
            ConfigError::MetadataMismatch {
                what: "decomposition",
                configured: 2,
                derived: 3
            }
        );
        assert!(BlockPermuteProduct::with_options(
            leaf(4, 2, 3),
            2,
            ProductOptions::default().num_decomps(3).num_scopes(2)
        )
        .is_ok());
    }

    #[test]
    fn test_set_values_requires_exactly_one_block_child() {
        let mut product = BlockPermuteProduct::new(leaf(2, 2, 1), 2).unwrap();
        assert_eq!(product.set_values(&[]), Err(ConfigError::NoChildren));
        assert_eq!(
            product.set_values(&[leaf(2, 2, 1), leaf(2, 2, 1)]),
            Err(ConfigError::MultipleChildren(2))
        );
        assert!(matches!(
            product.set_values(&[flat()]),
            Err(ConfigError::NotBlockStructured(_))
        ));
        assert_eq!(product.dim_nodes(), 4);

        product.set_values(&[leaf(4, 3, 1)]).unwrap();
        assert_eq!(product.dim_nodes(), 9);
        assert_eq!(product.dim_scope(), 2);
    }

    #[test]
    fn test_add_values_is_unsupported() {
        let mut product = BlockPermuteProduct::new(leaf(2, 2, 1), 2).unwrap();
        assert_eq!(
            product.add_values(&[leaf(2, 2, 1)]),
            Err(UnsupportedOpError::AddValues)
        );
        assert_eq!(product.child().dim_nodes(), 2);
    }

    #[test]
    fn test_serialization_and_scope_operations_are_unsupported() {
        let mut product = BlockPermuteProduct::new(leaf(2, 2, 1), 2).unwrap();
        let params = product.params();
        assert_eq!(product.serialize(), Err(UnsupportedOpError::Serialize));
        assert_eq!(
            product.deserialize(&params),
            Err(UnsupportedOpError::Deserialize)
        );
        assert_eq!(
            product.deserialize_inputs(&params, &[]),
            Err(UnsupportedOpError::DeserializeInputs)
        );
        assert_eq!(product.compute_scope(), Err(UnsupportedOpError::ComputeScope));
        assert_eq!(product.compute_valid(), Err(UnsupportedOpError::ComputeValid));
        let unified: NodeError = UnsupportedOpError::ComputeValid.into();
        assert!(matches!(unified, NodeError::UnsupportedOperation(_)));
    }

    #[test]
    fn test_params_round_trip() {
        let options = ProductOptions::default()
            .name("P0")
            .num_scopes(1)
            .inference_type(InferenceType::Mpe)
            .layouts("SDBN", "BSDN");
        let product = BlockPermuteProduct::with_options(leaf(3, 2, 1), 3, options).unwrap();
        let params = product.params();
        assert_eq!(params.child, "IndicatorLeaf");
        assert_eq!(params.num_factors, 3);
        let encoded = bincode::serialize(&params).unwrap();
        let decoded: ProductParams = bincode::deserialize(&encoded).unwrap();
        assert_eq!(decoded, params);
    }

    #[test]
    fn test_value_and_mpe_value_are_memoized_together() {
        let product = BlockPermuteProduct::new(leaf(2, 2, 1), 2).unwrap();
        let mut pass = EvalPass::new();
        let child = Arc::new(block((2, 1, 1, 2), vec![0.5, -1.0, -2.0, 3.0]));
        let value = product.compute_log_value(&mut pass, &child).unwrap();
        let mpe_value = product.compute_log_mpe_value(&mut pass, &child).unwrap();
        assert!(Arc::ptr_eq(&value, &mpe_value));
        assert_eq!(*value, block((1, 1, 1, 4), vec![-1.5, 3.5, -3.0, 2.0]));
        assert_eq!((pass.hits(), pass.misses()), (1, 1));

        // A new pass recomputes.
        let mut next_pass = EvalPass::new();
        let recomputed = product.compute_log_mpe_value(&mut next_pass, &child).unwrap();
        assert!(!Arc::ptr_eq(&value, &recomputed));
        assert_eq!(value, recomputed);
    }

    #[test]
    fn test_rebinding_within_a_pass_recomputes() {
        let mut product = BlockPermuteProduct::new(leaf(2, 2, 1), 2).unwrap();
        let mut pass = EvalPass::<f64>::new();
        let child = Arc::new(Array4::zeros((2, 1, 1, 2)));
        let before = product.id();
        assert_eq!(
            product.compute_log_value(&mut pass, &child).unwrap().shape(),
            &[1, 1, 1, 4]
        );

        product.set_values(&[leaf(2, 3, 1)]).unwrap();
        assert_ne!(product.id(), before);
        assert_eq!(product.dim_nodes(), 9);
        assert!(matches!(
            product.compute_log_value(&mut pass, &child),
            Err(ShapeMismatchError::Axis {
                axis: "node",
                expected: 3,
                actual: 2,
                ..
            })
        ));
        let rebound = Arc::new(Array4::zeros((2, 1, 1, 3)));
        assert_eq!(
            product.compute_log_value(&mut pass, &rebound).unwrap().shape(),
            &[1, 1, 1, 9]
        );
    }

    #[test]
    fn test_failed_rebinding_keeps_identity() {
        let mut product = BlockPermuteProduct::new(leaf(2, 2, 1), 2).unwrap();
        let before = product.id();
        assert!(product.set_values(&[flat()]).is_err());
        assert_eq!(product.id(), before);
    }

    #[test]
    fn test_shape_errors_are_not_memoized() {
        let product = BlockPermuteProduct::new(leaf(2, 2, 1), 2).unwrap();
        let mut pass = EvalPass::<f64>::new();
        let child = Arc::new(Array4::zeros((2, 1, 1, 3)));
        let err = product.compute_log_value(&mut pass, &child).unwrap_err();
        assert!(matches!(err, ShapeMismatchError::Axis { axis: "node", .. }));
        assert!(pass.is_empty());
    }

    #[test]
    fn test_mpe_path_matches_worked_example() {
        let product = BlockPermuteProduct::new(leaf(2, 2, 1), 2).unwrap();
        let counts = block((1, 1, 1, 4), vec![1.0, 2.0, 4.0, 8.0]);
        let (child_counts,) = product.compute_log_mpe_path(counts.view(), None).unwrap();
        assert_eq!(child_counts, block((2, 1, 1, 2), vec![3.0, 12.0, 5.0, 10.0]));
    }

    #[test]
    fn test_mpe_path_checks_child_batch() {
        let product = BlockPermuteProduct::new(leaf(2, 2, 1), 2).unwrap();
        let counts = Array4::<f64>::zeros((1, 1, 3, 4));
        let child = Array4::<f64>::zeros((2, 1, 2, 2));
        assert!(matches!(
            product.compute_log_mpe_path(counts.view(), Some(child.view())),
            Err(ShapeMismatchError::BatchMismatch {
                counts: 3,
                child: 2
            })
        ));
        let child = Array4::<f64>::zeros((2, 1, 3, 2));
        assert!(product
            .compute_log_mpe_path(counts.view(), Some(child.view()))
            .is_ok());
    }

    #[test]
    fn test_stacked_products() {
        // Two product layers over four binary variables: 4 -> 2 scopes of 4 nodes -> 1 scope of
        // 16 nodes, one per joint assignment.
        let indicators = Arc::new(IndicatorLeaf::new(4, 2, 1));
        let lower =
            Arc::new(BlockPermuteProduct::new(Input::Block(indicators.clone()), 2).unwrap());
        let upper = BlockPermuteProduct::new(Input::Block(lower.clone()), 2).unwrap();
        assert_eq!(
            upper.dims(),
            BlockDims {
                scope: 1,
                decomps: 1,
                nodes: 16
            }
        );

        let mut pass = EvalPass::<f64>::new();
        let evidence = array![[1, 0, 1, 1]];
        let leaf_value = Arc::new(indicators.compute_log_value::<f64>(evidence.view()).unwrap());
        let lower_value = lower.compute_log_value(&mut pass, &leaf_value).unwrap();
        let upper_value = upper.compute_log_value(&mut pass, &lower_value).unwrap();
        let (best, _) = upper_value
            .index_axis(Axis(0), 0)
            .iter()
            .enumerate()
            .find(|(_, &v)| v == 0.0)
            .unwrap();
        assert_eq!(best, 0b1011);
        assert_eq!(
            upper_value.iter().filter(|&&v| v == f64::NEG_INFINITY).count(),
            15
        );

        // Route all credit through the MPE node and back down to the leaf.
        let mut counts = Array4::<f64>::zeros(upper_value.raw_dim());
        counts[[0, 0, 0, best]] = 1.0;
        let (lower_counts,) = upper.compute_log_mpe_path(counts.view(), None).unwrap();
        let (leaf_counts,) = lower.compute_log_mpe_path(lower_counts.view(), None).unwrap();
        let states = indicators.mpe_states(leaf_counts.view()).unwrap();
        assert_eq!(states, array![[1, 0, 1, 1]]);
        assert_eq!(leaf_counts.sum(), 4.0);
    }

    proptest! {
        #[test]
        fn test_value_queries_agree_for_every_inference_type(
            inference_type in any::<InferenceType>(),
            num_factors in 1usize..=3,
            batch in 0usize..=3,
        ) {
            let options = ProductOptions::default().inference_type(inference_type);
            let product =
                BlockPermuteProduct::with_options(leaf(num_factors * 2, 2, 2), num_factors, options)
                    .unwrap();
            let child = Arc::new(Array::from_shape_fn(
                (num_factors * 2, 2, batch, 2),
                |(s, d, b, n)| -((s + d + b + n) as f32),
            ));
            let mut pass = EvalPass::new();
            let value = product.compute_value(&mut pass, &child).unwrap();
            let log_value = product.compute_log_value(&mut pass, &child).unwrap();
            let mpe_value = product.compute_log_mpe_value(&mut pass, &child).unwrap();
            prop_assert!(Arc::ptr_eq(&value, &log_value));
            prop_assert!(Arc::ptr_eq(&value, &mpe_value));
            prop_assert_eq!(pass.misses(), 1);
            prop_assert_eq!(value.shape(), &[2, 2, batch, product.dim_nodes()]);
        }
    }
}
