use by_address::ByAddress;
use ndarray::Array4;
use std::collections::HashMap;
use std::sync::Arc;

use crate::node_id::NodeId;

/// A shared tensor flowing between nodes during one evaluation pass.
pub type SharedTensor<T> = Arc<Array4<T>>;

/// Memoizes node outputs within a single evaluation (or graph-construction) pass.
///
/// Entries are keyed by the node and by the *identity* of the input tensor, not its contents.
/// Each key holds a clone of its input's [Arc], so an address cannot be recycled for a
/// different tensor while the pass is alive. Create one pass per evaluation and drop it
/// afterwards.
pub struct EvalPass<T> {
    log_values: HashMap<(NodeId, ByAddress<SharedTensor<T>>), SharedTensor<T>>,
    hits: usize,
    misses: usize,
}

impl<T> Default for EvalPass<T> {
    fn default() -> Self {
        EvalPass {
            log_values: HashMap::new(),
            hits: 0,
            misses: 0,
        }
    }
}

impl<T> EvalPass<T> {
    pub fn new() -> Self {
        EvalPass::default()
    }

    /// Returns the memoized log-value of `node` for `input`, computing it with `compute` on a
    /// miss. Errors are not memoized.
    pub fn log_value_or_try_insert<E>(
        &mut self,
        node: NodeId,
        input: &SharedTensor<T>,
        compute: impl FnOnce() -> Result<Array4<T>, E>,
    ) -> Result<SharedTensor<T>, E> {
        let key = (node, ByAddress(Arc::clone(input)));
        if let Some(memoized) = self.log_values.get(&key) {
            self.hits += 1;
            log::trace!("Memo hit for node {}", node);
            return Ok(Arc::clone(memoized));
        }
        self.misses += 1;
        log::trace!("Memo miss for node {}", node);
        let computed = Arc::new(compute()?);
        self.log_values.insert(key, Arc::clone(&computed));
        Ok(computed)
    }

    pub fn hits(&self) -> usize {
        self.hits
    }

    pub fn misses(&self) -> usize {
        self.misses
    }

    pub fn len(&self) -> usize {
        self.log_values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.log_values.is_empty()
    }

    pub fn clear(&mut self) {
        self.log_values.clear();
        self.hits = 0;
        self.misses = 0;
    }
}
