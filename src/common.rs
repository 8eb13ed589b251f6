use num_traits::Float;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Debug, Display};
use std::ops::AddAssign;

/// Element type of log-domain value and credit tensors.
pub trait LogScalar: Float + AddAssign + Debug + Send + Sync + 'static {}

impl<T: Float + AddAssign + Debug + Send + Sync + 'static> LogScalar for T {}

/// The preferred inference type of a node, used when building value computations.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub enum InferenceType {
    #[default]
    Marginal,
    Mpe,
}

impl Display for InferenceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InferenceType::Marginal => write!(f, "marginal"),
            InferenceType::Mpe => write!(f, "mpe"),
        }
    }
}
