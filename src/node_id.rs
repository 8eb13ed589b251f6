use std::fmt::{self, Display};
use std::sync::atomic::{self, AtomicU64};

static NODE_ID_NEXT: AtomicU64 = AtomicU64::new(0);

/// Identifies a graph node. Equal only to itself (or its copies).
///
/// A unique integer is drawn from a process-wide counter for each call to [NodeId::fresh].
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy, PartialOrd, Ord)]
pub struct NodeId(u64);

impl NodeId {
    pub fn fresh() -> Self {
        Self(NODE_ID_NEXT.fetch_add(1, atomic::Ordering::Relaxed))
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}
