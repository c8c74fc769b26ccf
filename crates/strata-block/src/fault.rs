//! Fault injection for block rewrites.
//!
//! Production code passes [`NoFaults`]. Test harnesses supply their own
//! injector to interrupt a split or compaction part way through;
//! [`FailAfter`] is available under the `fault-injection` feature.

#[cfg(any(test, feature = "fault-injection"))]
use std::sync::atomic::{AtomicUsize, Ordering};

#[cfg(any(test, feature = "fault-injection"))]
use crate::error::BlockError;
use crate::error::BlockResult;

/// Consulted before every header entry written during a split or compaction.
pub trait FaultInjector: Send + Sync {
    /// `written` is the number of header entries already written by this rewrite.
    fn before_header_write(&self, written: usize) -> BlockResult<()>;
}

/// Never injects a fault.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoFaults;

impl FaultInjector for NoFaults {
    fn before_header_write(&self, _written: usize) -> BlockResult<()> {
        Ok(())
    }
}

/// Fails the rewrite once `limit` header entries have been written.
#[cfg(any(test, feature = "fault-injection"))]
#[derive(Debug)]
pub struct FailAfter {
    limit: usize,
    triggered: AtomicUsize,
}

#[cfg(any(test, feature = "fault-injection"))]
impl FailAfter {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            triggered: AtomicUsize::new(0),
        }
    }

    /// How many times this injector has fired.
    pub fn triggered(&self) -> usize {
        self.triggered.load(Ordering::SeqCst)
    }
}

#[cfg(any(test, feature = "fault-injection"))]
impl FaultInjector for FailAfter {
    fn before_header_write(&self, written: usize) -> BlockResult<()> {
        if written >= self.limit {
            self.triggered.fetch_add(1, Ordering::SeqCst);
            return Err(BlockError::MergeFailure(format!(
                "injected failure after {written} header writes"
            )));
        }
        Ok(())
    }
}
