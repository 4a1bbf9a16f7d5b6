use std::path::Path;

use datafusion_common::Result;

use crate::collection::BatchCollection;

/// The copy backend. It owns the bytes on disk; the operator owns ordering
/// and memory.
///
/// `prepare_batch` may run on any number of worker threads concurrently.
/// `flush_batch` is invoked exactly once per prepared batch, in strictly
/// increasing batch order starting at zero, and never under an operator
/// lock. It may block on I/O.
pub trait CopyFunction: Send + Sync {
    type GlobalState: Send + Sync;
    type LocalState: Send;
    type Prepared: Send;

    fn init_global(&self, path: &Path) -> Result<Self::GlobalState>;

    fn init_local(&self) -> Result<Self::LocalState>;

    /// Target row count per output batch. Must be positive.
    fn desired_batch_size(&self) -> usize;

    /// Turns a repartitioned collection into an artifact ready to be
    /// serialized.
    fn prepare_batch(
        &self,
        global: &Self::GlobalState,
        collection: BatchCollection,
    ) -> Result<Self::Prepared>;

    /// Writes a prepared artifact. Calls arrive in batch order.
    fn flush_batch(&self, global: &Self::GlobalState, prepared: Self::Prepared) -> Result<()>;

    /// Called exactly once, after every batch has been flushed.
    fn finalize(&self, _global: &Self::GlobalState) -> Result<()> {
        Ok(())
    }
}

/// Planner-supplied batch identifiers for the producing thread.
#[derive(Debug, Clone, Copy)]
pub struct PartitionInfo {
    /// Identifier of the batch currently being produced. Unique per raw
    /// batch submitted to the sink.
    pub batch_index: u64,
    /// Monotonic lower bound of the batch index across all live producers.
    pub min_batch_index: u64,
}

impl PartitionInfo {
    pub fn new(batch_index: u64, min_batch_index: u64) -> Self {
        Self {
            batch_index,
            min_batch_index,
        }
    }
}
