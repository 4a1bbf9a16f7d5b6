use std::sync::atomic::{AtomicBool, Ordering};

use datafusion_common::{internal_err, Result};
use log::trace;

use crate::function::CopyFunction;
use crate::sink::{FixedBatchCopy, GlobalCopyState};

/// Clears the flushing gate even when the flush loop errors out.
struct ActiveFlushGuard<'a>(&'a AtomicBool);

impl Drop for ActiveFlushGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Hands the in-order prefix of prepared batches to the backend.
///
/// A single gate keeps at most one thread flushing; everyone else returns
/// immediately, which preserves the on-disk order without forming a queue.
/// The backend call runs with no operator lock held.
pub(crate) fn flush_batch_data<F: CopyFunction>(
    op: &FixedBatchCopy<F>,
    gstate: &GlobalCopyState<F>,
) -> Result<()> {
    {
        let _gate = gstate.flush_lock.lock();
        if gstate.any_flushing.swap(true, Ordering::SeqCst) {
            // another thread is draining; order is preserved without us
            return Ok(());
        }
    }
    let _active = ActiveFlushGuard(&gstate.any_flushing);
    loop {
        let prepared = {
            let mut stores = gstate.stores.lock();
            let Some((&batch_index, _)) = stores.prepared.first_key_value() else {
                break;
            };
            let flushed = gstate.flushed_batch_index.load(Ordering::SeqCst);
            if batch_index < flushed {
                return internal_err!(
                    "prepared batch index {batch_index} is below the flushed index {flushed}"
                );
            }
            if batch_index != flushed {
                // the next in-order batch has not been prepared yet
                break;
            }
            let Some(prepared) = stores.prepared.remove(&batch_index) else {
                break;
            };
            trace!("flushing batch {batch_index}");
            prepared
        };
        op.function.flush_batch(&gstate.backend, prepared.data)?;
        gstate
            .unflushed_memory
            .fetch_sub(prepared.memory_usage, Ordering::SeqCst);
        gstate.flushed_batch_index.fetch_add(1, Ordering::SeqCst);
    }
    Ok(())
}
