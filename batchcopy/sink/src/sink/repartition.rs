use std::sync::atomic::Ordering;
use std::sync::Arc;

use datafusion_common::Result;
use log::trace;

use crate::collection::BatchCollection;
use crate::function::CopyFunction;
use crate::sink::task::Task;
use crate::sink::{FixedBatchCopy, GlobalCopyState, BATCH_SIZE_TOLERANCE};

/// True when `num_rows` is within one input chunk of the desired batch size.
fn correct_size_for_batch(num_rows: usize, desired: usize) -> bool {
    num_rows.abs_diff(desired) < BATCH_SIZE_TOLERANCE
}

fn queue_prepare<F: CopyFunction>(gstate: &GlobalCopyState<F>, collection: BatchCollection) {
    let batch_index = gstate.scheduled_batch_index.fetch_add(1, Ordering::SeqCst);
    gstate.tasks.push(Task::Prepare {
        batch_index,
        collection,
    });
}

/// Cuts and merges the raw collections below `min_index` into prepare tasks
/// of the desired batch size.
///
/// In the final stage every drained row is forced out, short tail included.
/// Before that, the tail goes back into the raw store under the highest key
/// consumed so later producers can top it up.
pub(crate) fn repartition_batches<F: CopyFunction>(
    op: &FixedBatchCopy<F>,
    gstate: &GlobalCopyState<F>,
    min_index: u64,
    final_stage: bool,
) -> Result<()> {
    let batch_size = gstate.batch_size;
    let mut stores = gstate.stores.lock();
    if stores.raw.is_empty() {
        return Ok(());
    }
    if !final_stage {
        if gstate.any_finished.load(Ordering::SeqCst) {
            // once a producer reached combine, repartitioning here would run
            // a large cut on too few threads; leave the rest to finalize
            return Ok(());
        }
        let candidate_rows: usize = stores
            .raw
            .range(..min_index)
            .map(|(_, collection)| collection.num_rows())
            .sum();
        if candidate_rows < batch_size {
            // not enough material to justify cutting yet
            return Ok(());
        }
    }

    // drain everything below the minimum, remembering the largest drained key
    let drained: Vec<u64> = stores.raw.range(..min_index).map(|(&key, _)| key).collect();
    let mut max_batch_index = 0;
    let mut collections = Vec::with_capacity(drained.len());
    for key in &drained {
        max_batch_index = *key;
        if let Some(collection) = stores.raw.remove(key) {
            collections.push(collection);
        }
    }

    let mut emitted = 0usize;
    let mut current: Option<BatchCollection> = None;
    for source in collections {
        if current.is_none() {
            let num_rows = source.num_rows();
            if correct_size_for_batch(num_rows, batch_size) {
                // close enough to the target already, no copy needed
                queue_prepare(gstate, source);
                emitted += 1;
                continue;
            }
            if num_rows < batch_size {
                // undersized, adopt it as the base to fill up
                current = Some(source);
                continue;
            }
            // oversized, cut it into fresh collections
            current = Some(BatchCollection::new(Arc::clone(&op.schema)));
        }
        let Some(filling) = current.as_mut() else {
            continue;
        };
        for (chunk, bytes) in source.into_sized_chunks() {
            filling.append_sized(chunk, bytes);
            if filling.num_rows() >= batch_size {
                let full =
                    std::mem::replace(filling, BatchCollection::new(Arc::clone(&op.schema)));
                queue_prepare(gstate, full);
                emitted += 1;
            }
        }
    }

    if let Some(tail) = current {
        if !tail.is_empty() {
            if final_stage || correct_size_for_batch(tail.num_rows(), batch_size) {
                queue_prepare(gstate, tail);
                emitted += 1;
            } else {
                // too short for a batch; keep it mergeable with later input
                stores.raw.insert(max_batch_index, tail);
            }
        }
    }
    trace!(
        "repartitioned {} raw batches into {emitted} prepare tasks",
        drained.len()
    );
    Ok(())
}
