//! The fixed batch copy operator: per-thread sink state machine, memory
//! backpressure, and the finalize drain.

mod flush;
mod memory;
mod repartition;
mod task;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use arrow::array::{ArrayRef, Int64Array, RecordBatch};
use arrow_schema::{DataType, Field, Schema, SchemaRef};
use datafusion_common::{internal_err, Result};
use datafusion_execution::TaskContext;
use log::debug;
use parking_lot::Mutex;

use crate::collection::BatchCollection;
use crate::function::{CopyFunction, PartitionInfo};
use crate::interrupt::{BlockedSet, InterruptState};
use crate::sink::memory::MemoryBudget;
use crate::sink::task::{Task, TaskQueue};

/// We need at least 4MiB of buffer space per column per thread we launch.
const MINIMUM_MEMORY_PER_COLUMN_PER_THREAD: usize = 4 * 1024 * 1024;

/// Emitted batches may be off from the desired size by less than one input
/// chunk's worth of rows.
pub const BATCH_SIZE_TOLERANCE: usize = 2048;

/// Outcome of a [`FixedBatchCopy::sink`] call.
#[derive(Debug)]
pub enum SinkResult {
    /// The chunk was buffered; send the next one.
    NeedMoreInput,
    /// Out of memory and not the minimum batch index. The producer left its
    /// interrupt handle behind and must re-submit the same chunk once woken.
    Blocked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SinkPhase {
    SinkingData,
    ProcessingTasks,
}

/// A copy-to-file operator that writes its input as same-sized batches in
/// strict batch-index order, no matter how many threads produce or prepare
/// them.
pub struct FixedBatchCopy<F: CopyFunction> {
    function: F,
    schema: SchemaRef,
    file_path: PathBuf,
    use_tmp_file: bool,
}

pub(crate) struct PreparedBatch<P> {
    pub(crate) memory_usage: usize,
    pub(crate) data: P,
}

pub(crate) struct BatchStores<P> {
    /// Producer collections awaiting repartition, by batch index.
    pub(crate) raw: BTreeMap<u64, BatchCollection>,
    /// Backend-prepared artifacts awaiting flush, by batch index.
    pub(crate) prepared: BTreeMap<u64, PreparedBatch<P>>,
}

impl<P> Default for BatchStores<P> {
    fn default() -> Self {
        Self {
            raw: BTreeMap::new(),
            prepared: BTreeMap::new(),
        }
    }
}

struct Backpressure {
    blocked: BlockedSet,
    budget: MemoryBudget,
}

/// Shared sink state.
///
/// Lock order: `stores` before `backpressure`; `flush_lock` is never taken
/// while `stores` is held; the task queue's own mutex is a leaf. No lock is
/// held across a backend call.
pub struct GlobalCopyState<F: CopyFunction> {
    backend: F::GlobalState,
    batch_size: usize,
    minimum_memory_per_thread: usize,
    rows_copied: AtomicU64,
    stores: Mutex<BatchStores<F::Prepared>>,
    tasks: TaskQueue,
    /// The latest batch index that has been handed to a prepare task.
    scheduled_batch_index: AtomicU64,
    /// The next batch index the flusher will write.
    flushed_batch_index: AtomicU64,
    any_flushing: AtomicBool,
    any_finished: AtomicBool,
    finalized: AtomicBool,
    /// Bytes buffered in raw collections and prepared artifacts.
    unflushed_memory: AtomicUsize,
    min_batch_index: AtomicU64,
    /// Mirror of the granted memory budget, for lock-free pressure checks.
    available_memory: AtomicUsize,
    flush_lock: Mutex<()>,
    backpressure: Mutex<Backpressure>,
}

impl<F: CopyFunction> GlobalCopyState<F> {
    fn add_raw_batch(&self, batch_index: u64, collection: BatchCollection) -> Result<()> {
        let mut stores = self.stores.lock();
        if stores.raw.insert(batch_index, collection).is_some() {
            return internal_err!(
                "duplicate batch index {batch_index} encountered in fixed batch copy"
            );
        }
        Ok(())
    }

    fn add_prepared_batch(
        &self,
        batch_index: u64,
        data: F::Prepared,
        memory_usage: usize,
    ) -> Result<()> {
        let mut stores = self.stores.lock();
        let prepared = PreparedBatch { memory_usage, data };
        if stores.prepared.insert(batch_index, prepared).is_some() {
            return internal_err!(
                "duplicate prepared batch index {batch_index} encountered in fixed batch copy"
            );
        }
        Ok(())
    }

    /// Whether buffering another chunk would exceed the granted budget.
    ///
    /// The minimum batch index never reports pressure: it is the one making
    /// progress. Everyone else first tries to double the budget.
    fn out_of_memory(&self, batch_index: u64) -> bool {
        if cfg!(feature = "alternative-verify") {
            return true;
        }
        if self.unflushed_memory.load(Ordering::SeqCst)
            >= self.available_memory.load(Ordering::SeqCst)
        {
            let mut backpressure = self.backpressure.lock();
            if batch_index > self.min_batch_index.load(Ordering::SeqCst) {
                backpressure.budget.grow(&self.available_memory);
                if self.unflushed_memory.load(Ordering::SeqCst)
                    >= self.available_memory.load(Ordering::SeqCst)
                {
                    return true;
                }
            }
        }
        false
    }

    /// Advances the minimum batch index and wakes all suspended producers if
    /// it moved.
    fn update_min_batch_index(&self, candidate: u64) {
        if self.min_batch_index.load(Ordering::SeqCst) >= candidate {
            return;
        }
        let mut backpressure = self.backpressure.lock();
        let current = self.min_batch_index.load(Ordering::SeqCst);
        let advanced = current.max(candidate);
        if advanced != current {
            self.min_batch_index.store(advanced, Ordering::SeqCst);
            backpressure.blocked.wake_all();
        }
    }

    fn unblock_tasks(&self) -> bool {
        self.backpressure.lock().blocked.wake_all()
    }
}

/// Per-producer sink state.
pub struct LocalCopyState<F: CopyFunction> {
    backend: F::LocalState,
    collection: Option<BatchCollection>,
    batch_index: Option<u64>,
    rows_copied: u64,
    local_memory_usage: usize,
    phase: SinkPhase,
}

impl<F: CopyFunction> LocalCopyState<F> {
    /// The backend's per-producer state.
    pub fn backend_mut(&mut self) -> &mut F::LocalState {
        &mut self.backend
    }

    fn initialize_collection(&mut self, schema: SchemaRef, batch_index: u64) {
        self.collection = Some(BatchCollection::new(schema));
        self.batch_index = Some(batch_index);
        self.local_memory_usage = 0;
    }

    /// Takes the current collection if it holds any rows.
    fn take_collection(&mut self) -> Option<BatchCollection> {
        match self.collection.take() {
            Some(collection) if !collection.is_empty() => Some(collection),
            _ => None,
        }
    }
}

impl<F: CopyFunction> FixedBatchCopy<F> {
    pub fn try_new(
        schema: SchemaRef,
        function: F,
        file_path: impl Into<PathBuf>,
        use_tmp_file: bool,
    ) -> Result<Self> {
        if function.desired_batch_size() == 0 {
            return internal_err!("fixed batch copy requires a positive desired batch size");
        }
        Ok(Self {
            function,
            schema,
            file_path: file_path.into(),
            use_tmp_file,
        })
    }

    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    /// The path being written to; differs from the target path while a
    /// temporary destination is in use.
    pub fn write_path(&self) -> PathBuf {
        if self.use_tmp_file {
            tmp_path(&self.file_path)
        } else {
            self.file_path.clone()
        }
    }

    pub fn global_state(&self, context: &Arc<TaskContext>) -> Result<GlobalCopyState<F>> {
        let backend = self.function.init_global(&self.write_path())?;
        let minimum_memory_per_thread =
            MINIMUM_MEMORY_PER_COLUMN_PER_THREAD * self.schema.fields().len().max(1);
        let mut budget = MemoryBudget::register("FixedBatchCopy", context.memory_pool());
        let available_memory = AtomicUsize::new(0);
        budget.reserve(minimum_memory_per_thread, &available_memory);
        Ok(GlobalCopyState {
            backend,
            batch_size: self.function.desired_batch_size(),
            minimum_memory_per_thread,
            rows_copied: AtomicU64::new(0),
            stores: Mutex::new(BatchStores::default()),
            tasks: TaskQueue::default(),
            scheduled_batch_index: AtomicU64::new(0),
            flushed_batch_index: AtomicU64::new(0),
            any_flushing: AtomicBool::new(false),
            any_finished: AtomicBool::new(false),
            finalized: AtomicBool::new(false),
            unflushed_memory: AtomicUsize::new(0),
            min_batch_index: AtomicU64::new(0),
            available_memory,
            flush_lock: Mutex::new(()),
            backpressure: Mutex::new(Backpressure {
                blocked: BlockedSet::default(),
                budget,
            }),
        })
    }

    pub fn local_state(&self) -> Result<LocalCopyState<F>> {
        Ok(LocalCopyState {
            backend: self.function.init_local()?,
            collection: None,
            batch_index: None,
            rows_copied: 0,
            local_memory_usage: 0,
            phase: SinkPhase::SinkingData,
        })
    }

    /// Buffers one chunk for the producer's current batch.
    ///
    /// Returns [`SinkResult::Blocked`] when the producer is over budget and
    /// not working on the minimum batch index; the producer must then wait on
    /// its interrupt handle and re-submit the same chunk.
    pub fn sink(
        &self,
        gstate: &GlobalCopyState<F>,
        lstate: &mut LocalCopyState<F>,
        chunk: RecordBatch,
        info: &PartitionInfo,
        interrupt: &InterruptState,
    ) -> Result<SinkResult> {
        let batch_index = info.batch_index;
        loop {
            match lstate.phase {
                SinkPhase::ProcessingTasks => {
                    // help with queued work before buffering more rows
                    self.execute_tasks(gstate)?;
                    flush::flush_batch_data(self, gstate)?;
                    if batch_index > gstate.min_batch_index.load(Ordering::SeqCst)
                        && gstate.out_of_memory(batch_index)
                    {
                        let mut backpressure = gstate.backpressure.lock();
                        if batch_index > gstate.min_batch_index.load(Ordering::SeqCst) {
                            // no tasks left, no memory to buffer, and not the
                            // minimum batch index: park the producer
                            backpressure.blocked.push(interrupt.clone());
                            return Ok(SinkResult::Blocked);
                        }
                    }
                    lstate.phase = SinkPhase::SinkingData;
                }
                SinkPhase::SinkingData => {
                    if batch_index > gstate.min_batch_index.load(Ordering::SeqCst) {
                        gstate.update_min_batch_index(info.min_batch_index);
                        if gstate.out_of_memory(batch_index) {
                            // stop buffering and assist with the minimum
                            // batch's tasks instead
                            lstate.phase = SinkPhase::ProcessingTasks;
                            continue;
                        }
                    }
                    break;
                }
            }
        }
        if lstate.collection.is_none() {
            lstate.initialize_collection(Arc::clone(&self.schema), batch_index);
        }
        lstate.rows_copied += chunk.num_rows() as u64;
        let Some(collection) = lstate.collection.as_mut() else {
            return internal_err!("fixed batch copy collection missing after initialization");
        };
        collection.append(chunk);
        let new_memory_usage = collection.size_in_bytes();
        if new_memory_usage > lstate.local_memory_usage {
            gstate
                .unflushed_memory
                .fetch_add(new_memory_usage - lstate.local_memory_usage, Ordering::SeqCst);
        } else if new_memory_usage < lstate.local_memory_usage {
            return internal_err!("fixed batch copy memory usage decreased on append");
        }
        lstate.local_memory_usage = new_memory_usage;
        Ok(SinkResult::NeedMoreInput)
    }

    /// Closes the producer's current batch and switches it to
    /// `info.batch_index`.
    pub fn next_batch(
        &self,
        gstate: &GlobalCopyState<F>,
        lstate: &mut LocalCopyState<F>,
        info: &PartitionInfo,
    ) -> Result<()> {
        if let Some(collection) = lstate.take_collection() {
            let Some(batch_index) = lstate.batch_index else {
                return internal_err!("fixed batch copy collection without a batch index");
            };
            // hand the finished batch over and cut it to size
            gstate.add_raw_batch(batch_index, collection)?;
            repartition::repartition_batches(self, gstate, info.min_batch_index, false)?;
            // suspended producers can pick the new tasks up; if there are
            // none, make progress here so the pipeline never stalls
            let any_unblocked = gstate.unblock_tasks();
            if !any_unblocked {
                self.execute_task(gstate)?;
                flush::flush_batch_data(self, gstate)?;
            }
        }
        gstate.update_min_batch_index(info.min_batch_index);
        lstate.initialize_collection(Arc::clone(&self.schema), info.batch_index);
        Ok(())
    }

    /// Called once per producer after its final chunk.
    pub fn combine(
        &self,
        gstate: &GlobalCopyState<F>,
        lstate: &mut LocalCopyState<F>,
        info: &PartitionInfo,
    ) -> Result<()> {
        // rows sunk after the last batch boundary still have to reach the
        // file, whether or not the executor issued a trailing next_batch
        if let Some(collection) = lstate.take_collection() {
            let Some(batch_index) = lstate.batch_index else {
                return internal_err!("fixed batch copy collection without a batch index");
            };
            gstate.add_raw_batch(batch_index, collection)?;
        }
        gstate
            .rows_copied
            .fetch_add(lstate.rows_copied, Ordering::SeqCst);
        gstate.any_finished.store(true, Ordering::SeqCst);
        gstate.update_min_batch_index(info.min_batch_index);
        self.execute_tasks(gstate)?;
        Ok(())
    }

    /// Drains every residual raw batch and prepared artifact, then runs the
    /// backend's finalize hook and, for temporary destinations, renames the
    /// file into place.
    ///
    /// `num_threads` bounds the workers used to drain a long task backlog.
    pub fn finalize(&self, gstate: &GlobalCopyState<F>, num_threads: usize) -> Result<()> {
        if gstate.finalized.swap(true, Ordering::SeqCst) {
            return internal_err!("fixed batch copy finalized twice");
        }
        // force every remaining raw batch into a prepare task
        repartition::repartition_batches(self, gstate, u64::MAX, true)?;
        let queued = gstate.tasks.len();
        debug!("finalizing fixed batch copy with {queued} queued tasks");
        if queued <= 1 {
            self.execute_tasks(gstate)?;
            return self.final_flush(gstate);
        }
        let workers = num_threads.max(1);
        let results: Vec<Result<()>> = thread::scope(|scope| {
            let handles: Vec<_> = (0..workers)
                .map(|_| {
                    scope.spawn(|| -> Result<()> {
                        while self.execute_task(gstate)? {
                            flush::flush_batch_data(self, gstate)?;
                        }
                        Ok(())
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| match handle.join() {
                    Ok(result) => result,
                    Err(_) => internal_err!("fixed batch copy finalize worker panicked"),
                })
                .collect()
        });
        results.into_iter().collect::<Result<()>>()?;
        self.final_flush(gstate)
    }

    fn final_flush(&self, gstate: &GlobalCopyState<F>) -> Result<()> {
        if gstate.tasks.len() != 0 {
            return internal_err!("unexecuted tasks remain at fixed batch copy final flush");
        }
        flush::flush_batch_data(self, gstate)?;
        let scheduled = gstate.scheduled_batch_index.load(Ordering::SeqCst);
        let flushed = gstate.flushed_batch_index.load(Ordering::SeqCst);
        if scheduled != flushed {
            return internal_err!(
                "not all batches were flushed to disk ({flushed} of {scheduled}), incomplete file"
            );
        }
        self.function.finalize(&gstate.backend)?;
        if self.use_tmp_file {
            std::fs::rename(self.write_path(), &self.file_path)?;
        }
        Ok(())
    }

    /// Caps the producer thread count so each admitted thread has buffer
    /// room to work with.
    pub fn max_threads(&self, gstate: &GlobalCopyState<F>, source_max_threads: usize) -> usize {
        {
            let mut backpressure = gstate.backpressure.lock();
            backpressure.budget.reserve(
                source_max_threads.saturating_mul(gstate.minimum_memory_per_thread),
                &gstate.available_memory,
            );
        }
        let available = gstate.available_memory.load(Ordering::SeqCst);
        source_max_threads.min(available / gstate.minimum_memory_per_thread + 1)
    }

    /// Total rows appended across all producers.
    pub fn rows_copied(&self, gstate: &GlobalCopyState<F>) -> u64 {
        gstate.rows_copied.load(Ordering::SeqCst)
    }

    /// The operator's output: a single-row `count` batch. Callers that need
    /// the value to reflect a committed file read it after [`Self::finalize`]
    /// returns.
    pub fn copied_rows_batch(&self, gstate: &GlobalCopyState<F>) -> Result<RecordBatch> {
        let schema = Arc::new(Schema::new(vec![Field::new(
            "count",
            DataType::Int64,
            false,
        )]));
        let count = Int64Array::from(vec![self.rows_copied(gstate) as i64]);
        Ok(RecordBatch::try_new(schema, vec![Arc::new(count) as ArrayRef])?)
    }

    fn execute_task(&self, gstate: &GlobalCopyState<F>) -> Result<bool> {
        let Some(task) = gstate.tasks.pop() else {
            return Ok(false);
        };
        match task {
            Task::Prepare {
                batch_index,
                collection,
            } => {
                let memory_usage = collection.size_in_bytes();
                let prepared = self.function.prepare_batch(&gstate.backend, collection)?;
                gstate.add_prepared_batch(batch_index, prepared, memory_usage)?;
                if batch_index == gstate.flushed_batch_index.load(Ordering::SeqCst) {
                    // the flusher may have given up just before this batch
                    // landed; make sure somebody comes back for it
                    gstate.tasks.push(Task::Flush);
                }
            }
            Task::Flush => flush::flush_batch_data(self, gstate)?,
        }
        Ok(true)
    }

    fn execute_tasks(&self, gstate: &GlobalCopyState<F>) -> Result<()> {
        while self.execute_task(gstate)? {}
        Ok(())
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}
