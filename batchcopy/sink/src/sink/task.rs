use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::collection::BatchCollection;

/// A deferred unit of work. The set is closed, so an enum rather than
/// dynamic dispatch.
pub(crate) enum Task {
    /// Run the backend's `prepare_batch` over a repartitioned collection.
    Prepare {
        batch_index: u64,
        collection: BatchCollection,
    },
    /// Drive the in-order flush of whatever prepared batches are ready.
    Flush,
}

/// Thread-safe FIFO of deferred work.
#[derive(Default)]
pub(crate) struct TaskQueue {
    queue: Mutex<VecDeque<Task>>,
}

impl TaskQueue {
    pub(crate) fn push(&self, task: Task) {
        self.queue.lock().push_back(task);
    }

    pub(crate) fn pop(&self) -> Option<Task> {
        self.queue.lock().pop_front()
    }

    pub(crate) fn len(&self) -> usize {
        self.queue.lock().len()
    }
}
