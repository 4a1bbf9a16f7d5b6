use std::fmt;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

/// Wake handle a suspended producer leaves behind when the sink returns
/// blocked. Invoking the callback reschedules the producer; how that happens
/// is up to the embedding executor (condition variable, channel send, async
/// completion).
#[derive(Clone)]
pub struct InterruptState {
    callback: Arc<dyn Fn() + Send + Sync>,
}

impl InterruptState {
    pub fn new(callback: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            callback: Arc::new(callback),
        }
    }

    /// Handle paired with a signal the suspended thread can park on.
    pub fn blocking() -> (Self, BlockedSignal) {
        let inner = Arc::new((Mutex::new(false), Condvar::new()));
        let woken = Arc::clone(&inner);
        let state = Self::new(move || {
            let (lock, condvar) = &*woken;
            *lock.lock() = true;
            condvar.notify_all();
        });
        (state, BlockedSignal { inner })
    }

    pub fn callback(&self) {
        (self.callback)()
    }
}

impl fmt::Debug for InterruptState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterruptState").finish_non_exhaustive()
    }
}

/// Parking side of [`InterruptState::blocking`].
pub struct BlockedSignal {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl BlockedSignal {
    /// Blocks until the paired handle is woken, then consumes the wake.
    pub fn wait(&self) {
        let (lock, condvar) = &*self.inner;
        let mut woken = lock.lock();
        while !*woken {
            condvar.wait(&mut woken);
        }
        *woken = false;
    }
}

/// Registry of suspended producers.
#[derive(Default)]
pub(crate) struct BlockedSet {
    tasks: Vec<InterruptState>,
}

impl BlockedSet {
    pub(crate) fn push(&mut self, state: InterruptState) {
        self.tasks.push(state);
    }

    /// Wakes every registered producer exactly once and clears the set.
    /// Returns whether any producer was woken.
    pub(crate) fn wake_all(&mut self) -> bool {
        if self.tasks.is_empty() {
            return false;
        }
        for task in self.tasks.drain(..) {
            task.callback();
        }
        true
    }
}
