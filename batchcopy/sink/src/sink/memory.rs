use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use datafusion_execution::memory_pool::{
    MemoryConsumer, MemoryLimit, MemoryPool, MemoryReservation,
};

/// Elastic reservation backing the operator's unflushed rows.
///
/// The budget only ever grows while the operator is alive; the pool reclaims
/// everything when the reservation is dropped. A refused request latches
/// `frozen` so a saturated pool is not asked again.
pub(crate) struct MemoryBudget {
    reservation: MemoryReservation,
    /// Never request more than this in total, leaving room for concurrent
    /// operators.
    request_cap: usize,
    frozen: bool,
}

impl MemoryBudget {
    pub(crate) fn register(name: &str, pool: &Arc<dyn MemoryPool>) -> Self {
        let request_cap = match pool.memory_limit() {
            MemoryLimit::Finite(limit) => limit / 4,
            MemoryLimit::Infinite => usize::MAX,
        };
        Self {
            reservation: MemoryConsumer::new(name).register(pool),
            request_cap,
            frozen: false,
        }
    }

    pub(crate) fn current(&self) -> usize {
        self.reservation.size()
    }

    #[cfg(test)]
    pub(crate) fn frozen(&self) -> bool {
        self.frozen
    }

    /// Tries to reserve `target` bytes, mirroring whatever was granted into
    /// `available`.
    pub(crate) fn reserve(&mut self, target: usize, available: &AtomicUsize) {
        let target = target.min(self.request_cap);
        let before = self.current();
        if target <= before {
            return;
        }
        // on refusal the reservation keeps its previous size
        let _ = self.reservation.try_resize(target);
        if self.current() <= before {
            self.frozen = true;
        }
        available.store(self.current(), Ordering::SeqCst);
    }

    /// Requests a doubling of the current reservation.
    pub(crate) fn grow(&mut self, available: &AtomicUsize) {
        if self.frozen {
            return;
        }
        self.reserve(self.current().saturating_mul(2), available);
    }
}
