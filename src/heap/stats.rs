//! Allocation statistics.
//!
//! Hot-path counting is thread-local (`Cell` reads and writes, no atomics);
//! [`merge_thread_stats`] folds the calling thread's counters into the
//! process-wide totals. The global counters use `Relaxed` ordering and are
//! eventually consistent: cross-counter snapshots may transiently disagree.
//! This is diagnostic state; do NOT use it for allocation decisions.

use crate::sync::atomic::{AtomicIsize, Ordering};
use crate::sync::cell::Cell;

/// Diagnostic-only gauge counter.
///
/// Under contention, subtract-before-add races are tolerated and the raw
/// value may transiently dip below zero. Readers should use `get()`, which
/// clamps negative values to zero.
pub struct Counter(AtomicIsize);

impl Counter {
    #[cfg(not(loom))]
    pub const fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[cfg(loom)]
    pub fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[inline]
    fn delta(val: usize) -> isize {
        // Diagnostic counters only: clamp absurd deltas instead of panicking.
        std::cmp::min(val, isize::MAX as usize).cast_signed()
    }

    #[inline]
    pub fn add(&self, val: usize) {
        self.0.fetch_add(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    pub fn sub(&self, val: usize) {
        self.0.fetch_sub(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    pub fn get(&self) -> usize {
        self.0.load(Ordering::Relaxed).max(0).cast_unsigned()
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

// Process-wide totals, fed exclusively by merge_thread_stats().
crate::sync::static_atomic! {
    pub static TOTAL_ALLOCATIONS: Counter = Counter::new();
}
crate::sync::static_atomic! {
    pub static TOTAL_DEALLOCATIONS: Counter = Counter::new();
}
// Outstanding (live) payload bytes across all pools.
crate::sync::static_atomic! {
    pub static TOTAL_BYTES: Counter = Counter::new();
}

struct LocalStats {
    allocations: Cell<usize>,
    deallocations: Cell<usize>,
    bytes_allocated: Cell<usize>,
    last_reported_bytes: Cell<usize>,
}

thread_local! {
    static LOCAL: LocalStats = LocalStats {
        allocations: Cell::new(0),
        deallocations: Cell::new(0),
        bytes_allocated: Cell::new(0),
        last_reported_bytes: Cell::new(0),
    };
}

#[inline]
pub(crate) fn record_alloc(bytes: usize) {
    LOCAL.with(|l| {
        l.allocations.set(l.allocations.get() + 1);
        l.bytes_allocated.set(l.bytes_allocated.get().saturating_add(bytes));
    });
}

#[inline]
pub(crate) fn record_dealloc(bytes: usize) {
    LOCAL.with(|l| {
        l.deallocations.set(l.deallocations.get() + 1);
        l.bytes_allocated.set(l.bytes_allocated.get().saturating_sub(bytes));
    });
}

/// Live payload bytes recorded by the calling thread since its last merge
/// baseline. Allocating on one thread and freeing on another shows up as
/// opposing deltas that cancel in [`TOTAL_BYTES`] after both merge.
pub fn thread_live_bytes() -> usize {
    LOCAL.with(|l| l.bytes_allocated.get())
}

/// Fold the calling thread's counters into the global totals.
///
/// The byte total is updated by the signed delta against the last merge, so
/// threads that freed more than they allocated since then subtract.
pub fn merge_thread_stats() {
    LOCAL.with(|l| {
        TOTAL_ALLOCATIONS.add(l.allocations.get());
        TOTAL_DEALLOCATIONS.add(l.deallocations.get());
        l.allocations.set(0);
        l.deallocations.set(0);

        let current = l.bytes_allocated.get();
        let previous = l.last_reported_bytes.get();
        if current >= previous {
            TOTAL_BYTES.add(current - previous);
        } else {
            TOTAL_BYTES.sub(previous - current);
        }
        l.last_reported_bytes.set(current);
    });
}

/// Point-in-time view of the merged totals.
#[derive(Clone, Copy, Debug)]
pub struct StatsSnapshot {
    pub total_allocations: usize,
    pub total_deallocations: usize,
    pub total_bytes: usize,
}

/// Read the global totals. Only counts what threads have merged.
pub fn snapshot() -> StatsSnapshot {
    StatsSnapshot {
        total_allocations: TOTAL_ALLOCATIONS.get(),
        total_deallocations: TOTAL_DEALLOCATIONS.get(),
        total_bytes: TOTAL_BYTES.get(),
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_counter_clamps_negative() {
        let c = Counter::new();
        c.sub(10);
        assert_eq!(c.get(), 0);
        c.add(25);
        assert_eq!(c.get(), 15);
    }

    #[test]
    fn test_merge_preserves_sign_of_byte_delta() {
        let _guard = crate::heap::TEST_MUTEX.write().unwrap();
        // Run on a dedicated thread so this thread's history cannot skew
        // the local counters.
        std::thread::spawn(|| {
            let before = snapshot();

            record_alloc(1000);
            record_alloc(500);
            merge_thread_stats();
            let mid = snapshot();
            assert_eq!(mid.total_allocations, before.total_allocations + 2);
            assert_eq!(mid.total_bytes, before.total_bytes + 1500);

            // Free more than allocated since the last merge: negative delta.
            record_dealloc(1000);
            record_dealloc(500);
            merge_thread_stats();
            let after = snapshot();
            assert_eq!(after.total_deallocations, mid.total_deallocations + 2);
            assert_eq!(after.total_bytes, before.total_bytes);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_merge_is_idempotent_when_quiet() {
        let _guard = crate::heap::TEST_MUTEX.write().unwrap();
        std::thread::spawn(|| {
            record_alloc(64);
            merge_thread_stats();
            let first = snapshot();
            // Nothing happened since; merging again must not move totals.
            merge_thread_stats();
            let second = snapshot();
            assert_eq!(first.total_allocations, second.total_allocations);
            assert_eq!(first.total_bytes, second.total_bytes);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_thread_live_bytes_tracks_balance() {
        std::thread::spawn(|| {
            assert_eq!(thread_live_bytes(), 0);
            record_alloc(128);
            record_alloc(64);
            assert_eq!(thread_live_bytes(), 192);
            record_dealloc(64);
            assert_eq!(thread_live_bytes(), 128);
            record_dealloc(128);
            assert_eq!(thread_live_bytes(), 0);
        })
        .join()
        .unwrap();
    }
}
