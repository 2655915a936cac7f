use crate::sync::cell::UnsafeCell;
use crate::sync::unsafe_cell_get_mut;
use std::ptr::NonNull;

/// Max blocks parked in one magazine before frees spill to the slab.
pub(crate) const MAGAZINE_CAP: usize = 256;

/// Blocks pulled from a slab in one batch when a magazine runs dry.
pub(crate) const MAGAZINE_REFILL: usize = 32;

/// Number of magazines per pool (one per slab size).
pub(crate) const MAGAZINE_COUNT: usize = 3;

/// Magazine slot for a fixed-size payload. Sizes above 256 never reach the
/// fixed path (the dispatcher reroutes them).
#[inline]
pub(crate) fn magazine_index(size: usize) -> usize {
    debug_assert!(size <= 256, "size {size} has no magazine");
    if size <= 32 {
        0
    } else if size <= 128 {
        1
    } else {
        2
    }
}

/// One pool's per-thread magazines: bounded LIFO buffers of payload
/// pointers for the three slab sizes.
///
/// `epoch` is the pool's cache epoch at the last touch. `Pool::reset`
/// bumps the pool epoch; a magazine observed with a stale epoch is
/// discarded wholesale (reset rebuilt the slab free lists, so pushing the
/// stale pointers back would double-insert them).
pub(crate) struct Magazines {
    pub pool_id: u64,
    pub epoch: u64,
    bins: [Vec<NonNull<u8>>; MAGAZINE_COUNT],
}

impl Magazines {
    fn new(pool_id: u64, epoch: u64) -> Self {
        Self {
            pool_id,
            epoch,
            bins: [Vec::new(), Vec::new(), Vec::new()],
        }
    }

    #[inline]
    pub fn pop(&mut self, idx: usize) -> Option<NonNull<u8>> {
        self.bins[idx].pop()
    }

    /// Push unless the magazine is at [`MAGAZINE_CAP`]; a full magazine
    /// returns `false` and the caller frees to the slab instead.
    #[inline]
    pub fn push(&mut self, idx: usize, payload: NonNull<u8>) -> bool {
        if self.bins[idx].len() >= MAGAZINE_CAP {
            return false;
        }
        self.bins[idx].push(payload);
        true
    }

    /// Buffer for a batch refill of bin `idx`.
    #[inline]
    pub fn bin_mut(&mut self, idx: usize) -> &mut Vec<NonNull<u8>> {
        &mut self.bins[idx]
    }

    /// Detach one bin's contents (for draining back to a slab).
    pub fn take_bin(&mut self, idx: usize) -> Vec<NonNull<u8>> {
        std::mem::take(&mut self.bins[idx])
    }

    /// Drop all cached pointers without returning them anywhere.
    pub fn discard(&mut self) {
        for bin in &mut self.bins {
            bin.clear();
        }
    }

    #[cfg(test)]
    pub fn bin_len(&self, idx: usize) -> usize {
        self.bins[idx].len()
    }
}

/// Per-thread handle owning this thread's magazines for every pool it has
/// touched. Pools are few per thread, so a linear scan beats a map.
///
/// # Safety
///
/// `caches` lives in an `UnsafeCell` because it is only ever accessed by
/// the owning thread (via TLS), and nothing called from inside
/// `with_magazines` re-enters the TLS access point: the closure talks to
/// slabs and the pool mutex, never back to this handle.
struct ThreadCacheHandle {
    caches: UnsafeCell<Vec<Magazines>>,
}

thread_local! {
    static THREAD_CACHES: ThreadCacheHandle = ThreadCacheHandle {
        caches: UnsafeCell::new(Vec::new()),
    };
}

/// Run `f` with the calling thread's magazines for `pool_id`, creating
/// them on first touch and discarding stale contents when `epoch` moved.
pub(crate) fn with_magazines<R>(pool_id: u64, epoch: u64, f: impl FnOnce(&mut Magazines) -> R) -> R {
    THREAD_CACHES.with(|handle| {
        // Safety: single-threaded TLS access; no re-entrancy (see
        // ThreadCacheHandle's safety comment).
        let caches = unsafe_cell_get_mut!(handle.caches);
        let idx = match caches.iter().position(|m| m.pool_id == pool_id) {
            Some(i) => i,
            None => {
                caches.push(Magazines::new(pool_id, epoch));
                caches.len() - 1
            }
        };
        let magazines = &mut caches[idx];
        if magazines.epoch != epoch {
            magazines.discard();
            magazines.epoch = epoch;
        }
        f(magazines)
    })
}

/// Detach the calling thread's magazines for `pool_id`, if any. The caller
/// decides whether the contents go back to the slabs (live epoch) or are
/// dropped (stale epoch). Pools this thread never touched, or whose entry
/// was already released, yield `None`.
pub(crate) fn take_magazines(pool_id: u64) -> Option<Magazines> {
    THREAD_CACHES.with(|handle| {
        // Safety: single-threaded TLS access (see above).
        let caches = unsafe_cell_get_mut!(handle.caches);
        let idx = caches.iter().position(|m| m.pool_id == pool_id)?;
        Some(caches.swap_remove(idx))
    })
}
