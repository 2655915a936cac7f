use super::backing::AllocError;
use super::block::{BlockHeader, Strategy, ALIGNMENT, HEADER_SIZE, MIN_SPLIT_PAYLOAD};
use super::cache::{self, magazine_index, MAGAZINE_COUNT, MAGAZINE_REFILL};
use super::chunks::{ChunkStore, POOL_CHUNK_SIZE};
use super::freelist::{physically_adjacent, FreeList, SizeIndex};
use super::scope::ScopeStack;
use super::segregated::{SegregatedLists, CLASS_SIZES};
use super::slab::SlabAllocator;
use super::stats;
use crate::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use crate::sync::Mutex;
use std::ptr::NonNull;

/// Payload sizes of the three slab allocators.
const SLAB_SIZES: [usize; MAGAZINE_COUNT] = [32, 128, 256];

/// Largest request the fixed-size slabs serve.
const FIXED_MAX: usize = 256;

/// Largest default-strategy request routed to the segregated lists.
const SEGREGATED_MAX: usize = 512;

/// Largest payload a single general-pool chunk can hold.
const MAX_BLOCK_PAYLOAD: usize = POOL_CHUNK_SIZE - HEADER_SIZE;

// Pool ids key the thread-local magazines and must stay unique for the
// whole process, including across loom model iterations, so this counter
// deliberately bypasses the loom shim (it is not synchronization state).
static NEXT_POOL_ID: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(1);

/// Locking discipline of a pool, chosen at construction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConcurrencyMode {
    /// Multi-producer, multi-consumer: every path may block on the pool
    /// mutex or a slab mutex.
    Shared,
    /// Single owner. The mutex is still acquired (eliding it on a `Sync`
    /// type would be unsound), but only via an uncontended `try_lock`;
    /// contention means the single-owner contract was broken and asserts
    /// in debug builds.
    Exclusive,
}

/// Everything guarded by the pool mutex.
struct PoolCore {
    chunks: ChunkStore,
    free_list: FreeList,
    size_index: SizeIndex,
    segregated: SegregatedLists,
    scopes: ScopeStack,
}

#[cfg(not(loom))]
type CoreGuard<'a> = std::sync::MutexGuard<'a, PoolCore>;
#[cfg(loom)]
type CoreGuard<'a> = loom::sync::MutexGuard<'a, PoolCore>;

/// General-purpose heap pool.
///
/// Requests are routed by size: tiny ones to the fixed-size slabs through
/// per-thread magazines, mid-sized ones to the segregated class lists, the
/// rest to the size-indexed best-fit free list with neighbor coalescing.
/// The per-block strategy tag is sticky and routes each `deallocate` back
/// to the structure the block belongs to.
pub struct Pool {
    id: u64,
    mode: ConcurrencyMode,
    /// Bumped by `reset`; thread magazines lagging behind discard their
    /// contents on next touch instead of pushing stale pointers back.
    cache_epoch: AtomicU64,
    /// Fast-path probe: scope bookkeeping (and its locking) is skipped
    /// entirely while no scope is open anywhere on the pool.
    active_scopes: AtomicUsize,
    core: Mutex<PoolCore>,
    slabs: [SlabAllocator; MAGAZINE_COUNT],
}

impl Pool {
    /// Create a shared-mode pool.
    ///
    /// # Errors
    /// Returns `AllocError::OutOfMemory` if the initial chunks cannot be
    /// obtained from the backing source.
    pub fn new() -> Result<Self, AllocError> {
        Self::with_mode(ConcurrencyMode::Shared)
    }

    /// Create a pool with an explicit concurrency mode. One general-pool
    /// chunk and one chunk per slab are acquired eagerly.
    ///
    /// # Errors
    /// Returns `AllocError::OutOfMemory` if the initial chunks cannot be
    /// obtained from the backing source.
    pub fn with_mode(mode: ConcurrencyMode) -> Result<Self, AllocError> {
        let slabs = [
            SlabAllocator::new(SLAB_SIZES[0])?,
            SlabAllocator::new(SLAB_SIZES[1])?,
            SlabAllocator::new(SLAB_SIZES[2])?,
        ];
        let mut core = PoolCore {
            chunks: ChunkStore::new(POOL_CHUNK_SIZE),
            free_list: FreeList::new(),
            size_index: SizeIndex::new(),
            segregated: SegregatedLists::new(),
            scopes: ScopeStack::new(),
        };
        Self::grow(&mut core)?;
        Ok(Self {
            id: NEXT_POOL_ID.fetch_add(1, std::sync::atomic::Ordering::Relaxed),
            mode,
            cache_epoch: AtomicU64::new(0),
            active_scopes: AtomicUsize::new(0),
            core: Mutex::new(core),
            slabs,
        })
    }

    #[inline]
    pub fn mode(&self) -> ConcurrencyMode {
        self.mode
    }

    fn lock_core(&self) -> CoreGuard<'_> {
        match self.mode {
            ConcurrencyMode::Shared => self
                .core
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner),
            ConcurrencyMode::Exclusive => match self.core.try_lock() {
                Ok(guard) => guard,
                Err(std::sync::TryLockError::Poisoned(p)) => p.into_inner(),
                Err(std::sync::TryLockError::WouldBlock) => {
                    debug_assert!(false, "exclusive pool accessed from multiple threads");
                    self.core
                        .lock()
                        .unwrap_or_else(std::sync::PoisonError::into_inner)
                }
            },
        }
    }

    // -----------------------------------------------------------------
    // Allocation
    // -----------------------------------------------------------------

    /// Allocate `size` bytes under the default (best-fit) strategy. Small
    /// requests are reclassified to the slab and segregated tiers.
    ///
    /// # Errors
    /// `OutOfMemory` when the backing source refuses or no block fits
    /// after one chunk acquisition; `TooLarge` on size overflow.
    pub fn allocate(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        self.allocate_with(size, Strategy::BestFit)
    }

    /// Allocate with an explicit strategy, bypassing reclassification.
    ///
    /// An explicit `Segregated` request above the largest class falls
    /// through to best fit, and an explicit `FixedSize` request above 256
    /// bytes routes to the general pool under best fit.
    ///
    /// # Errors
    /// See [`allocate`](Self::allocate).
    pub fn allocate_with(
        &self,
        size: usize,
        strategy: Strategy,
    ) -> Result<NonNull<u8>, AllocError> {
        let aligned = BlockHeader::align_size(size).ok_or(AllocError::TooLarge { size })?;
        let effective = match strategy {
            Strategy::BestFit => Self::reclassify(aligned),
            explicit => explicit,
        };

        if effective == Strategy::FixedSize && aligned <= FIXED_MAX {
            let payload = self.allocate_fixed(aligned)?;
            if self.active_scopes.load(Ordering::Relaxed) > 0 {
                let mut core = self.lock_core();
                core.scopes.record(payload.as_ptr() as usize);
            }
            // Safety: payload was just produced by this pool.
            stats::record_alloc(unsafe { Self::usable_size(payload) });
            return Ok(payload);
        }

        let mut core = self.lock_core();
        let payload = match effective {
            Strategy::Pool => Self::allocate_pool(&mut core, aligned)?,
            Strategy::Segregated => Self::allocate_segregated(&mut core, aligned)?,
            Strategy::BestFit | Strategy::FixedSize => {
                Self::allocate_best_fit(&mut core, aligned)?
            }
        };
        if core.scopes.depth() > 0 {
            core.scopes.record(payload.as_ptr() as usize);
        }
        drop(core);
        // Safety: payload was just produced by this pool.
        stats::record_alloc(unsafe { Self::usable_size(payload) });
        Ok(payload)
    }

    /// The dispatch table: the only policy knob in the allocator.
    fn reclassify(aligned: usize) -> Strategy {
        if aligned <= FIXED_MAX {
            Strategy::FixedSize
        } else if aligned <= SEGREGATED_MAX {
            Strategy::Segregated
        } else {
            Strategy::BestFit
        }
    }

    /// Fixed path: magazine pop, batch refill from the slab, then a
    /// single-block slab allocation as the last resort. Touches neither
    /// the pool mutex nor (on a magazine hit) the slab mutex.
    fn allocate_fixed(&self, aligned: usize) -> Result<NonNull<u8>, AllocError> {
        let idx = magazine_index(aligned);
        let slab = &self.slabs[idx];
        let epoch = self.cache_epoch.load(Ordering::Acquire);

        let payload = cache::with_magazines(self.id, epoch, |magazines| {
            if let Some(p) = magazines.pop(idx) {
                return Ok(p);
            }
            let taken = slab.allocate_batch(MAGAZINE_REFILL, magazines.bin_mut(idx));
            if taken > 0 {
                if let Some(p) = magazines.pop(idx) {
                    return Ok(p);
                }
            }
            slab.allocate()
        })?;

        // Safety: the block is ours until handed to the caller.
        unsafe {
            let header = BlockHeader::from_payload(payload);
            (*header.as_ptr()).is_free = false;
            (*header.as_ptr()).strategy = Strategy::FixedSize;
            (*header.as_ptr()).next = std::ptr::null_mut();
            (*header.as_ptr()).prev = std::ptr::null_mut();
        }
        Ok(payload)
    }

    /// Best fit: smallest sufficient block from the size index, split when
    /// the remainder can hold a useful payload.
    fn allocate_best_fit(
        core: &mut PoolCore,
        aligned: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        if aligned > MAX_BLOCK_PAYLOAD {
            return Err(AllocError::exhausted("request exceeds chunk capacity"));
        }
        let block = match core.size_index.smallest_at_least(aligned) {
            Some(b) => b,
            None => {
                Self::grow(core)?;
                core.size_index
                    .smallest_at_least(aligned)
                    .ok_or_else(|| AllocError::exhausted("no fit after chunk acquisition"))?
            }
        };

        // Safety: index entries are live free headers under the pool lock.
        unsafe {
            core.size_index.remove((*block.as_ptr()).size, block);
            core.free_list.detach(block);

            let block_size = (*block.as_ptr()).size;
            if block_size >= aligned + HEADER_SIZE + MIN_SPLIT_PAYLOAD {
                let remainder_total = block_size - aligned;
                let remainder_ptr =
                    NonNull::new_unchecked(BlockHeader::payload_of(block).as_ptr().add(aligned));
                let remainder =
                    BlockHeader::init(remainder_ptr, remainder_total, Strategy::BestFit);
                (*block.as_ptr()).size = aligned;
                core.free_list.insert(remainder);
                core.size_index.insert((*remainder.as_ptr()).size, remainder);
            }

            (*block.as_ptr()).is_free = false;
            (*block.as_ptr()).strategy = Strategy::BestFit;
            Ok(BlockHeader::payload_of(block))
        }
    }

    /// Pool-based: first fit over the size index, detached whole.
    fn allocate_pool(core: &mut PoolCore, aligned: usize) -> Result<NonNull<u8>, AllocError> {
        if aligned > MAX_BLOCK_PAYLOAD {
            return Err(AllocError::exhausted("request exceeds chunk capacity"));
        }
        let block = match core.size_index.smallest_at_least(aligned) {
            Some(b) => b,
            None => {
                Self::grow(core)?;
                core.size_index
                    .smallest_at_least(aligned)
                    .ok_or_else(|| AllocError::exhausted("no fit after chunk acquisition"))?
            }
        };
        // Safety: index entries are live free headers under the pool lock.
        unsafe {
            core.size_index.remove((*block.as_ptr()).size, block);
            core.free_list.detach(block);
            (*block.as_ptr()).is_free = false;
            (*block.as_ptr()).strategy = Strategy::Pool;
            Ok(BlockHeader::payload_of(block))
        }
    }

    /// Segregated: exact-class pop, refilling the class from a fresh chunk
    /// once; anything unservable delegates to best fit.
    fn allocate_segregated(
        core: &mut PoolCore,
        aligned: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        let Some(class) = SegregatedLists::class_index(aligned) else {
            return Self::allocate_best_fit(core, aligned);
        };
        if let Some(block) = core.segregated.pop(class) {
            return Ok(Self::claim_segregated(block));
        }
        // A refill failure (backing refused) is not fatal yet: best fit
        // may still be able to serve from the existing free list.
        if Self::refill_segregated(core, class).is_ok() {
            if let Some(block) = core.segregated.pop(class) {
                return Ok(Self::claim_segregated(block));
            }
        }
        Self::allocate_best_fit(core, aligned)
    }

    fn claim_segregated(block: NonNull<BlockHeader>) -> NonNull<u8> {
        // Safety: the block was just popped off a class list we own.
        unsafe {
            (*block.as_ptr()).is_free = false;
            (*block.as_ptr()).strategy = Strategy::Segregated;
            (*block.as_ptr()).next = std::ptr::null_mut();
            (*block.as_ptr()).prev = std::ptr::null_mut();
            BlockHeader::payload_of(block)
        }
    }

    /// Partition one fresh chunk into `class` blocks. The divisible prefix
    /// becomes class members; a tail remainder big enough to carry a
    /// header is handed to the best-fit list instead of being stranded.
    fn refill_segregated(core: &mut PoolCore, class: usize) -> Result<(), AllocError> {
        let class_size = CLASS_SIZES[class];
        let stride = HEADER_SIZE + class_size;
        let chunk = core.chunks.obtain()?;
        let base = chunk.as_ptr() as usize;
        let count = POOL_CHUNK_SIZE / stride;
        debug_assert!(count > 0);

        // Safety: the fresh chunk is exclusively ours; every offset below
        // stays inside it.
        unsafe {
            for i in 0..count {
                let ptr = NonNull::new_unchecked((base + i * stride) as *mut u8);
                let block = BlockHeader::init(ptr, stride, Strategy::Segregated);
                core.segregated.push(class, block);
            }
            let used = count * stride;
            let remainder = POOL_CHUNK_SIZE - used;
            if remainder > HEADER_SIZE {
                let ptr = NonNull::new_unchecked((base + used) as *mut u8);
                let block = BlockHeader::init(ptr, remainder, Strategy::BestFit);
                core.free_list.insert(block);
                core.size_index.insert((*block.as_ptr()).size, block);
            }
        }
        Ok(())
    }

    /// Acquire one general-pool chunk and seed it with a single spanning
    /// free block.
    fn grow(core: &mut PoolCore) -> Result<(), AllocError> {
        let chunk = core.chunks.obtain()?;
        // Safety: the fresh chunk is exclusively ours.
        unsafe {
            let block = BlockHeader::init(chunk, POOL_CHUNK_SIZE, Strategy::BestFit);
            core.free_list.insert(block);
            core.size_index.insert((*block.as_ptr()).size, block);
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Deallocation
    // -----------------------------------------------------------------

    /// Return `payload` to the structure its strategy tag names.
    ///
    /// # Safety
    /// `payload` must be a pointer previously returned by this pool's
    /// allocate family and not yet deallocated. Null is handled by
    /// [`deallocate_raw`](Self::deallocate_raw).
    pub unsafe fn deallocate(&self, payload: NonNull<u8>) {
        // Safety: payload maps to a live header per the contract.
        let header = unsafe { BlockHeader::from_payload(payload) };
        let (strategy, size) = unsafe {
            debug_assert!(
                !(*header.as_ptr()).is_free,
                "double free of payload {payload:p}",
            );
            ((*header.as_ptr()).strategy, (*header.as_ptr()).size)
        };
        debug_assert!(
            self.owns(payload),
            "payload {payload:p} does not belong to this pool",
        );

        if strategy == Strategy::FixedSize && size <= FIXED_MAX {
            if self.active_scopes.load(Ordering::Relaxed) > 0 {
                let mut core = self.lock_core();
                core.scopes.unregister(payload.as_ptr() as usize);
            }
            self.deallocate_fixed(payload, size);
        } else {
            let mut core = self.lock_core();
            if self.active_scopes.load(Ordering::Relaxed) > 0 {
                core.scopes.unregister(payload.as_ptr() as usize);
            }
            match strategy {
                // Safety: the block is ours again; the pool lock is held.
                Strategy::Segregated => unsafe {
                    Self::deallocate_segregated(&mut core, header)
                },
                _ => unsafe { Self::insert_free_block(&mut core, header) },
            }
        }
        stats::record_dealloc(size);
    }

    /// Null-tolerant deallocation for raw-pointer call sites.
    ///
    /// # Safety
    /// Non-null `ptr` carries the same contract as
    /// [`deallocate`](Self::deallocate).
    pub unsafe fn deallocate_raw(&self, ptr: *mut u8) {
        if let Some(payload) = NonNull::new(ptr) {
            // Safety: forwarded contract.
            unsafe { self.deallocate(payload) };
        }
    }

    fn deallocate_fixed(&self, payload: NonNull<u8>, size: usize) {
        let idx = magazine_index(size);
        let epoch = self.cache_epoch.load(Ordering::Acquire);
        let parked = cache::with_magazines(self.id, epoch, |magazines| {
            // Safety: the block is ours; parked blocks read as free.
            unsafe {
                let header = BlockHeader::from_payload(payload);
                (*header.as_ptr()).is_free = true;
                (*header.as_ptr()).strategy = Strategy::FixedSize;
                (*header.as_ptr()).next = std::ptr::null_mut();
                (*header.as_ptr()).prev = std::ptr::null_mut();
            }
            magazines.push(idx, payload)
        });
        if !parked {
            // Magazine at cap: hand the block back to its slab.
            // Safety: payload came from slabs[idx] (size tiers are fixed).
            unsafe { self.slabs[idx].deallocate(payload) };
        }
    }

    /// # Safety
    /// Caller holds the pool lock; `header` is a live, just-freed block.
    unsafe fn deallocate_segregated(core: &mut PoolCore, header: NonNull<BlockHeader>) {
        // Safety: per contract.
        let size = unsafe { (*header.as_ptr()).size };
        match SegregatedLists::exact_class(size) {
            // Safety: size matches the class exactly.
            Some(class) => unsafe { core.segregated.push(class, header) },
            // Only possible after explicit reclassification; the block was
            // never a class member, so it belongs to the best-fit list.
            None => unsafe { Self::insert_free_block(core, header) },
        }
    }

    /// Insert into the address-ordered free list + size index, then merge
    /// with the physically adjacent next and previous neighbors.
    ///
    /// # Safety
    /// Caller holds the pool lock; `header` is a live, just-freed block
    /// inside one of the pool's chunks.
    unsafe fn insert_free_block(core: &mut PoolCore, header: NonNull<BlockHeader>) {
        // Safety: per contract.
        unsafe {
            (*header.as_ptr()).is_free = true;
            (*header.as_ptr()).strategy = Strategy::BestFit;
            core.free_list.insert(header);
            core.size_index.insert((*header.as_ptr()).size, header);

            // The list is address-ordered, so the only coalescing
            // candidates are the block's list neighbors. A physically
            // adjacent block under a different tag is not on this list and
            // the adjacency test against the farther list neighbor fails,
            // which is exactly the no-cross-tag rule.
            if let Some(next) = NonNull::new((*header.as_ptr()).next) {
                if physically_adjacent(header, next) && Self::same_chunk(core, header, next) {
                    core.size_index.remove((*next.as_ptr()).size, next);
                    core.free_list.detach(next);
                    core.size_index.remove((*header.as_ptr()).size, header);
                    (*header.as_ptr()).size += HEADER_SIZE + (*next.as_ptr()).size;
                    core.size_index.insert((*header.as_ptr()).size, header);
                }
            }
            if let Some(prev) = NonNull::new((*header.as_ptr()).prev) {
                if physically_adjacent(prev, header) && Self::same_chunk(core, prev, header) {
                    core.size_index.remove((*header.as_ptr()).size, header);
                    core.free_list.detach(header);
                    core.size_index.remove((*prev.as_ptr()).size, prev);
                    (*prev.as_ptr()).size += HEADER_SIZE + (*header.as_ptr()).size;
                    core.size_index.insert((*prev.as_ptr()).size, prev);
                }
            }
        }
    }

    /// Adjacent chunks from separate acquisitions can abut by accident;
    /// merging across that seam would create a block that `reset` later
    /// splits back apart. Coalescing therefore requires both headers in
    /// the same chunk.
    fn same_chunk(core: &PoolCore, a: NonNull<BlockHeader>, b: NonNull<BlockHeader>) -> bool {
        core.chunks
            .chunk_range(a.as_ptr() as usize)
            .is_some_and(|(_, end)| (b.as_ptr() as usize) < end)
    }

    // -----------------------------------------------------------------
    // Aligned allocation
    // -----------------------------------------------------------------

    /// Allocate `size` bytes whose address is a multiple of `alignment`
    /// (a power of two, at least 16). The original payload pointer is
    /// stashed in the word below the returned pointer for
    /// [`deallocate_aligned`](Self::deallocate_aligned).
    ///
    /// # Errors
    /// `InvalidAlignment` for bad alignments, `TooLarge` on overflow,
    /// plus the [`allocate`](Self::allocate) errors.
    pub fn allocate_aligned(
        &self,
        size: usize,
        alignment: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        if !alignment.is_power_of_two() || alignment < ALIGNMENT {
            return Err(AllocError::InvalidAlignment { alignment });
        }
        let word = std::mem::size_of::<usize>();
        let total = size
            .checked_add(alignment)
            .and_then(|t| t.checked_add(word))
            .ok_or(AllocError::TooLarge { size })?;
        let raw = self.allocate(total)?;
        let raw_addr = raw.as_ptr() as usize;
        let aligned_addr = (raw_addr + word + alignment - 1) & !(alignment - 1);
        debug_assert!(aligned_addr + size <= raw_addr + total);
        // Safety: aligned_addr - word >= raw_addr, inside the block, and
        // 8-aligned (aligned_addr is at least 16-aligned).
        unsafe { ((aligned_addr - word) as *mut usize).write(raw_addr) };
        // Safety: aligned_addr is derived from a non-null payload.
        Ok(unsafe { NonNull::new_unchecked(aligned_addr as *mut u8) })
    }

    /// Free a pointer produced by [`allocate_aligned`](Self::allocate_aligned).
    ///
    /// # Safety
    /// `aligned` must come from this pool's `allocate_aligned` and not yet
    /// be deallocated.
    pub unsafe fn deallocate_aligned(&self, aligned: NonNull<u8>) {
        // Safety: forwarded contract.
        unsafe {
            let raw = Self::original_payload(aligned);
            self.deallocate(raw);
        }
    }

    /// Recover the original payload behind an aligned pointer (also the
    /// route to `usable_size` for aligned allocations).
    ///
    /// # Safety
    /// `aligned` must come from `allocate_aligned` and still be live.
    pub unsafe fn original_payload(aligned: NonNull<u8>) -> NonNull<u8> {
        let word = std::mem::size_of::<usize>();
        // Safety: allocate_aligned wrote the original address there.
        let raw_addr = unsafe { ((aligned.as_ptr() as usize - word) as *const usize).read() };
        debug_assert!(raw_addr != 0 && raw_addr < aligned.as_ptr() as usize);
        // Safety: the stored address is the non-null allocate() result.
        unsafe { NonNull::new_unchecked(raw_addr as *mut u8) }
    }

    // -----------------------------------------------------------------
    // Scopes
    // -----------------------------------------------------------------

    /// Open a new allocation cohort; everything allocated until the
    /// matching [`end_scope`](Self::end_scope) joins it.
    pub fn begin_scope(&self) {
        let mut core = self.lock_core();
        core.scopes.begin();
        self.active_scopes.fetch_add(1, Ordering::Relaxed);
    }

    /// Close the top cohort and deallocate every member still tracked, in
    /// allocation order. Unmatched calls are no-ops.
    pub fn end_scope(&self) {
        let cohort = {
            let mut core = self.lock_core();
            let cohort = core.scopes.end();
            if cohort.is_some() {
                self.active_scopes.fetch_sub(1, Ordering::Relaxed);
            }
            cohort
        };
        let Some(cohort) = cohort else { return };
        for addr in cohort {
            // Safety: cohort members are live payloads of this pool;
            // directly freed pointers were unregistered and are not here.
            unsafe { self.deallocate(NonNull::new_unchecked(addr as *mut u8)) };
        }
    }

    // -----------------------------------------------------------------
    // Introspection & maintenance
    // -----------------------------------------------------------------

    /// Payload capacity of the block holding `payload`. For aligned
    /// pointers, resolve via [`original_payload`](Self::original_payload)
    /// first.
    ///
    /// # Safety
    /// `payload` must be a live payload of some pool.
    pub unsafe fn usable_size(payload: NonNull<u8>) -> usize {
        // Safety: per contract.
        unsafe { (*BlockHeader::from_payload(payload).as_ptr()).size }
    }

    /// Whether `payload` points into memory owned by this pool (general
    /// chunks or any slab). Opt-in misuse checking; the fast paths never
    /// pay for it.
    pub fn owns(&self, payload: NonNull<u8>) -> bool {
        let addr = payload.as_ptr() as usize;
        if self.slabs.iter().any(|slab| slab.owns(addr)) {
            return true;
        }
        self.lock_core().chunks.owns(addr)
    }

    /// Drain the calling thread's magazines for this pool back into the
    /// slabs. Must be called before a thread exits, or its cached blocks
    /// stay unavailable until the next [`reset`](Self::reset).
    pub fn release_thread_cache(&self) {
        let Some(mut magazines) = cache::take_magazines(self.id) else {
            return;
        };
        if magazines.epoch != self.cache_epoch.load(Ordering::Acquire) {
            // Stale since a reset: the slabs were rebuilt, these pointers
            // are already free there. Dropping them is the only safe move.
            return;
        }
        for idx in 0..MAGAZINE_COUNT {
            for payload in magazines.take_bin(idx) {
                // Safety: magazine members are parked blocks of slabs[idx].
                unsafe { self.slabs[idx].deallocate(payload) };
            }
        }
    }

    /// Drop every live allocation at once: all indices, class lists and
    /// scopes are cleared, every general-pool chunk becomes one spanning
    /// free block again, the slabs rebuild their free lists, and all
    /// thread magazines are invalidated. Stats counters persist (they are
    /// process-wide reporting state).
    ///
    /// Outstanding payloads are invalidated; touching one afterwards is
    /// the same misuse as use-after-free.
    pub fn reset(&self) {
        // Epoch first: any magazine touched from here on discards instead
        // of pushing stale pointers into the rebuilt slabs.
        self.cache_epoch.fetch_add(1, Ordering::AcqRel);
        {
            let mut core = self.lock_core();
            core.free_list.clear();
            core.size_index.clear();
            core.segregated.clear();
            core.scopes.clear();
            self.active_scopes.store(0, Ordering::Relaxed);
            let chunks: Vec<NonNull<u8>> = core.chunks.iter().collect();
            for chunk in chunks {
                // Safety: every outstanding payload is invalidated by this
                // call's contract, so the chunk contains no live block.
                unsafe {
                    let block = BlockHeader::init(chunk, POOL_CHUNK_SIZE, Strategy::BestFit);
                    core.free_list.insert(block);
                    core.size_index.insert((*block.as_ptr()).size, block);
                }
            }
        }
        for slab in &self.slabs {
            slab.reset();
        }
        // The calling thread's own magazines discard immediately; other
        // threads catch up on their next magazine touch.
        let epoch = self.cache_epoch.load(Ordering::Acquire);
        cache::with_magazines(self.id, epoch, |_| {});
    }

    // -----------------------------------------------------------------
    // Test support
    // -----------------------------------------------------------------

    #[cfg(test)]
    pub(crate) fn free_block_sizes(&self) -> Vec<usize> {
        let core = self.lock_core();
        // Safety: the list is quiescent under the lock.
        unsafe { core.free_list.iter() }
            .map(|b| {
                // Safety: listed headers stay valid under the lock.
                unsafe { (*b.as_ptr()).size }
            })
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn general_chunk_count(&self) -> usize {
        self.lock_core().chunks.len()
    }

    #[cfg(test)]
    pub(crate) fn segregated_len(&self, class: usize) -> usize {
        self.lock_core().segregated.class_len(class)
    }

    /// Walk every structure and assert the observable invariants: list
    /// address order, index bijection, coalescing, class membership.
    #[cfg(test)]
    pub(crate) fn validate_invariants(&self) {
        let core = self.lock_core();
        // Safety: all structures are quiescent under the pool lock.
        unsafe {
            let mut prev: Option<NonNull<BlockHeader>> = None;
            let mut listed = 0usize;
            for block in core.free_list.iter() {
                let addr = block.as_ptr() as usize;
                if let Some(p) = prev {
                    assert!(
                        (p.as_ptr() as usize) < addr,
                        "free list out of address order",
                    );
                    assert!(
                        !(physically_adjacent(p, block) && Self::same_chunk(&core, p, block)),
                        "uncoalesced adjacent free blocks at {p:p} / {block:p}",
                    );
                }
                assert!((*block.as_ptr()).is_free, "listed block not free");
                assert_eq!(
                    (*block.as_ptr()).strategy,
                    Strategy::BestFit,
                    "listed block carries a foreign tag",
                );
                listed += 1;
                prev = Some(block);
            }
            assert_eq!(listed, core.size_index.len(), "index/list bijection broken");
            for (size, addr) in core.size_index.iter() {
                assert!(core.free_list.contains(addr), "index entry not listed");
                assert_eq!(
                    (*(addr as *const BlockHeader)).size,
                    size,
                    "index size stale",
                );
            }
            for class in 0..CLASS_SIZES.len() {
                for block in core.segregated.iter_class(class) {
                    assert_eq!((*block.as_ptr()).size, CLASS_SIZES[class]);
                    assert_eq!((*block.as_ptr()).strategy, Strategy::Segregated);
                    assert!((*block.as_ptr()).is_free);
                }
            }
        }
    }
}

thread_local! {
    static DEFAULT_POOL: Pool = Pool::with_mode(ConcurrencyMode::Exclusive)
        .expect("failed to construct thread-local default pool");
}

/// Run `f` against the calling thread's default pool (exclusive mode,
/// constructed on first use).
pub fn with_default_pool<R>(f: impl FnOnce(&Pool) -> R) -> R {
    DEFAULT_POOL.with(|pool| f(pool))
}
