use super::backing::AllocError;
use super::block::{BlockHeader, Strategy, ALIGNMENT, HEADER_SIZE};
use super::chunks::{ChunkStore, SLAB_CHUNK_SIZE};
use crate::sync::Mutex;
#[cfg(debug_assertions)]
use fixedbitset::FixedBitSet;
use std::ptr::NonNull;

/// Fixed-payload-size allocator backed by its own 64 KiB chunks.
///
/// Holds one LIFO free list threaded through the block headers and an
/// internal mutex independent of the pool mutex. Three instances exist per
/// pool (payloads of 32, 128 and 256 bytes); the per-thread magazines batch
/// blocks out of here so the hot path never takes this lock.
pub(crate) struct SlabAllocator {
    block_size: usize,
    inner: Mutex<SlabCore>,
}

struct SlabCore {
    block_size: usize,
    chunks: ChunkStore,
    free_head: *mut BlockHeader,
    free_len: usize,
    /// One bit per slot, set while the slot is on the free list. Catches
    /// double frees before they corrupt the list.
    #[cfg(debug_assertions)]
    free_map: FixedBitSet,
}

// Safety: SlabCore owns its chunks and every header they contain.
unsafe impl Send for SlabCore {}

/// Header + payload footprint of one slot.
#[inline]
fn stride(block_size: usize) -> usize {
    HEADER_SIZE + block_size
}

#[inline]
fn slots_per_chunk(block_size: usize) -> usize {
    SLAB_CHUNK_SIZE / stride(block_size)
}

impl SlabAllocator {
    /// Create a slab for `block_size`-byte payloads, eagerly seeded with
    /// one chunk.
    ///
    /// # Errors
    /// Returns `AllocError::OutOfMemory` if the initial chunk cannot be
    /// obtained.
    pub fn new(block_size: usize) -> Result<Self, AllocError> {
        debug_assert!(
            block_size >= ALIGNMENT && block_size.is_multiple_of(ALIGNMENT),
            "slab block size {block_size} must be a multiple of {ALIGNMENT}",
        );
        let mut core = SlabCore {
            block_size,
            chunks: ChunkStore::new(SLAB_CHUNK_SIZE),
            free_head: std::ptr::null_mut(),
            free_len: 0,
            #[cfg(debug_assertions)]
            free_map: FixedBitSet::with_capacity(0),
        };
        Self::grow(&mut core)?;
        Ok(Self {
            block_size,
            inner: Mutex::new(core),
        })
    }

    #[inline]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Allocate one block, growing by one chunk if the free list is empty.
    ///
    /// The returned payload's header still reads as free; the pool facade
    /// stamps it allocated when handing it to the caller (blocks parked in
    /// a magazine stay in the free state).
    ///
    /// # Errors
    /// Returns `AllocError::OutOfMemory` when a needed chunk cannot be
    /// obtained.
    pub fn allocate(&self) -> Result<NonNull<u8>, AllocError> {
        let mut core = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(payload) = Self::pop(&mut core) {
            return Ok(payload);
        }
        Self::grow(&mut core)?;
        Self::pop(&mut core).ok_or_else(|| AllocError::exhausted("slab chunk yielded no blocks"))
    }

    /// Pop up to `max` blocks from the existing free list into `out`,
    /// under a single lock acquisition. Does not grow: an empty slab
    /// returns 0 and the caller falls back to [`allocate`](Self::allocate).
    pub fn allocate_batch(&self, max: usize, out: &mut Vec<NonNull<u8>>) -> usize {
        let mut core = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut taken = 0;
        while taken < max {
            match Self::pop(&mut core) {
                Some(payload) => {
                    out.push(payload);
                    taken += 1;
                }
                None => break,
            }
        }
        taken
    }

    /// Return `payload` to the free list.
    ///
    /// # Safety
    /// `payload` must have been produced by this slab and must not be on
    /// the free list or in any magazine.
    pub unsafe fn deallocate(&self, payload: NonNull<u8>) {
        // Safety: payload belongs to this slab per the contract.
        let header = unsafe { BlockHeader::from_payload(payload) };
        let mut core = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);

        #[cfg(debug_assertions)]
        {
            let addr = header.as_ptr() as usize;
            let (base, _) = core
                .chunks
                .chunk_range(addr)
                .unwrap_or_else(|| panic!("pointer {payload:p} does not belong to this slab"));
            assert!(
                (addr - base).is_multiple_of(stride(core.block_size)),
                "pointer {payload:p} is not aligned to a slab slot",
            );
            let slot = Self::slot_index(&core, addr);
            assert!(
                !core.free_map.contains(slot),
                "double free detected in slab ({} bytes): slot {slot}",
                core.block_size
            );
            core.free_map.insert(slot);
        }

        // Safety: we own the header while it is off every free structure.
        unsafe {
            debug_assert_eq!((*header.as_ptr()).size, core.block_size);
            (*header.as_ptr()).is_free = true;
            (*header.as_ptr()).strategy = Strategy::FixedSize;
            (*header.as_ptr()).prev = std::ptr::null_mut();
            (*header.as_ptr()).next = core.free_head;
        }
        core.free_head = header.as_ptr();
        core.free_len += 1;
    }

    /// Whether `addr` falls inside one of this slab's chunks.
    pub fn owns(&self, addr: usize) -> bool {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner).chunks.owns(addr)
    }

    /// Rebuild the free list from the existing chunks: every slot becomes
    /// free again. Part of pool `reset`; outstanding payloads and magazine
    /// contents are invalidated by the caller's contract.
    pub fn reset(&self) {
        let mut core = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        core.free_head = std::ptr::null_mut();
        core.free_len = 0;
        #[cfg(debug_assertions)]
        core.free_map.clear();
        let bases: Vec<NonNull<u8>> = core.chunks.iter().collect();
        for base in bases {
            // Safety: the chunk is owned by this slab and nothing on it is
            // live once reset has been invoked.
            unsafe { Self::link_chunk(&mut core, base) };
        }
    }

    #[cfg(test)]
    pub fn free_len(&self) -> usize {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner).free_len
    }

    #[cfg(test)]
    pub fn chunk_count(&self) -> usize {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner).chunks.len()
    }

    fn pop(core: &mut SlabCore) -> Option<NonNull<u8>> {
        let header = NonNull::new(core.free_head)?;
        // Safety: list members are valid headers inside our chunks.
        unsafe {
            core.free_head = (*header.as_ptr()).next;
            (*header.as_ptr()).next = std::ptr::null_mut();
        }
        core.free_len -= 1;
        #[cfg(debug_assertions)]
        {
            let slot = Self::slot_index(core, header.as_ptr() as usize);
            core.free_map.set(slot, false);
        }
        // Safety: header is valid, so its payload address is too.
        Some(unsafe { BlockHeader::payload_of(header) })
    }

    fn grow(core: &mut SlabCore) -> Result<(), AllocError> {
        let chunk = core.chunks.obtain()?;
        #[cfg(debug_assertions)]
        core.free_map
            .grow(core.chunks.len() * slots_per_chunk(core.block_size));
        // Safety: the fresh chunk is exclusively ours.
        unsafe { Self::link_chunk(core, chunk) };
        Ok(())
    }

    /// Partition `chunk` into slots and push them all onto the free list.
    ///
    /// # Safety
    /// `chunk` must be owned by `core` and contain no live blocks.
    unsafe fn link_chunk(core: &mut SlabCore, chunk: NonNull<u8>) {
        let stride = stride(core.block_size);
        let slots = slots_per_chunk(core.block_size);
        let base = chunk.as_ptr() as usize;
        for i in 0..slots {
            // Safety: slot offsets stay inside the chunk; the trailing
            // remainder (< stride bytes) is left unused.
            let header = unsafe {
                let ptr = NonNull::new_unchecked((base + i * stride) as *mut u8);
                let header = BlockHeader::init(ptr, stride, Strategy::FixedSize);
                (*header.as_ptr()).next = core.free_head;
                header
            };
            core.free_head = header.as_ptr();
            core.free_len += 1;
            #[cfg(debug_assertions)]
            {
                let slot = Self::slot_index(core, header.as_ptr() as usize);
                core.free_map.insert(slot);
            }
        }
    }

    /// Stable slot number of a header address across all chunks.
    #[cfg(debug_assertions)]
    fn slot_index(core: &SlabCore, addr: usize) -> usize {
        let per_chunk = slots_per_chunk(core.block_size);
        let stride = stride(core.block_size);
        let (chunk_idx, base) = core
            .chunks
            .iter()
            .enumerate()
            .find_map(|(i, c)| {
                let b = c.as_ptr() as usize;
                (addr >= b && addr < b + SLAB_CHUNK_SIZE).then_some((i, b))
            })
            .expect("slot_index on foreign address");
        chunk_idx * per_chunk + (addr - base) / stride
    }
}
