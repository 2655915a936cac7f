use super::backing::{AllocError, ChunkSource, PlatformChunkSource};
use std::collections::BTreeMap;
use std::ptr::NonNull;

/// Chunk size for the general pool.
pub(crate) const POOL_CHUNK_SIZE: usize = 1024 * 1024;

/// Chunk size for each fixed-size slab allocator.
pub(crate) const SLAB_CHUNK_SIZE: usize = 64 * 1024;

/// The raw regions owned by one allocator (the general pool or a slab).
///
/// Chunks are acquired one at a time from the backing source, never freed
/// individually, and released together on drop. An ordered `base -> len`
/// map answers ownership queries in O(log chunks).
pub(crate) struct ChunkStore {
    chunk_size: usize,
    chunks: Vec<NonNull<u8>>,
    by_base: BTreeMap<usize, usize>,
}

// Safety: ChunkStore owns its regions outright; the raw base pointers are
// not aliased by any other owner.
unsafe impl Send for ChunkStore {}

impl ChunkStore {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size,
            chunks: Vec::new(),
            by_base: BTreeMap::new(),
        }
    }

    #[inline]
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    /// Acquire one fresh chunk from the backing source.
    ///
    /// # Errors
    /// Returns `AllocError::OutOfMemory` when the backing source refuses.
    pub fn obtain(&mut self) -> Result<NonNull<u8>, AllocError> {
        // Safety: chunk_size is non-zero and fixed at construction.
        let ptr = unsafe { PlatformChunkSource::obtain(self.chunk_size)? };
        self.chunks.push(ptr);
        self.by_base.insert(ptr.as_ptr() as usize, self.chunk_size);
        Ok(ptr)
    }

    /// Whether `addr` falls inside any chunk owned by this store.
    #[inline]
    pub fn owns(&self, addr: usize) -> bool {
        self.chunk_range(addr).is_some()
    }

    /// The `(base, end)` of the chunk containing `addr`, if any.
    pub fn chunk_range(&self, addr: usize) -> Option<(usize, usize)> {
        let (&base, &len) = self.by_base.range(..=addr).next_back()?;
        (addr < base + len).then_some((base, base + len))
    }

    /// Iterate the chunk base pointers in acquisition order.
    pub fn iter(&self) -> impl Iterator<Item = NonNull<u8>> + '_ {
        self.chunks.iter().copied()
    }
}

impl Drop for ChunkStore {
    fn drop(&mut self) {
        for &chunk in &self.chunks {
            // Safety: chunk/chunk_size came from this store's own obtain().
            unsafe { PlatformChunkSource::release(chunk, self.chunk_size) };
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_obtain_registers_ownership() {
        let mut store = ChunkStore::new(SLAB_CHUNK_SIZE);
        assert_eq!(store.len(), 0);

        let c1 = store.obtain().expect("obtain failed");
        let c2 = store.obtain().expect("obtain failed");
        assert_ne!(c1, c2);
        assert_eq!(store.len(), 2);

        let a1 = c1.as_ptr() as usize;
        assert!(store.owns(a1));
        assert!(store.owns(a1 + SLAB_CHUNK_SIZE - 1));
        assert!(!store.owns(a1 + SLAB_CHUNK_SIZE));

        assert_eq!(store.chunk_range(a1 + 17), Some((a1, a1 + SLAB_CHUNK_SIZE)));
    }

    #[test]
    fn test_owns_rejects_foreign_addresses() {
        let store = ChunkStore::new(SLAB_CHUNK_SIZE);
        assert!(!store.owns(0x1000));

        let mut store = ChunkStore::new(SLAB_CHUNK_SIZE);
        let c = store.obtain().unwrap();
        let base = c.as_ptr() as usize;
        // One below the base belongs to nobody.
        assert!(!store.owns(base - 1));
    }

    #[test]
    fn test_iter_preserves_acquisition_order() {
        let mut store = ChunkStore::new(SLAB_CHUNK_SIZE);
        let c1 = store.obtain().unwrap();
        let c2 = store.obtain().unwrap();
        let order: Vec<_> = store.iter().collect();
        assert_eq!(order, vec![c1, c2]);
    }

    #[test]
    fn test_chunks_are_writable() {
        let mut store = ChunkStore::new(SLAB_CHUNK_SIZE);
        let c = store.obtain().unwrap();
        // Safety: Test code; chunk is owned and SLAB_CHUNK_SIZE long.
        unsafe {
            c.as_ptr().write(0xAB);
            c.as_ptr().add(SLAB_CHUNK_SIZE - 1).write(0xCD);
            assert_eq!(c.as_ptr().read(), 0xAB);
            assert_eq!(c.as_ptr().add(SLAB_CHUNK_SIZE - 1).read(), 0xCD);
        }
    }
}
