use std::fmt;
use std::ptr::NonNull;

/// Allocation failure reported by the pool or its backing chunk source.
#[derive(Debug)]
pub enum AllocError {
    /// The backing chunk source refused, or the pool could not satisfy the
    /// request after its single chunk-acquisition retry.
    OutOfMemory(std::io::Error),
    /// Size arithmetic overflowed while rounding the request.
    TooLarge { size: usize },
    /// Alignment is not a power of two or below the 16-byte minimum.
    InvalidAlignment { alignment: usize },
}

impl AllocError {
    pub(crate) fn exhausted(what: &str) -> Self {
        AllocError::OutOfMemory(std::io::Error::new(
            std::io::ErrorKind::OutOfMemory,
            what.to_string(),
        ))
    }
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocError::OutOfMemory(e) => write!(f, "out of memory: {e}"),
            AllocError::TooLarge { size } => {
                write!(f, "request of {size} bytes overflows size arithmetic")
            }
            AllocError::InvalidAlignment { alignment } => {
                write!(f, "invalid alignment {alignment}: must be a power of two >= 16")
            }
        }
    }
}

impl std::error::Error for AllocError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AllocError::OutOfMemory(e) => Some(e),
            AllocError::TooLarge { .. } | AllocError::InvalidAlignment { .. } => None,
        }
    }
}

/// Abstract interface for acquiring whole chunks from the operating system.
///
/// Chunks are obtained read-write and zero-filled, held for the lifetime of
/// their owning allocator, and returned only on drop. There is no partial
/// commit or decommit: the pool's reuse policies, not the OS, recycle memory.
pub(crate) trait ChunkSource {
    /// Obtain one contiguous, page-aligned, zero-initialized region.
    unsafe fn obtain(size: usize) -> Result<NonNull<u8>, AllocError>;

    /// Return a region to the OS. `ptr`/`size` must come from [`obtain`].
    ///
    /// [`obtain`]: ChunkSource::obtain
    unsafe fn release(ptr: NonNull<u8>, size: usize);

    /// OS page size.
    fn page_size() -> usize;
}

pub(crate) struct PlatformChunkSource;

#[cfg(all(unix, not(any(loom, miri))))]
mod unix {
    use super::{AllocError, ChunkSource, NonNull, PlatformChunkSource};
    use std::io;

    impl ChunkSource for PlatformChunkSource {
        unsafe fn obtain(size: usize) -> Result<NonNull<u8>, AllocError> {
            if size == 0 {
                return Err(AllocError::OutOfMemory(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "zero-size chunk request",
                )));
            }
            // Safety: FFI call to mmap.
            let ptr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    size,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_PRIVATE | libc::MAP_ANON,
                    -1,
                    0,
                )
            };

            if ptr == libc::MAP_FAILED {
                return Err(AllocError::OutOfMemory(io::Error::last_os_error()));
            }

            match NonNull::new(ptr.cast::<u8>()) {
                Some(p) => Ok(p),
                None => Err(AllocError::OutOfMemory(io::Error::other("mmap returned null"))),
            }
        }

        unsafe fn release(ptr: NonNull<u8>, size: usize) {
            // Safety: FFI call to munmap. A failure here means the mapping was
            // already gone; nothing useful can be done with the error during
            // teardown.
            let _ = unsafe { libc::munmap(ptr.as_ptr().cast::<libc::c_void>(), size) };
        }

        fn page_size() -> usize {
            // Safety: FFI call to sysconf.
            let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
            assert!(
                raw > 0,
                "sysconf(_SC_PAGESIZE) failed: {}",
                io::Error::last_os_error()
            );
            // PORTABILITY: this crate supports only 64-bit targets; page size
            // fits in usize there.
            #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
            {
                raw as usize
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Heap-backed fallback (loom, miri, non-Unix)
//
// Under `cfg(loom)` we cannot issue real VM syscalls — loom runs inside a
// single OS process with its own scheduler. Miri cannot model mmap either.
// Both get plain zeroed heap allocations, which is sufficient for testing
// the synchronization logic and the pointer arithmetic of the allocators.
// Non-Unix targets use the same path for portability.
// ---------------------------------------------------------------------------
#[cfg(any(loom, miri, not(unix)))]
impl ChunkSource for PlatformChunkSource {
    unsafe fn obtain(size: usize) -> Result<NonNull<u8>, AllocError> {
        if size == 0 {
            return Err(AllocError::OutOfMemory(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "zero-size chunk request",
            )));
        }
        let layout = std::alloc::Layout::from_size_align(size, 4096)
            .map_err(|e| AllocError::OutOfMemory(std::io::Error::other(e)))?;
        // Safety: layout has non-zero size.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        NonNull::new(ptr).ok_or_else(|| {
            AllocError::OutOfMemory(std::io::Error::new(
                std::io::ErrorKind::OutOfMemory,
                "alloc returned null",
            ))
        })
    }

    unsafe fn release(ptr: NonNull<u8>, size: usize) {
        let Ok(layout) = std::alloc::Layout::from_size_align(size, 4096) else {
            return;
        };
        // Safety: ptr was allocated with the same layout via `obtain`.
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
    }

    fn page_size() -> usize {
        4096
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_obtain_release_roundtrip() {
        let size = PlatformChunkSource::page_size();
        // Safety: Test code.
        unsafe {
            let ptr = PlatformChunkSource::obtain(size).expect("obtain failed");

            // Obtained memory is writable and zero-filled.
            let slice = std::slice::from_raw_parts_mut(ptr.as_ptr(), size);
            assert_eq!(slice[0], 0);
            assert_eq!(slice[size - 1], 0);
            slice[0] = 42;
            assert_eq!(slice[0], 42);

            PlatformChunkSource::release(ptr, size);
        }
    }

    #[test]
    fn test_obtain_zero_size_fails() {
        // Safety: Test code.
        let result = unsafe { PlatformChunkSource::obtain(0) };
        assert!(result.is_err(), "obtaining 0 bytes should fail");
    }

    #[test]
    fn test_obtain_is_page_aligned() {
        let page = PlatformChunkSource::page_size();
        // Safety: Test code.
        unsafe {
            let ptr = PlatformChunkSource::obtain(page * 4).expect("obtain failed");
            assert_eq!(ptr.as_ptr() as usize % page, 0, "chunk {ptr:p} not page aligned");
            PlatformChunkSource::release(ptr, page * 4);
        }
    }

    #[test]
    fn test_page_size_is_power_of_two() {
        let size = PlatformChunkSource::page_size();
        assert!(size > 0);
        assert!(size.is_power_of_two(), "page size {size} is not a power of two");
    }

    #[test]
    fn test_multiple_chunks_independent() {
        let size = PlatformChunkSource::page_size();
        // Safety: Test code.
        unsafe {
            let a = PlatformChunkSource::obtain(size).expect("obtain a failed");
            let b = PlatformChunkSource::obtain(size).expect("obtain b failed");
            assert_ne!(a, b);

            *a.as_ptr() = 1;
            *b.as_ptr() = 2;
            assert_eq!(*a.as_ptr(), 1);
            assert_eq!(*b.as_ptr(), 2);

            PlatformChunkSource::release(a, size);
            // b must survive a's release
            assert_eq!(*b.as_ptr(), 2);
            PlatformChunkSource::release(b, size);
        }
    }

    #[test]
    fn test_error_display() {
        let e = AllocError::TooLarge { size: usize::MAX };
        assert!(e.to_string().contains("overflows"));
        let e = AllocError::InvalidAlignment { alignment: 3 };
        assert!(e.to_string().contains("power of two"));
        let e = AllocError::exhausted("pool exhausted");
        assert!(e.to_string().contains("pool exhausted"));
    }
}
