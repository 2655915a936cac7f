use std::ptr::NonNull;

/// Minimum payload alignment. Sufficient for SIMD loads (AVX2) on the
/// supported targets; every payload address is a multiple of this.
pub const ALIGNMENT: usize = 16;

/// Size of the header preceding every payload. The `repr(C, align(16))`
/// layout pads the struct to 32 bytes, so any 16-aligned header address
/// yields a 16-aligned payload.
pub(crate) const HEADER_SIZE: usize = std::mem::size_of::<BlockHeader>();

/// Smallest payload worth carving out of a larger free block. Splits that
/// would leave less than this stay unsplit (internal waste accepted).
pub(crate) const MIN_SPLIT_PAYLOAD: usize = 32;

/// Placement policy for an allocation, and the sticky tag routing its
/// deallocation back to the structure that owns the block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Strategy {
    /// Smallest sufficient block from the size-indexed free list.
    BestFit = 0,
    /// Fixed-size slab block (32, 128 or 256 bytes), served via the
    /// per-thread magazines.
    FixedSize = 1,
    /// First fit over the size index, detached without splitting.
    Pool = 2,
    /// Exact-class block from the segregated lists.
    Segregated = 3,
}

/// Per-block metadata preceding every payload.
///
/// `next`/`prev` are live only while the block sits on a free structure:
/// both on the address-ordered best-fit list, `next` alone on a segregated
/// or slab list. The payload address uniquely determines the header
/// (`header = payload - HEADER_SIZE`).
#[repr(C, align(16))]
pub(crate) struct BlockHeader {
    pub next: *mut BlockHeader,
    pub prev: *mut BlockHeader,
    /// Payload bytes, excluding this header.
    pub size: usize,
    pub is_free: bool,
    pub strategy: Strategy,
}

impl BlockHeader {
    /// Write a fresh free header at `ptr`, spanning `total_size` bytes of
    /// raw memory (header included).
    ///
    /// # Safety
    /// `ptr` must be 16-aligned and valid for `total_size` bytes, with
    /// `total_size > HEADER_SIZE`; no other live block may overlap it.
    pub unsafe fn init(
        ptr: NonNull<u8>,
        total_size: usize,
        strategy: Strategy,
    ) -> NonNull<BlockHeader> {
        debug_assert!(ptr.as_ptr() as usize % ALIGNMENT == 0, "misaligned header at {ptr:p}");
        debug_assert!(total_size > HEADER_SIZE);
        let header = ptr.cast::<BlockHeader>();
        // Safety: ptr is valid for writes per the contract above.
        unsafe {
            header.as_ptr().write(BlockHeader {
                next: std::ptr::null_mut(),
                prev: std::ptr::null_mut(),
                size: total_size - HEADER_SIZE,
                is_free: true,
                strategy,
            });
        }
        header
    }

    /// Recover the header from a payload address previously handed out.
    ///
    /// # Safety
    /// `payload` must point exactly one `HEADER_SIZE` past a live header
    /// written by this allocator.
    #[inline]
    pub unsafe fn from_payload(payload: NonNull<u8>) -> NonNull<BlockHeader> {
        // Safety: contract above; the subtraction stays within the block's
        // chunk.
        unsafe { NonNull::new_unchecked(payload.as_ptr().cast::<BlockHeader>().offset(-1)) }
    }

    /// The payload address of `header`.
    ///
    /// Used as `BlockHeader::payload_of(header)` rather than a method to
    /// avoid materializing intermediate references into memory the caller
    /// may alias (keeps Miri's aliasing model happy).
    #[inline]
    pub unsafe fn payload_of(header: NonNull<BlockHeader>) -> NonNull<u8> {
        // Safety: headers always precede at least one byte of payload.
        unsafe { NonNull::new_unchecked(header.as_ptr().offset(1)).cast() }
    }

    /// Round a request up to the next multiple of [`ALIGNMENT`].
    /// Returns `None` on overflow.
    #[inline]
    pub fn align_size(size: usize) -> Option<usize> {
        Some(size.checked_add(ALIGNMENT - 1)? & !(ALIGNMENT - 1))
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        assert_eq!(HEADER_SIZE, 32);
        assert_eq!(std::mem::align_of::<BlockHeader>(), 16);
    }

    #[test]
    fn test_align_size() {
        assert_eq!(BlockHeader::align_size(0), Some(0));
        assert_eq!(BlockHeader::align_size(1), Some(16));
        assert_eq!(BlockHeader::align_size(16), Some(16));
        assert_eq!(BlockHeader::align_size(17), Some(32));
        assert_eq!(BlockHeader::align_size(4096), Some(4096));
        assert_eq!(BlockHeader::align_size(usize::MAX - 3), None);
    }

    #[test]
    fn test_init_and_payload_roundtrip() {
        let mut backing = [0u8; 256];
        let base = NonNull::new(backing.as_mut_ptr()).unwrap();
        // Align manually inside the local buffer.
        let addr = (base.as_ptr() as usize + ALIGNMENT - 1) & !(ALIGNMENT - 1);
        let ptr = NonNull::new(addr as *mut u8).unwrap();

        // Safety: Test code; buffer is big enough after alignment.
        unsafe {
            let header = BlockHeader::init(ptr, 128, Strategy::BestFit);
            assert_eq!(header.as_ref().size, 128 - HEADER_SIZE);
            assert!(header.as_ref().is_free);
            assert_eq!(header.as_ref().strategy, Strategy::BestFit);
            assert!(header.as_ref().next.is_null());
            assert!(header.as_ref().prev.is_null());

            let payload = BlockHeader::payload_of(header);
            assert_eq!(payload.as_ptr() as usize, addr + HEADER_SIZE);
            assert_eq!(payload.as_ptr() as usize % ALIGNMENT, 0);

            let recovered = BlockHeader::from_payload(payload);
            assert_eq!(recovered, header);
        }
    }
}
