use super::block::{BlockHeader, HEADER_SIZE};
use std::collections::BTreeSet;
use std::ptr::NonNull;

/// Size-ordered lookup over the free best-fit blocks.
///
/// One ordered set of `(size, header address)` pairs. Entries are in
/// bijection with `{b : b.is_free && b.strategy == BestFit}`: every insert
/// into the free list is mirrored here and every detach removes the mirror.
/// `smallest_at_least` is the lower-bound query serving both best-fit and
/// first-fit selection in O(log n); removal by value makes a reverse
/// pointer-to-entry map unnecessary.
pub(crate) struct SizeIndex {
    entries: BTreeSet<(usize, usize)>,
}

impl SizeIndex {
    pub fn new() -> Self {
        Self {
            entries: BTreeSet::new(),
        }
    }

    pub fn insert(&mut self, size: usize, header: NonNull<BlockHeader>) {
        let fresh = self.entries.insert((size, header.as_ptr() as usize));
        debug_assert!(fresh, "size index already holds ({size}, {header:p})");
    }

    pub fn remove(&mut self, size: usize, header: NonNull<BlockHeader>) {
        let existed = self.entries.remove(&(size, header.as_ptr() as usize));
        debug_assert!(existed, "size index missing ({size}, {header:p})");
    }

    /// The free block with the smallest `size >= wanted`; ties break toward
    /// the lowest address.
    pub fn smallest_at_least(&self, wanted: usize) -> Option<NonNull<BlockHeader>> {
        self.entries
            .range((wanted, 0)..)
            .next()
            .map(|&(_, addr)| {
                // Safety: only valid header addresses are ever inserted.
                unsafe { NonNull::new_unchecked(addr as *mut BlockHeader) }
            })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    #[cfg(test)]
    pub fn iter(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.entries.iter().copied()
    }
}

/// Address-ordered doubly-linked list of the general pool's free blocks.
///
/// The links live inside the free blocks' own headers (`prev`/`next`), so
/// unlinking is O(1) and a block's list neighbors are exactly the
/// candidates for physical coalescing. A separate ordered address set
/// locates the insertion predecessor in O(log n); the original
/// implementation walked the list from its head instead.
pub(crate) struct FreeList {
    head: *mut BlockHeader,
    by_addr: BTreeSet<usize>,
}

// Safety: FreeList only stores addresses of blocks inside chunks owned by
// the enclosing pool; it moves with that pool.
unsafe impl Send for FreeList {}

impl FreeList {
    pub fn new() -> Self {
        Self {
            head: std::ptr::null_mut(),
            by_addr: BTreeSet::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.by_addr.len()
    }

    pub fn contains(&self, addr: usize) -> bool {
        self.by_addr.contains(&addr)
    }

    /// Link `block` into the list at its address-ordered position.
    ///
    /// # Safety
    /// `block` must be a valid free header that is not currently on any
    /// free structure.
    pub unsafe fn insert(&mut self, block: NonNull<BlockHeader>) {
        let addr = block.as_ptr() as usize;
        debug_assert!(!self.by_addr.contains(&addr), "block {block:p} already listed");

        let pred = self.by_addr.range(..addr).next_back().copied();
        // Safety: list membership keeps all linked headers valid.
        unsafe {
            match pred {
                Some(p) => {
                    let prev = p as *mut BlockHeader;
                    let next = (*prev).next;
                    (*block.as_ptr()).prev = prev;
                    (*block.as_ptr()).next = next;
                    (*prev).next = block.as_ptr();
                    if let Some(next) = NonNull::new(next) {
                        (*next.as_ptr()).prev = block.as_ptr();
                    }
                }
                None => {
                    (*block.as_ptr()).prev = std::ptr::null_mut();
                    (*block.as_ptr()).next = self.head;
                    if let Some(head) = NonNull::new(self.head) {
                        (*head.as_ptr()).prev = block.as_ptr();
                    }
                    self.head = block.as_ptr();
                }
            }
        }
        self.by_addr.insert(addr);
    }

    /// Unlink `block` from the list.
    ///
    /// # Safety
    /// `block` must currently be a member of this list.
    pub unsafe fn detach(&mut self, block: NonNull<BlockHeader>) {
        let addr = block.as_ptr() as usize;
        let existed = self.by_addr.remove(&addr);
        debug_assert!(existed, "detach of unlisted block {block:p}");

        // Safety: membership guarantees the neighbor pointers are live.
        unsafe {
            let prev = (*block.as_ptr()).prev;
            let next = (*block.as_ptr()).next;
            if prev.is_null() {
                self.head = next;
            } else {
                (*prev).next = next;
            }
            if !next.is_null() {
                (*next).prev = prev;
            }
            (*block.as_ptr()).prev = std::ptr::null_mut();
            (*block.as_ptr()).next = std::ptr::null_mut();
        }
    }

    pub fn clear(&mut self) {
        self.head = std::ptr::null_mut();
        self.by_addr.clear();
    }

    /// Walk the list front to back.
    ///
    /// # Safety
    /// No header on the list may be mutated or freed during the walk.
    pub unsafe fn iter(&self) -> FreeListIter {
        FreeListIter { cursor: self.head }
    }
}

pub(crate) struct FreeListIter {
    cursor: *mut BlockHeader,
}

impl Iterator for FreeListIter {
    type Item = NonNull<BlockHeader>;

    fn next(&mut self) -> Option<NonNull<BlockHeader>> {
        let current = NonNull::new(self.cursor)?;
        // Safety: iter()'s contract keeps the chain intact.
        self.cursor = unsafe { (*current.as_ptr()).next };
        Some(current)
    }
}

/// Whether `b` starts exactly where `a`'s payload ends.
#[inline]
pub(crate) fn physically_adjacent(a: NonNull<BlockHeader>, b: NonNull<BlockHeader>) -> bool {
    // Safety: caller holds the pool lock; both headers are live.
    let a_size = unsafe { (*a.as_ptr()).size };
    a.as_ptr() as usize + HEADER_SIZE + a_size == b.as_ptr() as usize
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::heap::block::Strategy;

    /// Carve `count` contiguous free headers with `payload` bytes each out
    /// of an owned buffer. Returns the buffer (kept alive) and the headers.
    fn carve(count: usize, payload: usize) -> (Vec<u8>, Vec<NonNull<BlockHeader>>) {
        let stride = HEADER_SIZE + payload;
        let mut buf = vec![0u8; count * stride + 16];
        let base = (buf.as_mut_ptr() as usize + 15) & !15;
        let mut headers = Vec::with_capacity(count);
        for i in 0..count {
            let ptr = NonNull::new((base + i * stride) as *mut u8).unwrap();
            // Safety: Test code; offsets stay inside buf.
            headers.push(unsafe { BlockHeader::init(ptr, stride, Strategy::BestFit) });
        }
        (buf, headers)
    }

    #[test]
    fn test_size_index_lower_bound() {
        let (_buf, headers) = carve(3, 64);
        let mut index = SizeIndex::new();
        index.insert(64, headers[0]);
        index.insert(128, headers[1]);
        index.insert(256, headers[2]);

        assert_eq!(index.smallest_at_least(1), Some(headers[0]));
        assert_eq!(index.smallest_at_least(65), Some(headers[1]));
        assert_eq!(index.smallest_at_least(128), Some(headers[1]));
        assert_eq!(index.smallest_at_least(200), Some(headers[2]));
        assert_eq!(index.smallest_at_least(257), None);
    }

    #[test]
    fn test_size_index_ties_break_by_address() {
        let (_buf, headers) = carve(3, 64);
        let mut index = SizeIndex::new();
        // Same size, increasing addresses; insertion order scrambled.
        index.insert(64, headers[2]);
        index.insert(64, headers[0]);
        index.insert(64, headers[1]);

        assert_eq!(index.smallest_at_least(64), Some(headers[0]));
        index.remove(64, headers[0]);
        assert_eq!(index.smallest_at_least(64), Some(headers[1]));
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn test_free_list_insert_is_address_ordered() {
        let (_buf, headers) = carve(4, 32);
        let mut list = FreeList::new();

        // Insert out of order.
        // Safety: Test code.
        unsafe {
            list.insert(headers[2]);
            list.insert(headers[0]);
            list.insert(headers[3]);
            list.insert(headers[1]);

            let walk: Vec<_> = list.iter().collect();
            assert_eq!(walk, headers);

            // Links are consistent both ways.
            assert!(headers[0].as_ref().prev.is_null());
            assert_eq!(headers[1].as_ref().prev, headers[0].as_ptr());
            assert_eq!(headers[2].as_ref().next, headers[3].as_ptr());
            assert!(headers[3].as_ref().next.is_null());
        }
    }

    #[test]
    fn test_free_list_detach_middle_and_ends() {
        let (_buf, headers) = carve(3, 32);
        let mut list = FreeList::new();
        // Safety: Test code.
        unsafe {
            for &h in &headers {
                list.insert(h);
            }

            list.detach(headers[1]);
            let walk: Vec<_> = list.iter().collect();
            assert_eq!(walk, vec![headers[0], headers[2]]);
            assert!(headers[1].as_ref().next.is_null());
            assert!(headers[1].as_ref().prev.is_null());

            list.detach(headers[0]);
            assert_eq!(list.iter().next(), Some(headers[2]));

            list.detach(headers[2]);
            assert_eq!(list.len(), 0);
            assert!(list.iter().next().is_none());
        }
    }

    #[test]
    fn test_physical_adjacency() {
        let (_buf, headers) = carve(2, 32);
        assert!(physically_adjacent(headers[0], headers[1]));
        assert!(!physically_adjacent(headers[1], headers[0]));
    }

    #[test]
    fn test_contains_tracks_membership() {
        let (_buf, headers) = carve(2, 32);
        let mut list = FreeList::new();
        let addr = headers[0].as_ptr() as usize;
        assert!(!list.contains(addr));
        // Safety: Test code.
        unsafe {
            list.insert(headers[0]);
            assert!(list.contains(addr));
            list.detach(headers[0]);
        }
        assert!(!list.contains(addr));
    }
}
