use super::backing::AllocError;
use super::block::{Strategy, ALIGNMENT};
use super::pool::Pool;
use std::marker::PhantomData;
use std::mem;
use std::ptr::NonNull;

/// Typed per-element adapter over a [`Pool`].
///
/// Element arrays route through the core allocator: types without drop
/// glue of at most 256 bytes take the fixed-size path, everything else
/// goes best fit. Two adapters compare equal when they wrap the same pool,
/// so containers can exchange memory between them.
///
/// Types whose alignment exceeds the pool's 16-byte payload alignment are
/// not supported through this adapter; use
/// [`Pool::allocate_aligned`] directly.
pub struct PoolAdapter<'p, T> {
    pool: &'p Pool,
    _marker: PhantomData<fn(T) -> T>,
}

impl<'p, T> PoolAdapter<'p, T> {
    pub fn new(pool: &'p Pool) -> Self {
        debug_assert!(
            mem::align_of::<T>() <= ALIGNMENT,
            "element alignment {} exceeds pool payload alignment",
            mem::align_of::<T>(),
        );
        Self {
            pool,
            _marker: PhantomData,
        }
    }

    #[inline]
    pub fn pool(&self) -> &'p Pool {
        self.pool
    }

    fn strategy() -> Strategy {
        // needs_drop is the Rust spelling of "trivially destructible".
        if !mem::needs_drop::<T>() && mem::size_of::<T>() <= 256 {
            Strategy::FixedSize
        } else {
            Strategy::BestFit
        }
    }

    /// Allocate uninitialized storage for `n` elements.
    ///
    /// # Errors
    /// `TooLarge` when `n * size_of::<T>()` overflows, otherwise the
    /// underlying [`Pool::allocate_with`] errors.
    pub fn allocate(&self, n: usize) -> Result<NonNull<T>, AllocError> {
        let bytes = mem::size_of::<T>()
            .checked_mul(n)
            .ok_or(AllocError::TooLarge { size: n })?;
        self.pool
            .allocate_with(bytes, Self::strategy())
            .map(NonNull::cast)
    }

    /// Free storage previously returned by [`allocate`](Self::allocate).
    ///
    /// Elements are NOT dropped; callers destroy them first, as with any
    /// raw allocator.
    ///
    /// # Safety
    /// `ptr` must come from this adapter's pool and not be freed yet.
    pub unsafe fn deallocate(&self, ptr: NonNull<T>) {
        // Safety: forwarded contract.
        unsafe { self.pool.deallocate(ptr.cast()) };
    }
}

impl<T> Clone for PoolAdapter<'_, T> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool,
            _marker: PhantomData,
        }
    }
}

impl<T> Copy for PoolAdapter<'_, T> {}

impl<T, U> PartialEq<PoolAdapter<'_, U>> for PoolAdapter<'_, T> {
    fn eq(&self, other: &PoolAdapter<'_, U>) -> bool {
        std::ptr::eq(self.pool, other.pool)
    }
}

impl<T> Eq for PoolAdapter<'_, T> {}
