#[cfg(not(target_pointer_width = "64"))]
compile_error!("strata supports only 64-bit targets.");

pub(crate) mod sync;

// public module: contains implementation details (hidden via pub(crate))
// and TEST_MUTEX (public for tests)
pub mod heap;

// allocator surface
pub use heap::adapter::PoolAdapter;
pub use heap::backing::AllocError;
pub use heap::block::{Strategy, ALIGNMENT};
pub use heap::pool::{with_default_pool, ConcurrencyMode, Pool};

// statistics
pub use heap::stats;
