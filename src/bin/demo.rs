//! Strategy walkthrough: exercises each allocation tier, the scope
//! facility and the typed adapter, printing the merged statistics between
//! phases.

use std::time::Instant;
use strata::{stats, with_default_pool, Pool, PoolAdapter, Strategy};

fn print_stats(label: &str) {
    stats::merge_thread_stats();
    let snapshot = stats::snapshot();
    println!("{label}:");
    println!("  total allocations:   {}", snapshot.total_allocations);
    println!("  total deallocations: {}", snapshot.total_deallocations);
    println!("  outstanding bytes:   {}", snapshot.total_bytes);
    println!("----------------------------------------");
}

fn main() {
    print_stats("Initial stats");

    // Fixed-size tier: LIFO magazine reuse.
    {
        println!("Fixed-size allocation:");
        let pool = Pool::new().expect("pool construction failed");
        let p1 = pool.allocate(24).expect("alloc failed");
        let p2 = pool.allocate(24).expect("alloc failed");
        // Safety: both payloads are live and at least 24 bytes.
        unsafe {
            p1.as_ptr().write_bytes(0xA1, 24);
            p2.as_ptr().write_bytes(0xA2, 24);
            pool.deallocate(p1);
            pool.deallocate(p2);
        }
        let p3 = pool.allocate(24).expect("alloc failed");
        println!("  reused freed block: {}", p3 == p2);
        // Safety: p3 is live.
        unsafe { pool.deallocate(p3) };
        pool.release_thread_cache();
        print_stats("After fixed-size phase");
    }

    // Best-fit, pool-based and segregated strategies on the default pool.
    with_default_pool(|pool| {
        println!("Best-fit allocation:");
        pool.begin_scope();
        let p1 = pool.allocate(640).expect("alloc failed");
        let p2 = pool.allocate(1280).expect("alloc failed");
        // Safety: scope members are live until end_scope.
        unsafe {
            println!("  640  -> usable {}", Pool::usable_size(p1));
            println!("  1280 -> usable {}", Pool::usable_size(p2));
        }
        pool.end_scope();
        print_stats("After best-fit scope");

        println!("Pool-based allocation:");
        pool.begin_scope();
        let _ = pool
            .allocate_with(2048, Strategy::Pool)
            .expect("alloc failed");
        let _ = pool
            .allocate_with(2048, Strategy::Pool)
            .expect("alloc failed");
        pool.end_scope();
        print_stats("After pool-based scope");

        println!("Segregated allocation:");
        pool.begin_scope();
        let p5 = pool
            .allocate_with(256, Strategy::Segregated)
            .expect("alloc failed");
        let p6 = pool
            .allocate_with(512, Strategy::Segregated)
            .expect("alloc failed");
        // Safety: scope members are live until end_scope.
        unsafe {
            println!("  256 -> class {}", Pool::usable_size(p5));
            println!("  512 -> class {}", Pool::usable_size(p6));
        }
        pool.end_scope();
        print_stats("After segregated scope");

        println!("Aligned allocation:");
        let pa = pool.allocate_aligned(100, 64).expect("alloc failed");
        println!("  100 @ 64 -> address multiple of 64: {}", pa.as_ptr() as usize % 64 == 0);
        // Safety: pa came from allocate_aligned and is live.
        unsafe { pool.deallocate_aligned(pa) };
        print_stats("After aligned phase");
    });

    // Typed adapter growing a manual array.
    with_default_pool(|pool| {
        println!("Typed adapter:");
        let adapter = PoolAdapter::<u32>::new(pool);
        let started = Instant::now();

        let mut capacity = 4usize;
        let mut len = 0usize;
        let mut buf = adapter.allocate(capacity).expect("alloc failed");
        for i in 0..1000u32 {
            if len == capacity {
                let bigger = adapter.allocate(capacity * 2).expect("alloc failed");
                // Safety: both buffers are live; len elements initialized.
                unsafe {
                    std::ptr::copy_nonoverlapping(buf.as_ptr(), bigger.as_ptr(), len);
                    adapter.deallocate(buf);
                }
                buf = bigger;
                capacity *= 2;
            }
            // Safety: len < capacity.
            unsafe { buf.as_ptr().add(len).write(i) };
            len += 1;
        }
        // Safety: elements 0..len are initialized.
        let sum: u64 = unsafe {
            (0..len).map(|i| u64::from(buf.as_ptr().add(i).read())).sum()
        };
        // Safety: buf is live.
        unsafe { adapter.deallocate(buf) };

        println!(
            "  pushed 1000 u32s (sum {sum}) in {} us",
            started.elapsed().as_micros()
        );
        pool.release_thread_cache();
        print_stats("After adapter phase");
    });

    print_stats("Final stats");
}
