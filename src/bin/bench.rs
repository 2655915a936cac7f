//! Workload benchmark harness.
//!
//! Drives a shared pool with preset allocation workloads and emits one CSV
//! row per (workload, thread count) combination:
//!
//! ```text
//! bench [--ops=N] [--threads=n1,n2,...] [--workloads=name,...]
//!       [--seed=S] [--no-header]
//! ```

use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use strata::{stats, Pool};

#[derive(Clone)]
struct WorkloadSpec {
    name: &'static str,
    sizes: &'static [usize],
    weights: &'static [f64],
    alloc_prob: f64,
    max_live: usize,
    alignment: usize,
}

struct AllocationRecord {
    ptr: NonNull<u8>,
    requested: usize,
    usable: usize,
    aligned: bool,
}

#[derive(Default)]
struct ThreadStats {
    ops: u64,
    alloc_ops: u64,
    free_ops: u64,
    total_requested: u64,
    total_usable: u64,
    live_requested: u64,
    live_usable: u64,
    peak_live_requested: u64,
    peak_live_usable: u64,
    alloc_samples: Vec<u64>,
    free_samples: Vec<u64>,
}

/// SplitMix64: small, seedable, good enough for workload shaping.
struct Rng {
    state: u64,
}

impl Rng {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next(&mut self) -> u64 {
        self.state = self.state.wrapping_add(0x9E37_79B9_7F4A_7C15);
        let mut z = self.state;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^ (z >> 31)
    }

    /// Uniform in [0, 1).
    fn next_f64(&mut self) -> f64 {
        (self.next() >> 11) as f64 * (1.0 / (1u64 << 53) as f64)
    }

    /// Index into `weights` drawn proportionally to the weights.
    fn pick_weighted(&mut self, weights: &[f64]) -> usize {
        let total: f64 = weights.iter().sum();
        let mut roll = self.next_f64() * total;
        for (i, w) in weights.iter().enumerate() {
            if roll < *w {
                return i;
            }
            roll -= w;
        }
        weights.len() - 1
    }
}

fn default_workloads() -> Vec<WorkloadSpec> {
    vec![
        WorkloadSpec {
            name: "rl_small",
            sizes: &[16, 32, 64, 128, 256, 512],
            weights: &[0.25, 0.25, 0.2, 0.15, 0.1, 0.05],
            alloc_prob: 0.65,
            max_live: 4096,
            alignment: 0,
        },
        WorkloadSpec {
            name: "rl_medium",
            sizes: &[128, 256, 512, 1024, 2048, 4096],
            weights: &[0.2, 0.25, 0.25, 0.15, 0.1, 0.05],
            alloc_prob: 0.6,
            max_live: 2048,
            alignment: 0,
        },
        WorkloadSpec {
            name: "fragmentation_mix",
            sizes: &[16, 32, 64, 128, 256, 512, 1024, 2048, 4096],
            weights: &[0.1, 0.1, 0.1, 0.12, 0.12, 0.12, 0.12, 0.12, 0.1],
            alloc_prob: 0.55,
            max_live: 8192,
            alignment: 0,
        },
        WorkloadSpec {
            name: "alignment64",
            sizes: &[64, 128, 256, 512, 1024],
            weights: &[0.35, 0.25, 0.2, 0.15, 0.05],
            alloc_prob: 0.6,
            max_live: 2048,
            alignment: 64,
        },
    ]
}

fn parse_int_list(value: &str) -> Vec<usize> {
    value
        .split(',')
        .filter(|s| !s.is_empty())
        .map(|s| s.parse().unwrap_or_else(|_| panic!("bad integer '{s}'")))
        .collect()
}

fn parse_string_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

fn percentile_ns(samples: &mut [u64], pct: f64) -> u64 {
    if samples.is_empty() {
        return 0;
    }
    samples.sort_unstable();
    let index = ((pct / 100.0) * (samples.len() - 1) as f64) as usize;
    samples[index]
}

/// Only every 1024th operation is timed, keeping clock reads off the
/// common path.
const SAMPLE_MASK: u64 = 1023;

fn run_thread(
    pool: &Pool,
    spec: &WorkloadSpec,
    ops: u64,
    seed: u64,
    ready: &AtomicUsize,
    start: &AtomicBool,
) -> ThreadStats {
    let mut stats = ThreadStats {
        alloc_samples: Vec::with_capacity((ops / 1024) as usize),
        free_samples: Vec::with_capacity((ops / 1024) as usize),
        ..ThreadStats::default()
    };

    let mut rng = Rng::new(seed);
    let mut live: Vec<AllocationRecord> = Vec::with_capacity(spec.max_live / 4);

    ready.fetch_add(1, Ordering::Relaxed);
    while !start.load(Ordering::Acquire) {
        std::thread::yield_now();
    }

    for _ in 0..ops {
        let can_alloc = live.len() < spec.max_live;
        let can_free = !live.is_empty();
        let do_alloc = can_alloc && (rng.next_f64() < spec.alloc_prob || !can_free);

        if do_alloc {
            let size = spec.sizes[rng.pick_weighted(spec.weights)];
            let aligned = spec.alignment > 0;
            let sample = (rng.next() & SAMPLE_MASK) == 0;
            let start_time = sample.then(Instant::now);

            let result = if aligned {
                pool.allocate_aligned(size, spec.alignment)
            } else {
                pool.allocate(size)
            };
            let Ok(ptr) = result else {
                continue;
            };

            if let Some(t) = start_time {
                stats.alloc_samples.push(t.elapsed().as_nanos() as u64);
            }

            // Safety: ptr was just returned by the pool; aligned pointers
            // resolve through their stored origin.
            let usable = unsafe {
                if aligned {
                    Pool::usable_size(Pool::original_payload(ptr))
                } else {
                    Pool::usable_size(ptr)
                }
            } as u64;

            live.push(AllocationRecord {
                ptr,
                requested: size,
                usable: usable as usize,
                aligned,
            });
            stats.alloc_ops += 1;
            stats.total_requested += size as u64;
            stats.total_usable += usable;
            stats.live_requested += size as u64;
            stats.live_usable += usable;
            stats.peak_live_requested = stats.peak_live_requested.max(stats.live_requested);
            stats.peak_live_usable = stats.peak_live_usable.max(stats.live_usable);
        } else {
            let index = rng.next() as usize % live.len();
            let record = live.swap_remove(index);
            let sample = (rng.next() & SAMPLE_MASK) == 0;
            let start_time = sample.then(Instant::now);

            // Safety: the record holds a live pointer from this pool.
            unsafe {
                if record.aligned {
                    pool.deallocate_aligned(record.ptr);
                } else {
                    pool.deallocate(record.ptr);
                }
            }

            if let Some(t) = start_time {
                stats.free_samples.push(t.elapsed().as_nanos() as u64);
            }

            stats.free_ops += 1;
            stats.live_requested -= record.requested as u64;
            stats.live_usable -= record.usable as u64;
        }

        stats.ops += 1;
    }

    for record in live {
        // Safety: every remaining record is live.
        unsafe {
            if record.aligned {
                pool.deallocate_aligned(record.ptr);
            } else {
                pool.deallocate(record.ptr);
            }
        }
    }
    stats.live_requested = 0;
    stats.live_usable = 0;

    stats
}

fn print_csv_header() {
    println!(
        "allocator,workload,threads,ops_per_thread,total_ops,seconds,throughput_ops_s,\
         alloc_p50_ns,alloc_p99_ns,free_p50_ns,free_p99_ns,avg_overhead_ratio,\
         peak_live_requested,peak_live_usable,alignment"
    );
}

fn main() {
    let mut ops_per_thread: u64 = 200_000;
    let mut thread_counts: Vec<usize> = vec![1, 2, 4, 8];
    let mut workload_names: Vec<String> = Vec::new();
    let mut seed: u64 = 42;
    let mut print_header = true;

    for arg in std::env::args().skip(1) {
        if let Some(v) = arg.strip_prefix("--ops=") {
            ops_per_thread = v.parse().expect("bad --ops value");
        } else if let Some(v) = arg.strip_prefix("--threads=") {
            thread_counts = parse_int_list(v);
        } else if let Some(v) = arg.strip_prefix("--workloads=") {
            workload_names = parse_string_list(v);
        } else if let Some(v) = arg.strip_prefix("--seed=") {
            seed = v.parse().expect("bad --seed value");
        } else if arg == "--no-header" {
            print_header = false;
        } else {
            eprintln!("unknown argument: {arg}");
            std::process::exit(2);
        }
    }

    let workloads = default_workloads();
    if workload_names.is_empty() {
        workload_names = workloads.iter().map(|w| w.name.to_owned()).collect();
    }

    if print_header {
        print_csv_header();
    }

    let pool = Arc::new(Pool::new().expect("failed to construct bench pool"));

    for workload_name in &workload_names {
        let Some(spec) = workloads.iter().find(|w| w.name == *workload_name) else {
            eprintln!("Unknown workload: {workload_name}");
            continue;
        };

        for &threads in &thread_counts {
            eprintln!(
                "[bench] start allocator=strata workload={} threads={} ops={}",
                spec.name, threads, ops_per_thread
            );
            let ready = Arc::new(AtomicUsize::new(0));
            let start = Arc::new(AtomicBool::new(false));

            let workers: Vec<_> = (0..threads)
                .map(|t| {
                    let pool = pool.clone();
                    let spec = spec.clone();
                    let ready = ready.clone();
                    let start = start.clone();
                    let thread_seed = seed.wrapping_add(t as u64 * 1_315_423_911);
                    std::thread::spawn(move || {
                        let stats =
                            run_thread(&pool, &spec, ops_per_thread, thread_seed, &ready, &start);
                        pool.release_thread_cache();
                        stats::merge_thread_stats();
                        stats
                    })
                })
                .collect();

            while ready.load(Ordering::Relaxed) < threads {
                std::thread::yield_now();
            }

            let bench_start = Instant::now();
            start.store(true, Ordering::Release);

            let per_thread: Vec<ThreadStats> =
                workers.into_iter().map(|w| w.join().unwrap()).collect();
            let seconds = bench_start.elapsed().as_secs_f64();

            let mut total_ops = 0u64;
            let mut total_alloc_ops = 0u64;
            let mut total_free_ops = 0u64;
            let mut total_requested = 0u64;
            let mut total_usable = 0u64;
            let mut peak_live_requested = 0u64;
            let mut peak_live_usable = 0u64;
            let mut alloc_samples = Vec::new();
            let mut free_samples = Vec::new();

            for stat in &per_thread {
                total_ops += stat.ops;
                total_alloc_ops += stat.alloc_ops;
                total_free_ops += stat.free_ops;
                total_requested += stat.total_requested;
                total_usable += stat.total_usable;
                peak_live_requested = peak_live_requested.max(stat.peak_live_requested);
                peak_live_usable = peak_live_usable.max(stat.peak_live_usable);
                alloc_samples.extend_from_slice(&stat.alloc_samples);
                free_samples.extend_from_slice(&stat.free_samples);
            }

            let throughput = if seconds > 0.0 {
                total_ops as f64 / seconds
            } else {
                0.0
            };
            let overhead_ratio = if total_requested > 0 {
                total_usable as f64 / total_requested as f64
            } else {
                0.0
            };

            let alloc_p50 = percentile_ns(&mut alloc_samples, 50.0);
            let alloc_p99 = percentile_ns(&mut alloc_samples, 99.0);
            let free_p50 = percentile_ns(&mut free_samples, 50.0);
            let free_p99 = percentile_ns(&mut free_samples, 99.0);

            println!(
                "strata,{},{},{},{},{},{},{},{},{},{},{},{},{},{}",
                spec.name,
                threads,
                ops_per_thread,
                total_ops,
                seconds,
                throughput,
                alloc_p50,
                alloc_p99,
                free_p50,
                free_p99,
                overhead_ratio,
                peak_live_requested,
                peak_live_usable,
                spec.alignment
            );

            eprintln!(
                "[bench] done allocator=strata workload={} threads={} seconds={} \
                 throughput_ops_s={} alloc_ops={} free_ops={}",
                spec.name, threads, seconds, throughput, total_alloc_ops, total_free_ops
            );

            pool.reset();
        }
    }
}
