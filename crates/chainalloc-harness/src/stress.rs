//! Shared-instance multi-thread stress.
//!
//! Every worker allocates random sizes, stamps each block with its own tag,
//! and releases blocks in random order. An outstanding-address set, shared by
//! all workers, catches a block handed to two owners at once; the tag check at
//! release catches writes that reached a neighbour's payload.

#![allow(unsafe_code)]

use std::collections::HashSet;
use std::sync::{Arc, Barrier};
use std::time::Instant;

use chainalloc_core::malloc::{HeapSegment, PageMapper};
use chainalloc_core::{AllocatorConfig, AllocatorStats, ChainAllocator};
use parking_lot::Mutex;
use serde::Serialize;

use crate::HarnessError;

/// Which backends the stressed instance uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Fixed in-process budgets: deterministic, isolated from the process heap.
    Buffered,
    /// The real data segment and anonymous mappings.
    System,
}

#[derive(Debug, Clone, Serialize)]
pub struct StressConfig {
    pub threads: usize,
    pub rounds: usize,
    /// Requests are drawn from `1..=max_size`.
    pub max_size: usize,
    pub seed: u64,
    pub backend: BackendKind,
    pub page_size: usize,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            threads: 4,
            rounds: 10_000,
            max_size: 3 * 4096,
            seed: 0xC4A1_A110_C000_0001,
            backend: BackendKind::Buffered,
            page_size: 4096,
        }
    }
}

impl StressConfig {
    fn validate(&self) -> Result<(), HarnessError> {
        if self.threads == 0 || self.rounds == 0 || self.max_size == 0 {
            return Err(HarnessError::InvalidArgument(
                "threads, rounds and max_size must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkerReport {
    pub allocations: u64,
    pub releases: u64,
    pub exhausted: u64,
    pub bytes_requested: u64,
    pub aliasing: u64,
    pub corruption: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StressReport {
    pub config: StressConfig,
    pub duration_ms: u64,
    pub workers: Vec<WorkerReport>,
    pub blocks: usize,
    pub heap_blocks: usize,
    pub mapped_blocks: usize,
    pub remainder_blocks: usize,
    pub reuse_hits: u64,
    pub live_blocks_after: usize,
    pub violations: u64,
}

impl StressReport {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.violations == 0 && self.live_blocks_after == 0
    }
}

/// Deterministic xorshift generator, one per worker.
#[derive(Debug, Clone)]
pub struct XorShift64(u64);

impl XorShift64 {
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self(if seed == 0 { 0x9E37_79B9_7F4A_7C15 } else { seed })
    }

    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }
}

#[derive(Clone, Copy)]
struct Held {
    addr: usize,
    len: usize,
}

fn stamp(held: Held, tag: u8) {
    // SAFETY: held is a live allocation of at least `len` bytes owned by this worker.
    unsafe { std::ptr::write_bytes(held.addr as *mut u8, tag, held.len) };
}

fn intact(held: Held, tag: u8) -> bool {
    // SAFETY: as in stamp().
    unsafe { std::slice::from_raw_parts(held.addr as *const u8, held.len) }
        .iter()
        .all(|&b| b == tag)
}

fn worker<H: HeapSegment, M: PageMapper>(
    allocator: &ChainAllocator<H, M>,
    outstanding: &Mutex<HashSet<usize>>,
    config: &StressConfig,
    index: usize,
) -> WorkerReport {
    let tag = (index % 250) as u8 + 1;
    let mut rng = XorShift64::new(config.seed ^ (index as u64).wrapping_mul(0x9E37_79B9));
    let mut held: Vec<Held> = Vec::new();
    let mut report = WorkerReport::default();

    let give_back = |h: Held, report: &mut WorkerReport| {
        if !intact(h, tag) {
            report.corruption += 1;
        }
        outstanding.lock().remove(&h.addr);
        if allocator.release(h.addr as *mut u8).is_ok() {
            report.releases += 1;
        }
    };

    for _ in 0..config.rounds {
        let r = rng.next_u64();
        if r % 5 < 3 || held.is_empty() {
            let len = (r >> 20) as usize % config.max_size + 1;
            match allocator.allocate(len) {
                Ok(ptr) => {
                    let h = Held {
                        addr: ptr.as_ptr() as usize,
                        len,
                    };
                    if !outstanding.lock().insert(h.addr) {
                        report.aliasing += 1;
                    }
                    stamp(h, tag);
                    held.push(h);
                    report.allocations += 1;
                    report.bytes_requested += len as u64;
                }
                Err(_) => report.exhausted += 1,
            }
        } else {
            let h = held.swap_remove((r >> 8) as usize % held.len());
            give_back(h, &mut report);
        }
    }
    for h in held.drain(..) {
        give_back(h, &mut report);
    }
    report
}

fn run_on<H, M>(allocator: Arc<ChainAllocator<H, M>>, config: &StressConfig) -> (Vec<WorkerReport>, AllocatorStats)
where
    H: HeapSegment + 'static,
    M: PageMapper + 'static,
{
    let outstanding = Arc::new(Mutex::new(HashSet::new()));
    let barrier = Arc::new(Barrier::new(config.threads));
    let handles: Vec<_> = (0..config.threads)
        .map(|index| {
            let allocator = Arc::clone(&allocator);
            let outstanding = Arc::clone(&outstanding);
            let barrier = Arc::clone(&barrier);
            let config = config.clone();
            std::thread::spawn(move || {
                barrier.wait();
                worker(&allocator, &outstanding, &config, index)
            })
        })
        .collect();
    let workers = handles
        .into_iter()
        .map(|h| {
            h.join().unwrap_or_else(|_| WorkerReport {
                corruption: 1,
                ..WorkerReport::default()
            })
        })
        .collect();
    (workers, allocator.stats())
}

/// Runs one stress pass and summarizes it.
pub fn run(config: &StressConfig) -> Result<StressReport, HarnessError> {
    config.validate()?;
    let alloc_config = AllocatorConfig::new().page_size(config.page_size);
    log::info!(
        "stress: {} threads x {} rounds, sizes 1..={}, backend {:?}",
        config.threads,
        config.rounds,
        config.max_size,
        config.backend
    );

    let start = Instant::now();
    let (workers, stats) = match config.backend {
        BackendKind::Buffered => {
            let heap = 64 << 20;
            let mapped = 512 << 20;
            run_on(
                Arc::new(ChainAllocator::buffered(alloc_config, heap, mapped)),
                config,
            )
        }
        BackendKind::System => run_on(Arc::new(ChainAllocator::with_config(alloc_config)), config),
    };
    let duration_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);

    let violations = workers.iter().map(|w| w.aliasing + w.corruption).sum();
    let report = StressReport {
        config: config.clone(),
        duration_ms,
        workers,
        blocks: stats.blocks,
        heap_blocks: stats.heap_blocks,
        mapped_blocks: stats.mapped_blocks,
        remainder_blocks: stats.remainder_blocks,
        reuse_hits: stats.reuse_hits,
        live_blocks_after: stats.live_blocks,
        violations,
    };
    if report.passed() {
        log::info!(
            "stress passed: {} blocks, {} reuse hits in {} ms",
            report.blocks,
            report.reuse_hits,
            report.duration_ms
        );
    } else {
        log::error!("stress failed: {} violations", report.violations);
    }
    Ok(report)
}
