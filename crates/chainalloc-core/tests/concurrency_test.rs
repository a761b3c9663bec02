#![cfg(target_os = "linux")]
#![allow(unsafe_code)]
//! Shared-instance stress: no two threads may ever hold the same block.

use std::collections::HashSet;
use std::sync::{Arc, Barrier};
use std::thread;

use chainalloc_core::{AllocatorConfig, ChainAllocator};
use parking_lot::Mutex;
use serde_json::json;

const THREADS: usize = 8;
const ROUNDS: usize = 2_000;

struct XorShift64(u64);

impl XorShift64 {
    fn new(seed: u64) -> Self {
        Self(seed.max(1))
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }
}

/// Pointer handed between threads only as an address.
#[derive(Clone, Copy)]
struct Held {
    addr: usize,
    len: usize,
}

fn stamp(held: Held, tag: u8) {
    // SAFETY: held describes a live allocation of `len` bytes owned by the caller.
    unsafe { std::ptr::write_bytes(held.addr as *mut u8, tag, held.len) };
}

fn intact(held: Held, tag: u8) -> bool {
    // SAFETY: as in stamp().
    unsafe { std::slice::from_raw_parts(held.addr as *const u8, held.len) }
        .iter()
        .all(|&b| b == tag)
}

fn run_stress<H, M>(alloc: Arc<ChainAllocator<H, M>>, max_size: usize) -> serde_json::Value
where
    H: chainalloc_core::malloc::HeapSegment + 'static,
    M: chainalloc_core::malloc::PageMapper + 'static,
{
    let outstanding: Arc<Mutex<HashSet<usize>>> = Arc::new(Mutex::new(HashSet::new()));
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let alloc = Arc::clone(&alloc);
            let outstanding = Arc::clone(&outstanding);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let tag = t as u8 + 1;
                let mut rng = XorShift64::new(0x9E37_79B9_7F4A_7C15 ^ t as u64);
                let mut held: Vec<Held> = Vec::new();
                let mut failures = 0usize;
                barrier.wait();
                for _ in 0..ROUNDS {
                    let r = rng.next_u64();
                    if r % 3 != 0 || held.is_empty() {
                        let len = (r >> 16) as usize % max_size + 1;
                        let Ok(ptr) = alloc.allocate(len) else {
                            failures += 1;
                            continue;
                        };
                        let h = Held {
                            addr: ptr.as_ptr() as usize,
                            len,
                        };
                        assert!(
                            outstanding.lock().insert(h.addr),
                            "block {:#x} handed out twice",
                            h.addr
                        );
                        stamp(h, tag);
                        held.push(h);
                    } else {
                        let h = held.swap_remove((r >> 8) as usize % held.len());
                        assert!(intact(h, tag), "block {:#x} overwritten", h.addr);
                        assert!(outstanding.lock().remove(&h.addr));
                        alloc.release(h.addr as *mut u8).unwrap();
                    }
                }
                for h in held {
                    assert!(intact(h, tag), "block {:#x} overwritten", h.addr);
                    outstanding.lock().remove(&h.addr);
                    alloc.release(h.addr as *mut u8).unwrap();
                }
                failures
            })
        })
        .collect();

    let failures: usize = handles
        .into_iter()
        .map(|h| h.join().expect("stress thread panicked"))
        .sum();
    let stats = alloc.stats();
    assert_eq!(stats.live_blocks, 0);
    assert_eq!(stats.blocks, stats.free_blocks);

    json!({
        "threads": THREADS,
        "rounds": ROUNDS,
        "blocks": stats.blocks,
        "reuse_hits": stats.reuse_hits,
        "heap_blocks": stats.heap_blocks,
        "mapped_blocks": stats.mapped_blocks,
        "remainder_blocks": stats.remainder_blocks,
        "failures": failures,
    })
}

#[test]
fn shared_instance_never_aliases_with_system_backends() {
    let alloc = Arc::new(ChainAllocator::new());
    let report = run_stress(alloc, 1024);
    assert_eq!(report["failures"], 0);
    assert!(report["reuse_hits"].as_u64().unwrap() > 0, "report: {report}");
}

#[test]
fn shared_instance_never_aliases_across_backends() {
    let config = AllocatorConfig::new().page_size(4096);
    let alloc = Arc::new(ChainAllocator::buffered(config, 4 << 20, 64 << 20));
    let report = run_stress(alloc, 3 * 4096);
    assert!(report["mapped_blocks"].as_u64().unwrap() > 0, "report: {report}");
    assert!(report["heap_blocks"].as_u64().unwrap() > 0, "report: {report}");
}

#[test]
fn concurrent_double_release_is_detected_once() {
    let alloc = Arc::new(ChainAllocator::buffered(AllocatorConfig::new(), 1 << 16, 0));
    let ptr = alloc.allocate(64).unwrap();
    let addr = ptr.as_ptr() as usize;
    let barrier = Arc::new(Barrier::new(4));
    let oks: usize = (0..4)
        .map(|_| {
            let alloc = Arc::clone(&alloc);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                usize::from(alloc.release(addr as *mut u8).is_ok())
            })
        })
        .collect::<Vec<_>>()
        .into_iter()
        .map(|h| h.join().unwrap())
        .sum();
    assert_eq!(oks, 1, "exactly one release may succeed");
}
