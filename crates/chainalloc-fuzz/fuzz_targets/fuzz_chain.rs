#![no_main]
//! Random allocate / zero_allocate / release sequences against a small
//! buffered instance. Checks ownership, zeroing, double-release detection and
//! that no two live blocks overlap.

use chainalloc_core::{AllocError, AllocatorConfig, ChainAllocator};
use libfuzzer_sys::fuzz_target;

const PAGE: usize = 256;

struct Live {
    addr: usize,
    len: usize,
    tag: u8,
}

fn check(live: &Live) {
    // SAFETY: live blocks stay owned by this loop until released.
    let bytes = unsafe { std::slice::from_raw_parts(live.addr as *const u8, live.len) };
    assert!(bytes.iter().all(|&b| b == live.tag), "block {:#x} corrupted", live.addr);
}

fuzz_target!(|data: &[u8]| {
    if data.len() < 3 {
        return;
    }

    let alloc = ChainAllocator::buffered(AllocatorConfig::new().page_size(PAGE), 1 << 14, 1 << 16);
    let mut live: Vec<Live> = Vec::new();
    let mut released: Vec<usize> = Vec::new();

    for (i, chunk) in data.chunks_exact(3).enumerate() {
        let arg = usize::from(u16::from_le_bytes([chunk[1], chunk[2]]));
        let tag = (i % 251) as u8 + 1;
        match chunk[0] % 4 {
            0 => {
                let len = arg % (3 * PAGE) + 1;
                if let Ok(ptr) = alloc.allocate(len) {
                    let addr = ptr.as_ptr() as usize;
                    released.retain(|&a| a != addr);
                    // SAFETY: fresh allocation of len bytes.
                    unsafe { std::ptr::write_bytes(ptr.as_ptr(), tag, len) };
                    live.push(Live { addr, len, tag });
                }
            }
            1 => {
                let (n, sz) = (arg % 16 + 1, usize::from(chunk[2] % 32) + 1);
                if let Ok(ptr) = alloc.zero_allocate(n, sz) {
                    let addr = ptr.as_ptr() as usize;
                    released.retain(|&a| a != addr);
                    // SAFETY: fresh allocation of n * sz bytes.
                    let bytes = unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), n * sz) };
                    assert!(bytes.iter().all(|&b| b == 0), "zero_allocate not zeroed");
                    bytes.fill(tag);
                    live.push(Live { addr, len: n * sz, tag });
                }
            }
            2 if !live.is_empty() => {
                let victim = live.swap_remove(arg % live.len());
                check(&victim);
                alloc.release(victim.addr as *mut u8).unwrap();
                released.push(victim.addr);
            }
            _ => {
                if let Some(&addr) = released.last() {
                    assert_eq!(
                        alloc.release(addr as *mut u8),
                        Err(AllocError::DoubleRelease { addr })
                    );
                }
            }
        }
    }

    let mut spans: Vec<(usize, usize)> = live.iter().map(|l| (l.addr, l.addr + l.len)).collect();
    spans.sort_unstable();
    for pair in spans.windows(2) {
        assert!(pair[0].1 <= pair[1].0, "live blocks overlap: {pair:?}");
    }
    for l in &live {
        check(l);
    }
    assert_eq!(alloc.stats().live_blocks, live.len());
});
