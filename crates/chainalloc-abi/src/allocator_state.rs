//! Process-wide allocator instance behind the C entrypoints.
//!
//! Manual atomic init instead of OnceLock: building the instance allocates,
//! and under LD_PRELOAD that allocation re-enters `malloc` on the same thread,
//! where a OnceLock would wait on itself.

use std::sync::atomic::{AtomicPtr, AtomicU8, AtomicU64, Ordering};

use chainalloc_core::{AllocatorConfig, AllocatorStats, ChainAllocator};

const STATE_UNINIT: u8 = 0;
const STATE_INITIALIZING: u8 = 1;
const STATE_READY: u8 = 2;

static ALLOCATOR_STATE: AtomicU8 = AtomicU8::new(STATE_UNINIT);
static ALLOCATOR_PTR: AtomicPtr<ChainAllocator> = AtomicPtr::new(std::ptr::null_mut());

static VIOLATIONS: AtomicU64 = AtomicU64::new(0);
static NATIVE_FALLBACKS: AtomicU64 = AtomicU64::new(0);

fn ready_instance() -> Option<&'static ChainAllocator> {
    let ptr = ALLOCATOR_PTR.load(Ordering::Acquire);
    // SAFETY: the pointer is published once from Box::into_raw and never freed.
    unsafe { ptr.as_ref() }
}

/// The process-wide allocator.
///
/// Returns `None` while another call on this or any thread is still building
/// it, so the caller can fall through to the native allocator.
pub(crate) fn try_global_allocator() -> Option<&'static ChainAllocator> {
    let state = ALLOCATOR_STATE.load(Ordering::Acquire);

    if state == STATE_READY {
        return ready_instance();
    }

    if state == STATE_INITIALIZING {
        return None;
    }

    if ALLOCATOR_STATE
        .compare_exchange(
            STATE_UNINIT,
            STATE_INITIALIZING,
            Ordering::SeqCst,
            Ordering::Relaxed,
        )
        .is_err()
    {
        return if ALLOCATOR_STATE.load(Ordering::Acquire) == STATE_READY {
            ready_instance()
        } else {
            None
        };
    }

    let allocator = Box::new(ChainAllocator::with_config(AllocatorConfig::from_env()));
    let ptr = Box::into_raw(allocator);
    ALLOCATOR_PTR.store(ptr, Ordering::Release);
    ALLOCATOR_STATE.store(STATE_READY, Ordering::Release);

    ready_instance()
}

pub(crate) fn note_violation() {
    VIOLATIONS.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn note_native_fallback() {
    NATIVE_FALLBACKS.fetch_add(1, Ordering::Relaxed);
}

/// Chain statistics of the process-wide allocator, once it exists.
#[must_use]
pub fn global_stats() -> Option<AllocatorStats> {
    if ALLOCATOR_STATE.load(Ordering::Acquire) != STATE_READY {
        return None;
    }
    ready_instance().map(ChainAllocator::stats)
}

/// `(contract violations reported, calls served by the native allocator)`.
#[must_use]
pub fn abi_counters_for_tests() -> (u64, u64) {
    (
        VIOLATIONS.load(Ordering::Relaxed),
        NATIVE_FALLBACKS.load(Ordering::Relaxed),
    )
}
