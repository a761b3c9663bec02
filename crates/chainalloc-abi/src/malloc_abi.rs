//! ABI layer for `malloc`, `calloc` and `free`.
//!
//! Every entrypoint takes a thread-local reentry guard first. The allocator
//! itself allocates (arena growth, the pointer index, the instance on first
//! use); those nested calls arrive here with the guard held and are served by
//! the native glibc allocator instead of recursing into the chain lock.
//!
//! Contract violations (zero sizes, double free) follow
//! `CHAINALLOC_ON_VIOLATION`: abort by default, or log, set `errno` and carry
//! on. Exhaustion returns null with `errno = ENOMEM`.

use std::cell::Cell;
use std::ffi::{c_int, c_void};

use chainalloc_core::AllocError;
use chainalloc_core::config::runtime_violation_mode;

use crate::allocator_state::{note_native_fallback, note_violation, try_global_allocator};

unsafe extern "C" {
    #[link_name = "__libc_malloc@GLIBC_2.2.5"]
    fn native_libc_malloc_sym(size: usize) -> *mut c_void;
    #[link_name = "__libc_calloc@GLIBC_2.2.5"]
    fn native_libc_calloc_sym(nmemb: usize, size: usize) -> *mut c_void;
    #[link_name = "__libc_free@GLIBC_2.2.5"]
    fn native_libc_free_sym(ptr: *mut c_void);
}

#[inline]
unsafe fn native_libc_malloc(size: usize) -> *mut c_void {
    note_native_fallback();
    // SAFETY: direct call to libc allocator symbol.
    unsafe { native_libc_malloc_sym(size) }
}

#[inline]
unsafe fn native_libc_calloc(nmemb: usize, size: usize) -> *mut c_void {
    note_native_fallback();
    // SAFETY: direct call to libc allocator symbol.
    unsafe { native_libc_calloc_sym(nmemb, size) }
}

#[inline]
unsafe fn native_libc_free(ptr: *mut c_void) {
    // SAFETY: direct call to libc allocator symbol.
    unsafe { native_libc_free_sym(ptr) }
}

#[inline]
unsafe fn set_abi_errno(val: c_int) {
    // SAFETY: __errno_location returns this thread's errno slot.
    unsafe { *libc::__errno_location() = val };
}

thread_local! {
    static ALLOCATOR_REENTRY_DEPTH: Cell<u32> = const { Cell::new(0) };
}

struct AllocatorReentryGuard;

impl Drop for AllocatorReentryGuard {
    fn drop(&mut self) {
        ALLOCATOR_REENTRY_DEPTH.with(|depth| {
            let current = depth.get();
            depth.set(current.saturating_sub(1));
        });
    }
}

#[inline]
fn enter_allocator_reentry_guard() -> Option<AllocatorReentryGuard> {
    ALLOCATOR_REENTRY_DEPTH.with(|depth| {
        let current = depth.get();
        if current > 0 {
            None
        } else {
            depth.set(current + 1);
            Some(AllocatorReentryGuard)
        }
    })
}

/// Applies the violation policy, then reports `err` through `errno`.
fn contract_violation(symbol: &str, err: &AllocError) {
    note_violation();
    if runtime_violation_mode().aborts() {
        log::error!("{symbol}: {err}; aborting");
        std::process::abort();
    }
    log::warn!("{symbol}: {err}; ignored");
    // SAFETY: writing this thread's errno.
    unsafe { set_abi_errno(err.errno()) };
}

/// Maps a core result onto the C return convention.
fn finish_allocation(symbol: &str, result: Result<std::ptr::NonNull<u8>, AllocError>) -> *mut c_void {
    match result {
        Ok(ptr) => ptr.as_ptr().cast(),
        Err(err) if err.is_contract_violation() => {
            contract_violation(symbol, &err);
            std::ptr::null_mut()
        }
        Err(_) => {
            // SAFETY: writing this thread's errno.
            unsafe { set_abi_errno(libc::ENOMEM) };
            std::ptr::null_mut()
        }
    }
}

// ---------------------------------------------------------------------------
// malloc
// ---------------------------------------------------------------------------

/// POSIX `malloc` -- allocates `size` bytes of uninitialized memory.
///
/// Returns null with `errno = ENOMEM` when neither backend can supply the
/// block. `size == 0` is a contract violation.
///
/// # Safety
///
/// Caller must eventually `free` the returned pointer exactly once.
#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn malloc(size: usize) -> *mut c_void {
    let Some(_reentry_guard) = enter_allocator_reentry_guard() else {
        // SAFETY: reentrant path bypasses the chain to avoid allocator recursion.
        return unsafe { native_libc_malloc(size.max(1)) };
    };

    match try_global_allocator() {
        Some(allocator) => finish_allocation("malloc", allocator.allocate(size)),
        None => {
            // SAFETY: allocator bootstrap on another thread falls back to libc.
            unsafe { native_libc_malloc(size.max(1)) }
        }
    }
}

// ---------------------------------------------------------------------------
// free
// ---------------------------------------------------------------------------

/// POSIX `free` -- marks the block behind `ptr` free for reuse.
///
/// Null is a no-op. Pointers the chain does not own were handed out by the
/// native fallback and are returned to it.
///
/// # Safety
///
/// `ptr` must be null or have been returned by `malloc`/`calloc` and not freed
/// since.
#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn free(ptr: *mut c_void) {
    let Some(_reentry_guard) = enter_allocator_reentry_guard() else {
        // SAFETY: reentrant path bypasses the chain to avoid allocator recursion.
        unsafe { native_libc_free(ptr) };
        return;
    };

    if ptr.is_null() {
        return;
    }

    let Some(allocator) = try_global_allocator() else {
        // SAFETY: allocator bootstrap falls back to libc.
        unsafe { native_libc_free(ptr) };
        return;
    };

    match allocator.release(ptr.cast()) {
        Ok(()) => {}
        Err(AllocError::UnknownPointer { .. }) => {
            // SAFETY: not a chain payload, so it came from the native fallback.
            unsafe { native_libc_free(ptr) };
        }
        Err(err) => contract_violation("free", &err),
    }
}

// ---------------------------------------------------------------------------
// calloc
// ---------------------------------------------------------------------------

/// POSIX `calloc` -- allocates `nmemb * size` zeroed bytes.
///
/// A zero count or size, or a product that overflows, is a contract violation.
///
/// # Safety
///
/// Caller must eventually `free` the returned pointer exactly once.
#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn calloc(nmemb: usize, size: usize) -> *mut c_void {
    let Some(_reentry_guard) = enter_allocator_reentry_guard() else {
        // SAFETY: reentrant path bypasses the chain to avoid allocator recursion.
        return unsafe { native_libc_calloc(nmemb.max(1), size.max(1)) };
    };

    match try_global_allocator() {
        Some(allocator) => finish_allocation("calloc", allocator.zero_allocate(nmemb, size)),
        None => {
            // SAFETY: allocator bootstrap on another thread falls back to libc.
            unsafe { native_libc_calloc(nmemb.max(1), size.max(1)) }
        }
    }
}
