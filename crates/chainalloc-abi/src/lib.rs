// Exported C entrypoints take raw pointers from C callers; their contract is
// the POSIX one and is documented once in `malloc_abi`.
#![allow(clippy::missing_safety_doc)]
//! # chainalloc-abi
//!
//! `extern "C"` `malloc`, `calloc` and `free` over one process-wide
//! [`ChainAllocator`](chainalloc_core::ChainAllocator).
//!
//! The release build exports unmangled symbols, so the resulting
//! `libchainalloc_abi.so` can be injected with `LD_PRELOAD`. `realloc` is not
//! provided: programs that call it keep using the native allocator for those
//! calls and must not mix the two.
//!
//! ```text
//! C caller -> ABI entry (this crate) -> reentry guard -> ChainAllocator -> sbrk/mmap
//!                                    \-> native __libc_* (reentrant calls)
//! ```

mod allocator_state;

pub use allocator_state::{abi_counters_for_tests, global_stats};

// Gated behind cfg(not(test)): the release build exports `malloc`/`free`
// unmangled, which would replace the allocator of this crate's own unit-test
// binary.
#[cfg(not(test))]
pub mod malloc_abi;
