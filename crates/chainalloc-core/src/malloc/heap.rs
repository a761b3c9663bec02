//! Heap-growth backend.
//!
//! Serves requests with `HEADER_SIZE + size < page_size` by pushing the
//! program break forward by exactly `HEADER_SIZE + size` bytes.

#![allow(unsafe_code)]

use parking_lot::Mutex;

use super::chain::Block;
use super::error::{AllocError, Backend};
use super::header::{HEADER_SIZE, Origin};

/// A contiguous, grow-only memory segment.
///
/// # Safety
///
/// On success `extend(len)` must return the address of `len` bytes that are
/// valid for reads and writes, not handed out before, and that stay valid for
/// as long as the implementor is alive.
pub unsafe trait HeapSegment: Send {
    /// Grows the segment by `len` bytes and returns the start of the new bytes.
    ///
    /// Errors carry the errno describing why the segment could not grow.
    fn extend(&mut self, len: usize) -> Result<usize, i32>;
}

// The program break is process-wide state: every SbrkSegment, in every
// allocator instance, moves it under this lock. Other sbrk callers in the
// process, glibc's main arena included, do not take it.
static SBRK_LOCK: Mutex<()> = parking_lot::const_mutex(());

/// The process data segment, grown with `sbrk`.
///
/// Each `extend` owns exactly the bytes its own `sbrk` call returned. When the
/// system allocator also grows the break, consecutive extents need not be
/// adjacent.
#[derive(Debug, Default)]
pub struct SbrkSegment {
    _private: (),
}

impl SbrkSegment {
    #[must_use]
    pub const fn new() -> Self {
        Self { _private: () }
    }
}

// SAFETY: sbrk returns the previous break; the `len` bytes after it are newly
// owned by the caller and the data segment is never shrunk by this crate.
unsafe impl HeapSegment for SbrkSegment {
    fn extend(&mut self, len: usize) -> Result<usize, i32> {
        let Ok(increment) = libc::intptr_t::try_from(len) else {
            return Err(libc::ENOMEM);
        };
        let _guard = SBRK_LOCK.lock();
        // SAFETY: growing the break has no memory-safety preconditions.
        let prev = unsafe { libc::sbrk(increment) };
        if prev as isize == -1 {
            return Err(last_errno());
        }
        Ok(prev as usize)
    }
}

pub(crate) fn last_errno() -> i32 {
    std::io::Error::last_os_error()
        .raw_os_error()
        .unwrap_or(libc::ENOMEM)
}

/// Obtains a fresh in-use block of `size` payload bytes from `segment`.
pub(crate) fn grow_block<H: HeapSegment>(segment: &mut H, size: usize) -> Result<Block, AllocError> {
    let exhausted = |errno| AllocError::ResourceExhausted {
        backend: Backend::HeapSegment,
        size,
        errno,
    };
    let total = HEADER_SIZE.checked_add(size).ok_or(exhausted(libc::ENOMEM))?;
    let region = segment.extend(total).map_err(exhausted)?;
    Ok(Block::new(region, size, false, Origin::HeapSegment))
}
