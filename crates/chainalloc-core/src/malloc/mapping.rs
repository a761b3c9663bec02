//! Mapping backend.
//!
//! Serves requests with `HEADER_SIZE + size >= page_size` from an anonymous
//! mapping of `HEADER_SIZE + size` bytes. The kernel rounds the mapping up to
//! whole pages; when the used part of the last page leaves a remainder no
//! larger than one header, that remainder is formatted as a free block and
//! chained directly behind the new block. A remainder is only carved inside
//! the length the mapper reports as mapped, whatever the configured page size.

#![allow(unsafe_code)]

use crate::config::{MapProtection, system_page_size};

use super::chain::Block;
use super::error::{AllocError, Backend};
use super::header::{HEADER_SIZE, Origin};
use super::heap::last_errno;

/// A source of independent page-granular regions.
///
/// # Safety
///
/// On success `map(len, _)` must return a fresh region whose `len` field is at
/// least the requested length and whose every byte is valid for reads and
/// writes for as long as the implementor is alive.
pub unsafe trait PageMapper: Send {
    /// Maps a new region of at least `len` bytes.
    ///
    /// Errors carry the errno describing why nothing could be mapped.
    fn map(&mut self, len: usize, protection: MapProtection) -> Result<MappedRegion, i32>;
}

/// A region handed out by a [`PageMapper`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappedRegion {
    pub base: usize,
    /// Bytes actually mapped, after rounding to the mapper's granularity.
    pub len: usize,
}

/// Anonymous private mappings via `mmap`.
#[derive(Debug)]
pub struct AnonMapper {
    granularity: usize,
}

impl AnonMapper {
    #[must_use]
    pub fn new() -> Self {
        Self {
            granularity: system_page_size(),
        }
    }
}

impl Default for AnonMapper {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: a successful anonymous mmap returns a page-rounded private region that
// is never unmapped by this crate.
unsafe impl PageMapper for AnonMapper {
    fn map(&mut self, len: usize, protection: MapProtection) -> Result<MappedRegion, i32> {
        let mapped = len
            .checked_next_multiple_of(self.granularity)
            .ok_or(libc::ENOMEM)?;
        // SAFETY: anonymous mapping with a null hint and no fd.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                protection.prot_bits(),
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(last_errno());
        }
        Ok(MappedRegion {
            base: ptr as usize,
            len: mapped,
        })
    }
}

/// Size of the free remainder carved behind a mapping of `total` bytes, if any.
///
/// The remainder is `total % page_size`. It is carved only when it is
/// non-zero, no larger than one header, and its header plus payload fit in the
/// unused tail of the last page.
#[must_use]
pub fn remainder_size(total: usize, page_size: usize) -> Option<usize> {
    let remainder = total % page_size;
    let slack = page_size - remainder;
    (remainder > 0 && remainder <= HEADER_SIZE && HEADER_SIZE + remainder <= slack)
        .then_some(remainder)
}

/// Obtains a fresh in-use block of `size` payload bytes from `mapper`, plus the
/// free remainder block when one is carved.
pub(crate) fn map_block<M: PageMapper>(
    mapper: &mut M,
    size: usize,
    page_size: usize,
    protection: MapProtection,
) -> Result<(Block, Option<Block>), AllocError> {
    let exhausted = |errno| AllocError::ResourceExhausted {
        backend: Backend::Mapping,
        size,
        errno,
    };
    let total = HEADER_SIZE.checked_add(size).ok_or(exhausted(libc::ENOMEM))?;
    let region = mapper.map(total, protection).map_err(exhausted)?;
    let base = region.base;

    let remainder = remainder_size(total, page_size)
        .filter(|&rem| {
            total
                .checked_add(HEADER_SIZE + rem)
                .is_some_and(|end| end <= region.len)
        })
        .map(|rem| Block::new(base + total, rem, true, Origin::MappingRemainder));
    Ok((Block::new(base, size, false, Origin::Mapping), remainder))
}
