//! Block header model.
//!
//! Every region a backend hands out starts with a [`BlockHeader`] stamp and is
//! followed by the payload:
//!
//! ```text
//! region                 region + HEADER_SIZE
//! |-- BlockHeader -------|-- payload (size bytes) --|
//! ```
//!
//! The allocator's arena keeps the authoritative copy of each header; the
//! in-memory stamp mirrors it so a debugger walking raw memory sees the same
//! chain the allocator does.

#![allow(unsafe_code)]

use std::mem::size_of;
use std::num::NonZeroU32;

/// Handle of a block descriptor in the allocator arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(NonZeroU32);

impl BlockId {
    /// Handle for arena slot `index`, if the arena can still grow.
    #[must_use]
    pub(crate) fn from_index(index: usize) -> Option<Self> {
        let raw = u32::try_from(index.checked_add(1)?).ok()?;
        NonZeroU32::new(raw).map(Self)
    }

    /// Arena slot index.
    #[must_use]
    pub fn index(self) -> usize {
        (self.0.get() - 1) as usize
    }
}

/// Where a block's memory came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    /// Carved by extending the data segment.
    HeapSegment,
    /// Head of an anonymous mapping.
    Mapping,
    /// Header-sized slack at the tail of a mapping.
    MappingRemainder,
}

/// Fixed-size record at the start of every region.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    /// Payload bytes following the header.
    pub size: usize,
    /// Next block in creation order.
    pub next: Option<BlockId>,
    /// Available for reuse.
    pub free: bool,
}

/// Bytes reserved in front of every payload.
pub const HEADER_SIZE: usize = size_of::<BlockHeader>();

impl BlockHeader {
    #[must_use]
    pub const fn new(size: usize, free: bool) -> Self {
        Self {
            size,
            next: None,
            free,
        }
    }
}

/// Writes `header` at the start of the region at `region`.
///
/// # Safety
///
/// `region` must be valid for writes of `HEADER_SIZE` bytes. No alignment is
/// required.
pub(crate) unsafe fn stamp(region: usize, header: BlockHeader) {
    // SAFETY: caller guarantees HEADER_SIZE writable bytes at region.
    unsafe { std::ptr::write_unaligned(region as *mut BlockHeader, header) };
}

/// Reads the header stamp at `region`.
///
/// # Safety
///
/// `region` must hold a stamp previously written by [`stamp`].
pub(crate) unsafe fn read_stamp(region: usize) -> BlockHeader {
    // SAFETY: caller guarantees region holds a BlockHeader written by stamp().
    unsafe { std::ptr::read_unaligned(region as *const BlockHeader) }
}
