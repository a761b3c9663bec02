//! Fixed-budget in-process backends.
//!
//! [`BufferSegment`] and [`BufferMapper`] stand in for `sbrk` and `mmap` with
//! memory taken from the Rust global allocator up front (segment) or per
//! mapping (mapper), each under a hard byte budget. They make exhaustion
//! reachable on demand and keep allocator instances fully isolated from the
//! process data segment, which is what the tests, the fuzzer and the harness
//! need.

#![allow(unsafe_code)]

use std::alloc::{Layout, alloc_zeroed, dealloc};

use crate::config::MapProtection;

use super::heap::HeapSegment;
use super::mapping::{MappedRegion, PageMapper};

const BUFFER_ALIGN: usize = 16;

/// A contiguous segment carved from one up-front buffer.
#[derive(Debug)]
pub struct BufferSegment {
    base: usize,
    layout: Option<Layout>,
    capacity: usize,
    used: usize,
}

impl BufferSegment {
    /// Segment of `capacity` zeroed bytes.
    ///
    /// A zero capacity, or one the global allocator refuses, yields a segment
    /// that fails every extension.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let layout = Layout::from_size_align(capacity, BUFFER_ALIGN)
            .ok()
            .filter(|l| l.size() > 0);
        let base = layout.map_or(0, |layout| {
            // SAFETY: layout has non-zero size.
            unsafe { alloc_zeroed(layout) as usize }
        });
        let (layout, capacity) = if base == 0 {
            (None, 0)
        } else {
            (layout, capacity)
        };
        Self {
            base,
            layout,
            capacity,
            used: 0,
        }
    }

    /// Bytes handed out so far.
    #[must_use]
    pub fn used(&self) -> usize {
        self.used
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether `addr` falls inside the segment.
    #[must_use]
    pub fn contains(&self, addr: usize) -> bool {
        self.base != 0 && addr >= self.base && addr < self.base + self.capacity
    }
}

// SAFETY: each extension returns a disjoint slice of the owned buffer, which
// lives until the segment is dropped.
unsafe impl HeapSegment for BufferSegment {
    fn extend(&mut self, len: usize) -> Result<usize, i32> {
        let end = self.used.checked_add(len).ok_or(libc::ENOMEM)?;
        if end > self.capacity {
            return Err(libc::ENOMEM);
        }
        let addr = self.base + self.used;
        self.used = end;
        Ok(addr)
    }
}

impl Drop for BufferSegment {
    fn drop(&mut self) {
        if let Some(layout) = self.layout {
            // SAFETY: base was returned by alloc_zeroed with this layout.
            unsafe { dealloc(self.base as *mut u8, layout) };
        }
    }
}

/// Page-rounded regions allocated individually under a total budget.
///
/// Protection requests are accepted and ignored: regions are always
/// readable and writable.
#[derive(Debug)]
pub struct BufferMapper {
    page_size: usize,
    budget: usize,
    mapped_bytes: usize,
    regions: Vec<(usize, Layout)>,
}

impl BufferMapper {
    /// Mapper rounding to `page_size` that refuses to exceed `budget` bytes.
    #[must_use]
    pub fn new(page_size: usize, budget: usize) -> Self {
        Self {
            page_size: page_size.max(1),
            budget,
            mapped_bytes: 0,
            regions: Vec::new(),
        }
    }

    /// Page-rounded bytes mapped so far.
    #[must_use]
    pub fn mapped_bytes(&self) -> usize {
        self.mapped_bytes
    }

    /// Number of regions mapped so far.
    #[must_use]
    pub fn region_count(&self) -> usize {
        self.regions.len()
    }

    fn round_up(&self, len: usize) -> Option<usize> {
        let pages = len.checked_add(self.page_size - 1)? / self.page_size;
        pages.checked_mul(self.page_size)
    }
}

// SAFETY: every region is a fresh zeroed allocation of the page-rounded
// length, freed only when the mapper is dropped.
unsafe impl PageMapper for BufferMapper {
    fn map(&mut self, len: usize, _protection: MapProtection) -> Result<MappedRegion, i32> {
        let rounded = self
            .round_up(len.max(1))
            .ok_or(libc::ENOMEM)?;
        let total = self.mapped_bytes.checked_add(rounded).ok_or(libc::ENOMEM)?;
        if total > self.budget {
            return Err(libc::ENOMEM);
        }
        let layout = Layout::from_size_align(rounded, BUFFER_ALIGN).map_err(|_| libc::ENOMEM)?;
        // SAFETY: layout has non-zero size.
        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(libc::ENOMEM);
        }
        self.regions.push((ptr as usize, layout));
        self.mapped_bytes = total;
        Ok(MappedRegion {
            base: ptr as usize,
            len: rounded,
        })
    }
}

impl Drop for BufferMapper {
    fn drop(&mut self) {
        for (addr, layout) in self.regions.drain(..) {
            // SAFETY: each region was returned by alloc_zeroed with this layout.
            unsafe { dealloc(addr as *mut u8, layout) };
        }
    }
}
