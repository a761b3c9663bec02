//! Memory allocation.
//!
//! One creation-ordered chain of blocks, searched first-fit:
//! - Requests with `HEADER_SIZE + size < page_size` extend the data segment
//! - Larger requests get an anonymous mapping, with a header-sized slack
//!   remainder chained behind them as a free block

pub mod allocator;
pub mod buffer;
pub mod chain;
pub mod error;
pub mod header;
pub mod heap;
pub mod mapping;

pub use allocator::{
    AllocatorLogLevel, AllocatorLogRecord, AllocatorStats, ChainAllocator, MIN_PAGE_SIZE,
};
pub use buffer::{BufferMapper, BufferSegment};
pub use chain::{BlockChain, BlockView};
pub use error::{AllocError, Backend};
pub use header::{BlockHeader, BlockId, HEADER_SIZE, Origin};
pub use heap::{HeapSegment, SbrkSegment};
pub use mapping::{AnonMapper, MappedRegion, PageMapper};

/// True when a request of `size` payload bytes belongs to the mapping backend.
///
/// `None` when `HEADER_SIZE + size` does not fit in `usize`.
#[must_use]
pub fn routes_to_mapping(size: usize, page_size: usize) -> Option<bool> {
    HEADER_SIZE.checked_add(size).map(|total| total >= page_size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_boundary_is_inclusive() {
        let page = 4096;
        assert_eq!(routes_to_mapping(page - HEADER_SIZE - 1, page), Some(false));
        assert_eq!(routes_to_mapping(page - HEADER_SIZE, page), Some(true));
        assert_eq!(routes_to_mapping(page, page), Some(true));
        assert_eq!(routes_to_mapping(1, page), Some(false));
    }

    #[test]
    fn threshold_rejects_overflowing_totals() {
        assert_eq!(routes_to_mapping(usize::MAX, 4096), None);
        assert_eq!(routes_to_mapping(usize::MAX - HEADER_SIZE, 4096), Some(true));
    }
}
