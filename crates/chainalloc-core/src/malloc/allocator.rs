//! Core allocator state.
//!
//! [`ChainAllocator`] owns one block chain plus its two backends behind a
//! single mutex. Every public operation is one critical section covering the
//! fit search, any backend call, the chain append and the free-flag change,
//! so a block released on one thread and reused on another is always observed
//! through the same lock.

use std::ptr::NonNull;

use parking_lot::Mutex;

use crate::config::{AllocatorConfig, MapProtection};

use super::buffer::{BufferMapper, BufferSegment};
use super::chain::{BlockChain, BlockView};
use super::error::{AllocError, Backend};
use super::header::{BlockHeader, BlockId, HEADER_SIZE, Origin};
use super::heap::{self, HeapSegment, SbrkSegment};
use super::mapping::{self, AnonMapper, PageMapper};

/// Smallest page size an allocator accepts; smaller values are raised to it.
pub const MIN_PAGE_SIZE: usize = 4 * HEADER_SIZE;

/// Allocator lifecycle log level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AllocatorLogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Structured allocator lifecycle record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocatorLogRecord {
    /// Monotonic decision/event id.
    pub decision_id: u64,
    /// Correlation id for this lifecycle record.
    pub trace_id: String,
    /// Severity level.
    pub level: AllocatorLogLevel,
    /// API symbol (`malloc`, `calloc`, `free`).
    pub symbol: &'static str,
    /// Event kind (`alloc`, `free`, `remainder_carved`, ...).
    pub event: &'static str,
    /// Payload address involved in the event.
    pub ptr: Option<usize>,
    /// Size value involved in the event.
    pub size: Option<usize>,
    /// Backend origin of the block involved.
    pub origin: Option<Origin>,
    /// Machine-readable outcome label.
    pub outcome: &'static str,
    /// Free-form details for debugging.
    pub details: String,
    /// Snapshot: blocks handed out and not yet released.
    pub live_count: usize,
    /// Snapshot: payload bytes of live blocks.
    pub live_bytes: usize,
    /// Snapshot: blocks in the chain.
    pub block_count: usize,
    /// Snapshot: allocations served by reusing a free block.
    pub reuse_hits: u64,
}

/// Point-in-time chain statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocatorStats {
    pub blocks: usize,
    pub free_blocks: usize,
    pub live_blocks: usize,
    /// Payload bytes of in-use blocks (block sizes, not request sizes).
    pub live_bytes: usize,
    pub free_bytes: usize,
    pub heap_blocks: usize,
    pub mapped_blocks: usize,
    pub remainder_blocks: usize,
    pub reuse_hits: u64,
}

struct ChainState<H, M> {
    chain: BlockChain,
    heap: H,
    mapper: M,
    reuse_hits: u64,
    live_count: usize,
    live_bytes: usize,
    capture_lifecycle: bool,
    next_decision_id: u64,
    lifecycle_logs: Vec<AllocatorLogRecord>,
}

impl<H: HeapSegment, M: PageMapper> ChainState<H, M> {
    fn next_log_decision_id(&mut self) -> u64 {
        let id = self.next_decision_id;
        self.next_decision_id = self.next_decision_id.wrapping_add(1);
        id
    }

    #[allow(clippy::too_many_arguments)]
    fn record_lifecycle(
        &mut self,
        level: AllocatorLogLevel,
        symbol: &'static str,
        event: &'static str,
        ptr: Option<usize>,
        size: Option<usize>,
        origin: Option<Origin>,
        outcome: &'static str,
        details: impl Into<String>,
    ) {
        if !self.capture_lifecycle {
            return;
        }
        let decision_id = self.next_log_decision_id();
        let trace_id = format!("core::malloc::{}::{:016x}", symbol, decision_id);
        self.lifecycle_logs.push(AllocatorLogRecord {
            decision_id,
            trace_id,
            level,
            symbol,
            event,
            ptr,
            size,
            origin,
            outcome,
            details: details.into(),
            live_count: self.live_count,
            live_bytes: self.live_bytes,
            block_count: self.chain.len(),
            reuse_hits: self.reuse_hits,
        });
    }

    fn allocate(
        &mut self,
        symbol: &'static str,
        size: usize,
        page_size: usize,
        protection: MapProtection,
    ) -> Result<usize, AllocError> {
        if let Some(id) = self.chain.find_fit(size) {
            self.chain.set_free(id, false);
            let block = *self.chain.block(id);
            self.reuse_hits += 1;
            self.live_count += 1;
            self.live_bytes += block.header.size;
            self.record_lifecycle(
                AllocatorLogLevel::Trace,
                symbol,
                "alloc",
                Some(block.payload()),
                Some(size),
                Some(block.origin),
                "success",
                format!("path=first_fit_reuse block_size={}", block.header.size),
            );
            return Ok(block.payload());
        }

        let Some(use_mapping) = super::routes_to_mapping(size, page_size) else {
            let err = AllocError::ResourceExhausted {
                backend: Backend::Mapping,
                size,
                errno: libc::ENOMEM,
            };
            self.record_lifecycle(
                AllocatorLogLevel::Warn,
                symbol,
                "alloc",
                None,
                Some(size),
                None,
                "oom",
                "header_plus_size_overflows",
            );
            return Err(err);
        };

        let created = if use_mapping {
            self.create_mapped(symbol, size, page_size, protection)
        } else {
            self.create_grown(symbol, size)
        };
        let id = match created {
            Ok(id) => id,
            Err(err) => {
                self.record_lifecycle(
                    AllocatorLogLevel::Warn,
                    symbol,
                    "alloc",
                    None,
                    Some(size),
                    None,
                    "oom",
                    err.to_string(),
                );
                return Err(err);
            }
        };
        self.chain.append(id);

        let block = *self.chain.block(id);
        self.live_count += 1;
        self.live_bytes += block.header.size;
        self.record_lifecycle(
            AllocatorLogLevel::Trace,
            symbol,
            "alloc",
            Some(block.payload()),
            Some(size),
            Some(block.origin),
            "success",
            if use_mapping {
                "path=mapping"
            } else {
                "path=heap_segment"
            },
        );
        Ok(block.payload())
    }

    fn create_grown(
        &mut self,
        symbol: &'static str,
        size: usize,
    ) -> Result<BlockId, AllocError> {
        let block = heap::grow_block(&mut self.heap, size)?;
        let id = self.chain.insert(block).ok_or(AllocError::ResourceExhausted {
            backend: Backend::HeapSegment,
            size,
            errno: libc::ENOMEM,
        })?;
        self.record_lifecycle(
            AllocatorLogLevel::Debug,
            symbol,
            "block_created",
            Some(block.payload()),
            Some(size),
            Some(Origin::HeapSegment),
            "success",
            format!("region={:#x} extent={}", block.region, HEADER_SIZE + size),
        );
        Ok(id)
    }

    fn create_mapped(
        &mut self,
        symbol: &'static str,
        size: usize,
        page_size: usize,
        protection: MapProtection,
    ) -> Result<BlockId, AllocError> {
        let exhausted = AllocError::ResourceExhausted {
            backend: Backend::Mapping,
            size,
            errno: libc::ENOMEM,
        };
        let (block, remainder) = mapping::map_block(&mut self.mapper, size, page_size, protection)?;
        if !self.chain.has_room(1 + usize::from(remainder.is_some())) {
            return Err(exhausted);
        }
        let id = self.chain.insert(block).ok_or(exhausted)?;
        self.record_lifecycle(
            AllocatorLogLevel::Debug,
            symbol,
            "block_created",
            Some(block.payload()),
            Some(size),
            Some(Origin::Mapping),
            "success",
            format!("region={:#x} extent={}", block.region, HEADER_SIZE + size),
        );
        if let Some(rem) = remainder {
            let rem_id = self.chain.insert(rem).ok_or(exhausted)?;
            self.chain.link(id, rem_id);
            self.record_lifecycle(
                AllocatorLogLevel::Debug,
                symbol,
                "remainder_carved",
                Some(rem.payload()),
                Some(rem.header.size),
                Some(Origin::MappingRemainder),
                "success",
                format!("behind={:#x}", block.payload()),
            );
        }
        Ok(id)
    }

    fn release(&mut self, addr: usize) -> Result<usize, AllocError> {
        let Some(id) = self.chain.locate(addr) else {
            self.record_lifecycle(
                AllocatorLogLevel::Warn,
                "free",
                "unknown_pointer",
                Some(addr),
                None,
                None,
                "rejected",
                "pointer_not_a_payload_address",
            );
            return Err(AllocError::UnknownPointer { addr });
        };
        let block = *self.chain.block(id);
        if block.header.free {
            self.record_lifecycle(
                AllocatorLogLevel::Warn,
                "free",
                "double_release_detected",
                Some(addr),
                Some(block.header.size),
                Some(block.origin),
                "rejected",
                "block_already_free",
            );
            return Err(AllocError::DoubleRelease { addr });
        }

        self.chain.set_free(id, true);
        match self.live_count.checked_sub(1) {
            Some(next) => self.live_count = next,
            None => {
                self.live_count = 0;
                self.record_lifecycle(
                    AllocatorLogLevel::Error,
                    "free",
                    "invariant_live_count_underflow",
                    Some(addr),
                    Some(block.header.size),
                    Some(block.origin),
                    "recovered",
                    "checked_sub_failed",
                );
            }
        }
        match self.live_bytes.checked_sub(block.header.size) {
            Some(next) => self.live_bytes = next,
            None => {
                self.live_bytes = 0;
                self.record_lifecycle(
                    AllocatorLogLevel::Error,
                    "free",
                    "invariant_live_bytes_underflow",
                    Some(addr),
                    Some(block.header.size),
                    Some(block.origin),
                    "recovered",
                    "checked_sub_failed",
                );
            }
        }
        self.record_lifecycle(
            AllocatorLogLevel::Trace,
            "free",
            "free",
            Some(addr),
            Some(block.header.size),
            Some(block.origin),
            "success",
            "flagged_free",
        );
        Ok(block.header.size)
    }

    fn stats(&self) -> AllocatorStats {
        let mut stats = AllocatorStats {
            reuse_hits: self.reuse_hits,
            ..AllocatorStats::default()
        };
        for view in self.chain.iter() {
            stats.blocks += 1;
            if view.free {
                stats.free_blocks += 1;
                stats.free_bytes += view.size;
            } else {
                stats.live_blocks += 1;
                stats.live_bytes += view.size;
            }
            match view.origin {
                Origin::HeapSegment => stats.heap_blocks += 1,
                Origin::Mapping => stats.mapped_blocks += 1,
                Origin::MappingRemainder => stats.remainder_blocks += 1,
            }
        }
        stats
    }
}

/// First-fit block-chain allocator.
///
/// `H` grows the data segment for small requests and `M` maps pages for large
/// ones. [`ChainAllocator::new`] uses `sbrk` and `mmap`;
/// [`ChainAllocator::buffered`] uses fixed-budget in-process backends.
pub struct ChainAllocator<H: HeapSegment = SbrkSegment, M: PageMapper = AnonMapper> {
    config: AllocatorConfig,
    page_size: usize,
    state: Mutex<ChainState<H, M>>,
}

impl ChainAllocator {
    /// Allocator over the process data segment and anonymous mappings.
    ///
    /// Break moves are serialized across every instance in the process, but
    /// not against other `sbrk` users such as the system allocator's main
    /// arena. Used next to glibc `malloc`, the chain only sees the bytes each
    /// of its own `sbrk` calls returned; the break may move in between.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(AllocatorConfig::new())
    }

    #[must_use]
    pub fn with_config(config: AllocatorConfig) -> Self {
        Self::with_backends(config, SbrkSegment::new(), AnonMapper::new())
    }
}

impl Default for ChainAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl ChainAllocator<BufferSegment, BufferMapper> {
    /// Allocator isolated from the process heap: at most `heap_capacity`
    /// bytes of segment growth and `map_budget` bytes of mappings.
    #[must_use]
    pub fn buffered(config: AllocatorConfig, heap_capacity: usize, map_budget: usize) -> Self {
        let page_size = config.page_size.max(MIN_PAGE_SIZE);
        Self::with_backends(
            config,
            BufferSegment::with_capacity(heap_capacity),
            BufferMapper::new(page_size, map_budget),
        )
    }
}

impl<H: HeapSegment, M: PageMapper> ChainAllocator<H, M> {
    /// Allocator over caller-supplied backends.
    ///
    /// `config.page_size` (raised to [`MIN_PAGE_SIZE`] when smaller) only
    /// routes requests; remainders are carved within the length `mapper`
    /// reports, so it need not match the mapper's granularity.
    #[must_use]
    pub fn with_backends(config: AllocatorConfig, heap: H, mapper: M) -> Self {
        let page_size = config.page_size.max(MIN_PAGE_SIZE);
        Self {
            state: Mutex::new(ChainState {
                chain: BlockChain::new(),
                heap,
                mapper,
                reuse_hits: 0,
                live_count: 0,
                live_bytes: 0,
                capture_lifecycle: config.capture_lifecycle,
                next_decision_id: 1,
                lifecycle_logs: Vec::new(),
            }),
            config,
            page_size,
        }
    }

    #[must_use]
    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    /// Effective page size used for backend routing.
    #[must_use]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Allocates `size` bytes of uninitialized memory.
    ///
    /// The returned pointer stays valid until released and for the lifetime of
    /// the allocator's backends.
    pub fn allocate(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        let ptr = self.allocate_as("malloc", size)?;
        log::debug!("Malloc {size} bytes");
        Ok(ptr)
    }

    /// Allocates `count * size` zeroed bytes.
    #[allow(unsafe_code)]
    pub fn zero_allocate(&self, count: usize, size: usize) -> Result<NonNull<u8>, AllocError> {
        if count == 0 || size == 0 {
            return Err(self.reject(
                "calloc",
                AllocError::InvalidArgument {
                    reason: "count and size must be non-zero",
                },
            ));
        }
        let Some(total) = count.checked_mul(size) else {
            return Err(self.reject(
                "calloc",
                AllocError::InvalidArgument {
                    reason: "count * size overflows",
                },
            ));
        };
        let ptr = self.allocate_as("calloc", total)?;
        // SAFETY: the block behind ptr holds at least `total` payload bytes and
        // is owned by this caller until released.
        unsafe { std::ptr::write_bytes(ptr.as_ptr(), 0, total) };
        log::debug!("Calloc {total} bytes");
        Ok(ptr)
    }

    /// Marks the block owning `ptr` free for reuse.
    ///
    /// `ptr` must be a payload address returned by this allocator. Nothing is
    /// zeroed, coalesced or returned to the OS.
    pub fn release(&self, ptr: *mut u8) -> Result<(), AllocError> {
        let addr = ptr as usize;
        if addr == 0 {
            return Err(self.reject("free", AllocError::UnknownPointer { addr }));
        }
        let released = self.state.lock().release(addr);
        match released {
            Ok(size) => {
                log::debug!("Freed {size} bytes");
                Ok(())
            }
            Err(err) => {
                log::warn!("free({addr:#x}) rejected: {err}");
                Err(err)
            }
        }
    }

    fn allocate_as(&self, symbol: &'static str, size: usize) -> Result<NonNull<u8>, AllocError> {
        if size == 0 {
            return Err(self.reject(
                symbol,
                AllocError::InvalidArgument {
                    reason: "size must be non-zero",
                },
            ));
        }
        let allocated = self.state.lock().allocate(
            symbol,
            size,
            self.page_size,
            self.config.map_protection,
        );
        let addr = allocated.inspect_err(|err| log::warn!("{symbol}({size}) failed: {err}"))?;
        NonNull::new(addr as *mut u8).ok_or(AllocError::ResourceExhausted {
            backend: Backend::HeapSegment,
            size,
            errno: libc::ENOMEM,
        })
    }

    fn reject(&self, symbol: &'static str, err: AllocError) -> AllocError {
        log::warn!("{symbol} rejected: {err}");
        let mut state = self.state.lock();
        let ptr = match err {
            AllocError::UnknownPointer { addr } | AllocError::DoubleRelease { addr } => Some(addr),
            _ => None,
        };
        state.record_lifecycle(
            AllocatorLogLevel::Warn,
            symbol,
            "contract_violation",
            ptr,
            None,
            None,
            "rejected",
            err.to_string(),
        );
        err
    }

    /// Snapshot of the block owning payload address `ptr`.
    #[must_use]
    pub fn lookup(&self, ptr: *const u8) -> Option<BlockView> {
        let state = self.state.lock();
        let id = state.chain.locate(ptr as usize)?;
        state.chain.get(id)
    }

    /// In-memory header stamp in front of payload `ptr`.
    #[must_use]
    pub fn header_stamp(&self, ptr: *const u8) -> Option<BlockHeader> {
        let state = self.state.lock();
        let id = state.chain.locate(ptr as usize)?;
        state.chain.stamped_header(id)
    }

    /// All blocks in chain order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<BlockView> {
        self.state.lock().chain.iter().collect()
    }

    #[must_use]
    pub fn stats(&self) -> AllocatorStats {
        self.state.lock().stats()
    }

    /// Copies of the captured lifecycle records.
    #[must_use]
    pub fn lifecycle_logs(&self) -> Vec<AllocatorLogRecord> {
        self.state.lock().lifecycle_logs.clone()
    }

    /// Drains the captured lifecycle records.
    pub fn drain_lifecycle_logs(&self) -> Vec<AllocatorLogRecord> {
        std::mem::take(&mut self.state.lock().lifecycle_logs)
    }
}

#[cfg(test)]
#[allow(unsafe_code)]
mod tests {
    use super::*;

    const PAGE: usize = 4096;

    fn buffered() -> ChainAllocator<BufferSegment, BufferMapper> {
        ChainAllocator::buffered(
            AllocatorConfig::new().page_size(PAGE).capture_lifecycle(true),
            64 * 1024,
            4 * 1024 * 1024,
        )
    }

    fn fill(ptr: NonNull<u8>, len: usize, byte: u8) {
        // SAFETY: tests only fill allocations of at least `len` bytes.
        unsafe { std::ptr::write_bytes(ptr.as_ptr(), byte, len) };
    }

    fn bytes(ptr: NonNull<u8>, len: usize) -> Vec<u8> {
        // SAFETY: tests only read allocations of at least `len` bytes.
        unsafe { std::slice::from_raw_parts(ptr.as_ptr(), len).to_vec() }
    }

    #[test]
    fn test_new_allocator_is_empty() {
        let alloc = buffered();
        assert_eq!(alloc.stats(), AllocatorStats::default());
        assert!(alloc.snapshot().is_empty());
        assert_eq!(alloc.page_size(), PAGE);
    }

    #[test]
    fn test_allocate_zero_is_invalid() {
        let alloc = buffered();
        assert_eq!(
            alloc.allocate(0),
            Err(AllocError::InvalidArgument {
                reason: "size must be non-zero"
            })
        );
        assert_eq!(alloc.stats().blocks, 0);
    }

    #[test]
    fn test_first_allocation_becomes_base() {
        let alloc = buffered();
        let ptr = alloc.allocate(16).unwrap();
        let snapshot = alloc.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].payload, ptr.as_ptr() as usize);
        assert_eq!(snapshot[0].size, 16);
        assert!(!snapshot[0].free);
        assert_eq!(snapshot[0].origin, Origin::HeapSegment);
    }

    #[test]
    fn test_release_then_allocate_same_size_reuses_address() {
        let alloc = buffered();
        let ptr = alloc.allocate(16).unwrap();
        fill(ptr, 16, 0xAB);
        alloc.release(ptr.as_ptr()).unwrap();
        let again = alloc.allocate(16).unwrap();
        assert_eq!(again, ptr);
        assert_eq!(alloc.stats().reuse_hits, 1);
        assert_eq!(alloc.stats().blocks, 1);
    }

    #[test]
    fn test_reuse_picks_first_fit_not_best_fit() {
        let alloc = buffered();
        let big = alloc.allocate(256).unwrap();
        let small = alloc.allocate(32).unwrap();
        let _guard = alloc.allocate(8).unwrap();
        alloc.release(big.as_ptr()).unwrap();
        alloc.release(small.as_ptr()).unwrap();

        // Both free blocks fit; the earlier-created one wins even though the
        // later one is a tighter fit.
        assert_eq!(alloc.allocate(24).unwrap(), big);
        assert_eq!(alloc.allocate(24).unwrap(), small);
    }

    #[test]
    fn test_smaller_request_reuses_larger_block_without_splitting() {
        let alloc = buffered();
        let ptr = alloc.allocate(100).unwrap();
        alloc.release(ptr.as_ptr()).unwrap();
        let again = alloc.allocate(10).unwrap();
        assert_eq!(again, ptr);
        let view = alloc.lookup(again.as_ptr()).unwrap();
        assert_eq!(view.size, 100, "blocks keep their creation size");
        assert_eq!(alloc.stats().live_bytes, 100);
    }

    #[test]
    fn test_larger_request_creates_new_block() {
        let alloc = buffered();
        let ptr = alloc.allocate(16).unwrap();
        alloc.release(ptr.as_ptr()).unwrap();
        let bigger = alloc.allocate(17).unwrap();
        assert_ne!(bigger, ptr);
        assert_eq!(alloc.stats().blocks, 2);
        assert_eq!(alloc.stats().free_blocks, 1);
    }

    #[test]
    fn test_double_release_is_reported() {
        let alloc = buffered();
        let ptr = alloc.allocate(64).unwrap();
        alloc.release(ptr.as_ptr()).unwrap();
        assert_eq!(
            alloc.release(ptr.as_ptr()),
            Err(AllocError::DoubleRelease {
                addr: ptr.as_ptr() as usize
            })
        );
        assert_eq!(alloc.stats().free_blocks, 1);
    }

    #[test]
    fn test_release_null_and_foreign_pointers() {
        let alloc = buffered();
        let _ = alloc.allocate(8).unwrap();
        assert_eq!(
            alloc.release(std::ptr::null_mut()),
            Err(AllocError::UnknownPointer { addr: 0 })
        );
        let mut local = 0u64;
        let foreign = std::ptr::addr_of_mut!(local).cast::<u8>();
        assert_eq!(
            alloc.release(foreign),
            Err(AllocError::UnknownPointer {
                addr: foreign as usize
            })
        );
    }

    #[test]
    fn test_release_interior_pointer_is_unknown() {
        let alloc = buffered();
        let ptr = alloc.allocate(32).unwrap();
        // SAFETY: offset stays inside the 32-byte payload.
        let interior = unsafe { ptr.as_ptr().add(4) };
        assert!(matches!(
            alloc.release(interior),
            Err(AllocError::UnknownPointer { .. })
        ));
        assert!(!alloc.lookup(ptr.as_ptr()).unwrap().free);
    }

    #[test]
    fn test_zero_allocate_zeroes_reused_memory() {
        let alloc = buffered();
        let ptr = alloc.allocate(16).unwrap();
        fill(ptr, 16, 0xFF);
        alloc.release(ptr.as_ptr()).unwrap();

        let zeroed = alloc.zero_allocate(4, 4).unwrap();
        assert_eq!(zeroed, ptr, "16-byte request reuses the released block");
        assert_eq!(bytes(zeroed, 16), vec![0u8; 16]);
    }

    #[test]
    fn test_zero_allocate_rejects_zero_and_overflow() {
        let alloc = buffered();
        assert!(matches!(
            alloc.zero_allocate(0, 8),
            Err(AllocError::InvalidArgument { .. })
        ));
        assert!(matches!(
            alloc.zero_allocate(8, 0),
            Err(AllocError::InvalidArgument { .. })
        ));
        assert_eq!(
            alloc.zero_allocate(usize::MAX, 2),
            Err(AllocError::InvalidArgument {
                reason: "count * size overflows"
            })
        );
        assert_eq!(alloc.stats().blocks, 0);
    }

    #[test]
    fn test_threshold_routes_by_page_size() {
        let alloc = buffered();
        let below = alloc.allocate(PAGE - HEADER_SIZE - 1).unwrap();
        let at = alloc.allocate(PAGE - HEADER_SIZE).unwrap();
        assert_eq!(alloc.lookup(below.as_ptr()).unwrap().origin, Origin::HeapSegment);
        assert_eq!(alloc.lookup(at.as_ptr()).unwrap().origin, Origin::Mapping);
    }

    #[test]
    fn test_first_large_request_goes_to_mapping() {
        let alloc = buffered();
        let ptr = alloc.allocate(200_000).unwrap();
        assert_eq!(alloc.lookup(ptr.as_ptr()).unwrap().origin, Origin::Mapping);
    }

    #[test]
    fn test_mapping_remainder_is_reachable_and_reusable() {
        let alloc = buffered();
        let _small = alloc.allocate(8).unwrap();
        let size = 2 * PAGE + 8 - HEADER_SIZE;
        let big = alloc.allocate(size).unwrap();

        let snapshot = alloc.snapshot();
        assert_eq!(snapshot.len(), 3);
        let big_view = snapshot[1];
        let rem_view = snapshot[2];
        assert_eq!(big_view.payload, big.as_ptr() as usize);
        assert_eq!(big_view.next, Some(rem_view.id));
        assert_eq!(rem_view.origin, Origin::MappingRemainder);
        assert!(rem_view.free);
        assert_eq!(rem_view.size, 8);
        assert_eq!(rem_view.region(), big_view.end());

        // An 8-byte request now lands in the remainder: it is the first free fit.
        let tiny = alloc.allocate(8).unwrap();
        assert_eq!(tiny.as_ptr() as usize, rem_view.payload);
        fill(tiny, 8, 0x11);
        fill(big, size, 0x22);
        assert_eq!(bytes(tiny, 8), vec![0x11; 8]);
    }

    #[test]
    fn test_full_arena_leaves_no_unreachable_mapping() {
        let alloc = buffered();
        alloc.state.lock().chain = BlockChain::with_max_blocks(2);
        let small = alloc.allocate(8).unwrap();

        // The mapping would need a second slot for its remainder.
        let size = 2 * PAGE + 8 - HEADER_SIZE;
        assert!(matches!(
            alloc.allocate(size),
            Err(AllocError::ResourceExhausted {
                backend: Backend::Mapping,
                ..
            })
        ));
        assert_eq!(alloc.state.lock().chain.len(), 1);
        assert_eq!(alloc.snapshot().len(), 1);
        assert_eq!(alloc.stats().live_blocks, 1);

        // A mapping without a remainder still fits in the last slot.
        let exact = alloc.allocate(2 * PAGE - HEADER_SIZE).unwrap();
        let snapshot = alloc.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].payload, small.as_ptr() as usize);
        assert_eq!(snapshot[1].payload, exact.as_ptr() as usize);
    }

    #[test]
    fn test_allocation_after_remainder_links_behind_it() {
        let alloc = buffered();
        let size = PAGE + 4 - HEADER_SIZE;
        let _big = alloc.allocate(size).unwrap();
        let next = alloc.allocate(64).unwrap();
        let snapshot = alloc.snapshot();
        assert_eq!(snapshot.len(), 3);
        assert_eq!(snapshot[1].next, Some(snapshot[2].id));
        assert_eq!(snapshot[2].payload, next.as_ptr() as usize);
    }

    #[test]
    fn test_heap_exhaustion_surfaces_as_error() {
        let alloc = ChainAllocator::buffered(AllocatorConfig::new().page_size(PAGE), 64, 1 << 20);
        assert!(alloc.allocate(64 - HEADER_SIZE).is_ok());
        assert_eq!(
            alloc.allocate(1),
            Err(AllocError::ResourceExhausted {
                backend: Backend::HeapSegment,
                size: 1,
                errno: libc::ENOMEM,
            })
        );
        assert_eq!(alloc.stats().blocks, 1);
    }

    #[test]
    fn test_mapping_exhaustion_surfaces_as_error() {
        let alloc = ChainAllocator::buffered(AllocatorConfig::new().page_size(PAGE), 1 << 16, PAGE);
        let err = alloc.zero_allocate(2, PAGE).unwrap_err();
        assert_eq!(
            err,
            AllocError::ResourceExhausted {
                backend: Backend::Mapping,
                size: 2 * PAGE,
                errno: libc::ENOMEM,
            }
        );
        assert!(alloc.snapshot().is_empty());
    }

    #[test]
    fn test_exhaustion_still_allows_reuse() {
        let alloc = ChainAllocator::buffered(AllocatorConfig::new().page_size(PAGE), 64, 0);
        let ptr = alloc.allocate(48).unwrap();
        assert!(alloc.allocate(48).is_err());
        alloc.release(ptr.as_ptr()).unwrap();
        assert_eq!(alloc.allocate(48).unwrap(), ptr);
    }

    #[test]
    fn test_oversized_request_is_exhaustion() {
        let alloc = buffered();
        assert!(matches!(
            alloc.allocate(usize::MAX),
            Err(AllocError::ResourceExhausted { .. })
        ));
    }

    #[test]
    fn test_header_stamp_matches_descriptor() {
        let alloc = buffered();
        let a = alloc.allocate(40).unwrap();
        let b = alloc.allocate(24).unwrap();
        let stamp = alloc.header_stamp(a.as_ptr()).unwrap();
        assert_eq!(stamp.size, 40);
        assert!(!stamp.free);
        assert_eq!(stamp.next, Some(alloc.lookup(b.as_ptr()).unwrap().id));

        alloc.release(a.as_ptr()).unwrap();
        assert!(alloc.header_stamp(a.as_ptr()).unwrap().free);
    }

    #[test]
    fn test_writes_do_not_corrupt_neighbours() {
        let alloc = buffered();
        let sizes = [1usize, 7, 16, 33, 100, 4000, 5000];
        let ptrs: Vec<_> = sizes.iter().map(|&s| alloc.allocate(s).unwrap()).collect();
        for (i, (&ptr, &size)) in ptrs.iter().zip(&sizes).enumerate() {
            fill(ptr, size, i as u8 + 1);
        }
        for (i, (&ptr, &size)) in ptrs.iter().zip(&sizes).enumerate() {
            assert_eq!(bytes(ptr, size), vec![i as u8 + 1; size]);
            let stamp = alloc.header_stamp(ptr.as_ptr()).unwrap();
            assert_eq!(stamp.size, size, "header of block {i} intact");
        }
    }

    #[test]
    fn test_stats_track_live_and_free() {
        let alloc = buffered();
        let a = alloc.allocate(10).unwrap();
        let _b = alloc.allocate(20).unwrap();
        // HEADER_SIZE + PAGE leaves one header's worth in the last page.
        let _c = alloc.allocate(PAGE).unwrap();
        alloc.release(a.as_ptr()).unwrap();
        let stats = alloc.stats();
        assert_eq!(stats.blocks, 4);
        assert_eq!(stats.live_blocks, 2);
        assert_eq!(stats.free_blocks, 2);
        assert_eq!(stats.free_bytes, 10 + HEADER_SIZE);
        assert_eq!(stats.live_bytes, 20 + PAGE);
        assert_eq!(stats.heap_blocks, 2);
        assert_eq!(stats.mapped_blocks, 1);
        assert_eq!(stats.remainder_blocks, 1);
    }

    #[test]
    fn test_small_page_size_is_raised() {
        let alloc = ChainAllocator::buffered(AllocatorConfig::new().page_size(1), 1024, 1 << 16);
        assert_eq!(alloc.page_size(), MIN_PAGE_SIZE);
        let ptr = alloc.allocate(MIN_PAGE_SIZE).unwrap();
        assert_eq!(alloc.lookup(ptr.as_ptr()).unwrap().origin, Origin::Mapping);
    }

    #[test]
    fn test_lifecycle_logs_include_trace_and_decision_ids() {
        let alloc = buffered();
        let ptr = alloc.allocate(64).unwrap();
        alloc.release(ptr.as_ptr()).unwrap();

        let logs = alloc.drain_lifecycle_logs();
        assert!(!logs.is_empty());
        assert!(logs.iter().all(|entry| entry.decision_id > 0));
        assert!(
            logs.iter()
                .all(|entry| entry.trace_id.starts_with("core::malloc::"))
        );
        assert!(logs.iter().any(|entry| {
            entry.level == AllocatorLogLevel::Trace && entry.symbol == "malloc" && entry.event == "alloc"
        }));
        assert!(logs.iter().any(|entry| {
            entry.level == AllocatorLogLevel::Debug && entry.event == "block_created"
        }));
        assert!(logs.iter().any(|entry| entry.symbol == "free" && entry.outcome == "success"));
        assert!(alloc.lifecycle_logs().is_empty(), "drain empties the buffer");
    }

    #[test]
    fn test_lifecycle_logs_warn_on_violations_and_exhaustion() {
        let alloc = ChainAllocator::buffered(
            AllocatorConfig::new().page_size(PAGE).capture_lifecycle(true),
            64,
            0,
        );
        let ptr = alloc.allocate(16).unwrap();
        alloc.release(ptr.as_ptr()).unwrap();
        let _ = alloc.release(ptr.as_ptr());
        let _ = alloc.allocate(0);
        let _ = alloc.allocate(PAGE);

        let logs = alloc.drain_lifecycle_logs();
        for event in ["double_release_detected", "contract_violation"] {
            assert!(
                logs.iter()
                    .any(|entry| entry.level == AllocatorLogLevel::Warn && entry.event == event),
                "expected WARN {event} entry"
            );
        }
        assert!(
            logs.iter()
                .any(|entry| entry.level == AllocatorLogLevel::Warn && entry.outcome == "oom"),
            "expected WARN oom entry"
        );
    }

    #[test]
    fn test_lifecycle_logs_record_remainder() {
        let alloc = buffered();
        let _ = alloc.allocate(PAGE + 8 - HEADER_SIZE).unwrap();
        let logs = alloc.lifecycle_logs();
        let carved = logs
            .iter()
            .find(|entry| entry.event == "remainder_carved")
            .expect("remainder record");
        assert_eq!(carved.origin, Some(Origin::MappingRemainder));
        assert_eq!(carved.size, Some(8));
    }

    #[test]
    fn test_lifecycle_capture_is_opt_in() {
        let alloc = ChainAllocator::buffered(AllocatorConfig::new().page_size(PAGE), 1024, 0);
        let ptr = alloc.allocate(8).unwrap();
        alloc.release(ptr.as_ptr()).unwrap();
        assert!(alloc.lifecycle_logs().is_empty());
    }

    #[test]
    fn test_accounting_invariant_under_deterministic_trace() {
        fn lcg(state: &mut u64) -> u64 {
            *state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
            *state
        }

        let alloc = ChainAllocator::buffered(AllocatorConfig::new().page_size(PAGE), 1 << 20, 1 << 24);
        let mut live: Vec<(NonNull<u8>, usize)> = Vec::new();
        let mut rng = 0xA5A5_5A5A_DEAD_BEEFu64;

        for _ in 0..1500 {
            let r = lcg(&mut rng);
            if r % 2 == 0 || live.is_empty() {
                let size = ((r >> 8) as usize % (PAGE * 2)).max(1);
                if let Ok(ptr) = alloc.allocate(size) {
                    live.push((ptr, size));
                }
            } else {
                let idx = (r as usize >> 3) % live.len();
                let (ptr, _) = live.swap_remove(idx);
                alloc.release(ptr.as_ptr()).unwrap();
            }

            let stats = alloc.stats();
            assert_eq!(stats.live_blocks, live.len());
            assert_eq!(stats.blocks, stats.live_blocks + stats.free_blocks);
            for &(ptr, size) in &live {
                let view = alloc.lookup(ptr.as_ptr()).expect("live pointer is known");
                assert!(!view.free);
                assert!(view.size >= size);
            }
        }
    }
}
