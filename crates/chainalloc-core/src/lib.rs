//! # chainalloc-core
//!
//! A first-fit block-chain allocator.
//!
//! Small requests are carved from the process data segment (`sbrk`), large
//! requests get their own anonymous mapping. Every block ever created stays in
//! one creation-ordered chain; a released block is only flagged free and is
//! handed back to the first later request it can hold.
//!
//! `unsafe` is denied at the crate level. The modules that touch raw memory
//! (`malloc::heap`, `malloc::mapping`, `malloc::buffer`, `malloc::header`)
//! opt back in locally.

#![deny(unsafe_code)]

pub mod config;
pub mod malloc;

pub use config::{AllocatorConfig, MapProtection, ViolationMode};
pub use malloc::{
    AllocError, AllocatorLogLevel, AllocatorLogRecord, AllocatorStats, Backend, BlockId,
    BlockView, ChainAllocator, HEADER_SIZE, Origin,
};
