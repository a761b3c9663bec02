//! Allocator configuration.
//!
//! [`AllocatorConfig`] is per-instance and passed to
//! [`ChainAllocator::with_config`](crate::ChainAllocator::with_config).
//!
//! Two process-wide knobs are read from the environment once and cached, for
//! the instance that backs the exported C symbols:
//! - `CHAINALLOC_ON_VIOLATION`: `abort` (default) terminates the process on a
//!   contract violation (zero size, double free). `report` logs the violation
//!   and returns without touching the chain.
//! - `CHAINALLOC_MAP_EXEC`: `1`/`true`/`yes` maps large blocks with execute
//!   permission in addition to read/write.

use std::sync::atomic::{AtomicU8, Ordering};

/// Fallback when `sysconf(_SC_PAGESIZE)` reports nothing usable.
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Protection requested for mapping-backend regions.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MapProtection {
    /// `PROT_READ | PROT_WRITE`.
    #[default]
    ReadWrite,
    /// `PROT_READ | PROT_WRITE | PROT_EXEC`.
    ReadWriteExec,
}

impl MapProtection {
    /// Raw `PROT_*` bits for `mmap`.
    #[must_use]
    pub const fn prot_bits(self) -> i32 {
        match self {
            Self::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
            Self::ReadWriteExec => libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
        }
    }
}

/// What the C entrypoints do with a contract violation.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViolationMode {
    /// Terminate the process.
    #[default]
    Abort,
    /// Log at warn level and carry on; the offending call has no effect.
    Report,
}

impl ViolationMode {
    /// Parse from string (case-insensitive). Unknown values fall back to `Abort`.
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "report" | "warn" | "ignore" | "log" => Self::Report,
            _ => Self::Abort,
        }
    }

    #[must_use]
    pub const fn aborts(self) -> bool {
        matches!(self, Self::Abort)
    }
}

/// Per-instance allocator settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocatorConfig {
    /// Requests with `HEADER_SIZE + size >= page_size` go to the mapping backend.
    pub page_size: usize,
    /// Protection for mapped regions.
    pub map_protection: MapProtection,
    /// Keep structured lifecycle records in memory.
    pub capture_lifecycle: bool,
}

impl AllocatorConfig {
    /// Defaults with the system page size.
    #[must_use]
    pub fn new() -> Self {
        Self {
            page_size: system_page_size(),
            map_protection: MapProtection::default(),
            capture_lifecycle: false,
        }
    }

    /// Defaults taken from the process environment (see module docs).
    #[must_use]
    pub fn from_env() -> Self {
        Self::new().map_protection(runtime_map_protection())
    }

    #[must_use]
    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    #[must_use]
    pub fn map_protection(mut self, protection: MapProtection) -> Self {
        self.map_protection = protection;
        self
    }

    #[must_use]
    pub fn capture_lifecycle(mut self, capture: bool) -> Self {
        self.capture_lifecycle = capture;
        self
    }
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Page size reported by the OS, or [`DEFAULT_PAGE_SIZE`].
#[must_use]
#[allow(unsafe_code)]
pub fn system_page_size() -> usize {
    // SAFETY: sysconf has no memory-safety preconditions.
    let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if raw > 0 {
        raw as usize
    } else {
        DEFAULT_PAGE_SIZE
    }
}

// Atomic caches: 0=unresolved, 255=resolving, otherwise the encoded value.
// A plain state machine rather than OnceLock: reading the environment can
// allocate, and under LD_PRELOAD that allocation re-enters the exported malloc.
static CACHED_VIOLATION: AtomicU8 = AtomicU8::new(0);
static CACHED_MAP_EXEC: AtomicU8 = AtomicU8::new(0);

const UNRESOLVED: u8 = 0;
const RESOLVING: u8 = 255;

const VIOLATION_ABORT: u8 = 1;
const VIOLATION_REPORT: u8 = 2;

const MAP_RW: u8 = 1;
const MAP_RWX: u8 = 2;

fn resolve_cached(cache: &AtomicU8, fallback: u8, resolve: impl FnOnce() -> u8) -> u8 {
    let cached = cache.load(Ordering::Acquire);
    if cached != UNRESOLVED && cached != RESOLVING {
        return cached;
    }
    if cached == RESOLVING {
        return fallback;
    }
    if cache
        .compare_exchange(UNRESOLVED, RESOLVING, Ordering::SeqCst, Ordering::Relaxed)
        .is_err()
    {
        let v = cache.load(Ordering::Acquire);
        return if v != UNRESOLVED && v != RESOLVING {
            v
        } else {
            fallback
        };
    }
    let value = resolve();
    cache.store(value, Ordering::Release);
    value
}

/// Violation policy from `CHAINALLOC_ON_VIOLATION`, resolved once.
///
/// A reentrant call made while the variable is being read sees `Abort`.
#[must_use]
pub fn runtime_violation_mode() -> ViolationMode {
    let v = resolve_cached(&CACHED_VIOLATION, VIOLATION_ABORT, || {
        let mode = std::env::var("CHAINALLOC_ON_VIOLATION")
            .map(|raw| ViolationMode::from_str_loose(&raw))
            .unwrap_or_default();
        match mode {
            ViolationMode::Abort => VIOLATION_ABORT,
            ViolationMode::Report => VIOLATION_REPORT,
        }
    });
    if v == VIOLATION_REPORT {
        ViolationMode::Report
    } else {
        ViolationMode::Abort
    }
}

/// Mapping protection from `CHAINALLOC_MAP_EXEC`, resolved once.
#[must_use]
pub fn runtime_map_protection() -> MapProtection {
    let v = resolve_cached(&CACHED_MAP_EXEC, MAP_RW, || {
        let exec = std::env::var("CHAINALLOC_MAP_EXEC")
            .map(|raw| parse_flag(&raw))
            .unwrap_or(false);
        if exec { MAP_RWX } else { MAP_RW }
    });
    if v == MAP_RWX {
        MapProtection::ReadWriteExec
    } else {
        MapProtection::ReadWrite
    }
}

fn parse_flag(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
