//! Named deterministic scenarios.
//!
//! Each scenario runs against a fresh buffered allocator (4 KiB pages), checks
//! its expectations and returns a verdict plus the allocator's lifecycle
//! records, so a failing run can be replayed from the JSONL output alone.

#![allow(unsafe_code)]

use std::ptr::NonNull;
use std::time::Instant;

use chainalloc_core::malloc::{BufferMapper, BufferSegment};
use chainalloc_core::{
    AllocError, AllocatorConfig, AllocatorLogRecord, ChainAllocator, HEADER_SIZE, Origin,
};
use serde::Serialize;

use crate::structured_log::{LogEmitter, LogEntry, LogLevel, Outcome};

pub const SCENARIO_PAGE_SIZE: usize = 4096;

type Buffered = ChainAllocator<BufferSegment, BufferMapper>;

/// Verdict of one scenario.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioOutcome {
    pub name: &'static str,
    pub passed: bool,
    /// First failed expectation, if any.
    pub failure: Option<String>,
    pub duration_ms: u64,
    #[serde(skip)]
    pub lifecycle: Vec<AllocatorLogRecord>,
}

struct Scenario {
    name: &'static str,
    heap_capacity: usize,
    map_budget: usize,
    run: fn(&Buffered) -> Result<(), String>,
}

macro_rules! ensure {
    ($cond:expr, $($msg:tt)+) => {
        if !$cond {
            return Err(format!($($msg)+));
        }
    };
}

fn alloc(a: &Buffered, size: usize) -> Result<NonNull<u8>, String> {
    a.allocate(size).map_err(|e| format!("allocate({size}) failed: {e}"))
}

fn release(a: &Buffered, ptr: NonNull<u8>) -> Result<(), String> {
    a.release(ptr.as_ptr())
        .map_err(|e| format!("release({:p}) failed: {e}", ptr.as_ptr()))
}

fn fill(ptr: NonNull<u8>, len: usize, byte: u8) {
    // SAFETY: scenarios only fill allocations they own of at least `len` bytes.
    unsafe { std::ptr::write_bytes(ptr.as_ptr(), byte, len) };
}

fn all_equal(ptr: NonNull<u8>, len: usize, byte: u8) -> bool {
    // SAFETY: as in fill().
    unsafe { std::slice::from_raw_parts(ptr.as_ptr(), len) }
        .iter()
        .all(|&b| b == byte)
}

fn origin_of(a: &Buffered, ptr: NonNull<u8>) -> Result<Origin, String> {
    a.lookup(ptr.as_ptr())
        .map(|v| v.origin)
        .ok_or_else(|| format!("{:p} not found in chain", ptr.as_ptr()))
}

fn reuse_same_size(a: &Buffered) -> Result<(), String> {
    let first = alloc(a, 16)?;
    fill(first, 16, 0x41);
    release(a, first)?;
    let second = alloc(a, 16)?;
    ensure!(second == first, "expected reuse of {first:p}, got {second:p}");
    Ok(())
}

fn zero_allocate_after_release(a: &Buffered) -> Result<(), String> {
    let dirty = alloc(a, 16)?;
    fill(dirty, 16, 0xFF);
    release(a, dirty)?;
    let clean = a
        .zero_allocate(4, 4)
        .map_err(|e| format!("zero_allocate(4, 4) failed: {e}"))?;
    ensure!(clean == dirty, "expected reuse of {dirty:p}, got {clean:p}");
    ensure!(all_equal(clean, 16, 0), "reused block not zeroed");
    Ok(())
}

fn first_fit_order(a: &Buffered) -> Result<(), String> {
    let big = alloc(a, 512)?;
    let small = alloc(a, 64)?;
    let _pin = alloc(a, 8)?;
    release(a, big)?;
    release(a, small)?;
    let got = alloc(a, 32)?;
    ensure!(got == big, "first fit should pick the earlier 512-byte block");
    Ok(())
}

fn threshold_boundary(a: &Buffered) -> Result<(), String> {
    let below = alloc(a, SCENARIO_PAGE_SIZE - HEADER_SIZE - 1)?;
    let at = alloc(a, SCENARIO_PAGE_SIZE - HEADER_SIZE)?;
    ensure!(
        origin_of(a, below)? == Origin::HeapSegment,
        "one byte under the threshold must grow the heap segment"
    );
    ensure!(
        origin_of(a, at)? == Origin::Mapping,
        "HEADER_SIZE + size == page size must be mapped"
    );
    Ok(())
}

fn mapping_remainder(a: &Buffered) -> Result<(), String> {
    let size = 2 * SCENARIO_PAGE_SIZE + 8 - HEADER_SIZE;
    let big = alloc(a, size)?;
    let snapshot = a.snapshot();
    ensure!(snapshot.len() == 2, "expected mapping + remainder, got {} blocks", snapshot.len());
    let (head, rem) = (snapshot[0], snapshot[1]);
    ensure!(head.next == Some(rem.id), "remainder not chained behind its mapping");
    ensure!(rem.origin == Origin::MappingRemainder, "second block is {:?}", rem.origin);
    ensure!(rem.free && rem.size == 8, "remainder should be a free 8-byte block");
    let tiny = alloc(a, 8)?;
    ensure!(tiny.as_ptr() as usize == rem.payload, "8-byte request should land in the remainder");
    fill(big, size, 0x11);
    fill(tiny, 8, 0x22);
    ensure!(all_equal(big, size, 0x11), "remainder write reached the mapping payload");
    Ok(())
}

fn double_release(a: &Buffered) -> Result<(), String> {
    let ptr = alloc(a, 32)?;
    release(a, ptr)?;
    match a.release(ptr.as_ptr()) {
        Err(AllocError::DoubleRelease { .. }) => {}
        other => return Err(format!("expected DoubleRelease, got {other:?}")),
    }
    ensure!(a.stats().free_blocks == 1, "double release changed the chain");
    Ok(())
}

fn unknown_pointer(a: &Buffered) -> Result<(), String> {
    let ptr = alloc(a, 32)?;
    // SAFETY: interior offset within the 32-byte payload.
    let interior = unsafe { ptr.as_ptr().add(8) };
    match a.release(interior) {
        Err(AllocError::UnknownPointer { .. }) => {}
        other => return Err(format!("expected UnknownPointer, got {other:?}")),
    }
    Ok(())
}

fn zero_size_rejected(a: &Buffered) -> Result<(), String> {
    ensure!(
        matches!(a.allocate(0), Err(AllocError::InvalidArgument { .. })),
        "allocate(0) must be rejected"
    );
    ensure!(
        matches!(a.zero_allocate(usize::MAX, 3), Err(AllocError::InvalidArgument { .. })),
        "overflowing zero_allocate must be rejected"
    );
    ensure!(a.stats().blocks == 0, "rejected calls created blocks");
    Ok(())
}

fn heap_exhaustion(a: &Buffered) -> Result<(), String> {
    let ptr = alloc(a, 256 - HEADER_SIZE)?;
    match a.allocate(1) {
        Err(AllocError::ResourceExhausted { errno, .. }) if errno == libc::ENOMEM => {}
        other => return Err(format!("expected ResourceExhausted, got {other:?}")),
    }
    release(a, ptr)?;
    let again = alloc(a, 1)?;
    ensure!(again == ptr, "released block should serve the retry");
    Ok(())
}

const SCENARIOS: &[Scenario] = &[
    Scenario {
        name: "reuse_same_size",
        heap_capacity: 1 << 16,
        map_budget: 1 << 20,
        run: reuse_same_size,
    },
    Scenario {
        name: "zero_allocate_after_release",
        heap_capacity: 1 << 16,
        map_budget: 1 << 20,
        run: zero_allocate_after_release,
    },
    Scenario {
        name: "first_fit_order",
        heap_capacity: 1 << 16,
        map_budget: 1 << 20,
        run: first_fit_order,
    },
    Scenario {
        name: "threshold_boundary",
        heap_capacity: 1 << 16,
        map_budget: 1 << 20,
        run: threshold_boundary,
    },
    Scenario {
        name: "mapping_remainder",
        heap_capacity: 1 << 16,
        map_budget: 1 << 20,
        run: mapping_remainder,
    },
    Scenario {
        name: "double_release",
        heap_capacity: 1 << 16,
        map_budget: 1 << 20,
        run: double_release,
    },
    Scenario {
        name: "unknown_pointer",
        heap_capacity: 1 << 16,
        map_budget: 1 << 20,
        run: unknown_pointer,
    },
    Scenario {
        name: "zero_size_rejected",
        heap_capacity: 1 << 16,
        map_budget: 1 << 20,
        run: zero_size_rejected,
    },
    Scenario {
        name: "heap_exhaustion",
        heap_capacity: 256,
        map_budget: 0,
        run: heap_exhaustion,
    },
];

/// Names of all scenarios, in run order.
#[must_use]
pub fn names() -> Vec<&'static str> {
    SCENARIOS.iter().map(|s| s.name).collect()
}

fn run_one(scenario: &Scenario) -> ScenarioOutcome {
    let config = AllocatorConfig::new()
        .page_size(SCENARIO_PAGE_SIZE)
        .capture_lifecycle(true);
    let allocator = ChainAllocator::buffered(config, scenario.heap_capacity, scenario.map_budget);
    let start = Instant::now();
    let result = (scenario.run)(&allocator);
    let duration_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
    if let Err(reason) = &result {
        log::warn!("scenario {} failed: {reason}", scenario.name);
    }
    ScenarioOutcome {
        name: scenario.name,
        passed: result.is_ok(),
        failure: result.err(),
        duration_ms,
        lifecycle: allocator.drain_lifecycle_logs(),
    }
}

/// Runs the scenarios whose name contains `filter` (all when `None`).
#[must_use]
pub fn run_all(filter: Option<&str>) -> Vec<ScenarioOutcome> {
    SCENARIOS
        .iter()
        .filter(|s| filter.is_none_or(|f| s.name.contains(f)))
        .map(run_one)
        .collect()
}

/// Writes one verdict entry per scenario, each preceded by its lifecycle
/// records when `with_lifecycle` is set.
pub fn emit<W: std::io::Write>(
    emitter: &mut LogEmitter<W>,
    outcomes: &[ScenarioOutcome],
    with_lifecycle: bool,
) -> std::io::Result<()> {
    for outcome in outcomes {
        if with_lifecycle {
            for record in &outcome.lifecycle {
                emitter.emit_entry(LogEntry::from_lifecycle(record).with_scenario(outcome.name))?;
            }
        }
        let (level, verdict) = if outcome.passed {
            (LogLevel::Info, Outcome::Pass)
        } else {
            (LogLevel::Error, Outcome::Fail)
        };
        let entry = LogEntry::new("", level, "scenario_result")
            .with_scenario(outcome.name)
            .with_outcome(verdict)
            .with_duration_ms(outcome.duration_ms)
            .with_details(serde_json::json!({
                "failure": outcome.failure,
                "lifecycle_records": outcome.lifecycle.len(),
            }));
        emitter.emit_entry(entry)?;
    }
    emitter.flush()
}
