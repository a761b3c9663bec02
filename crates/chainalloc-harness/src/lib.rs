//! Verification harness for chainalloc.
//!
//! This crate provides:
//! - Scenarios: named, deterministic allocate/release sequences with pass/fail
//!   verdicts and the allocator's lifecycle records
//! - Stress: shared-instance multi-thread runs that check no block is ever
//!   handed to two owners, summarized as a JSON report
//! - Structured logging: JSONL records for both

#![deny(unsafe_code)]

pub mod error;
pub mod scenarios;
pub mod stress;
pub mod structured_log;

pub use error::HarnessError;
pub use scenarios::{ScenarioOutcome, run_all as run_scenarios};
pub use stress::{BackendKind, StressConfig, StressReport};
