//! Benchmarks for chainalloc live under `benches/`.
//!
//! The ABI crate is deliberately not a dependency: the bench profile builds
//! without debug assertions, which would export its `malloc` into the bench
//! binary itself.
