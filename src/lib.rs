//! benchprof - run benchmarks under perf counters and attribute the counts
//! to the function an external probe reports.
//!
//! # Modules
//!
//! - [`lifecycle`] - spawn benchmarks paused, resume them, reap them
//! - [`counters`] - per-benchmark perf counter sets and deltas
//! - [`probe`] - the probe's shared memory record
//! - [`sampler`] - timer driven sampling into the report
//! - [`writer`] - CSV rows written from signal context
//! - [`harness`] - runs a whole [`Config`]

pub mod clock;
pub mod counters;
pub mod harness;
pub mod label;
pub mod lifecycle;
pub mod perf;
pub mod probe;
pub mod sampler;
pub mod signals;
pub mod writer;

pub use harness::{run, BenchmarkReport, Config};
