//! Concurrent status-transition batches.
//!
//! ## Design
//!
//! - One snapshot of the store's ids per batch
//! - One unit of work per id on the shared, fixed-size worker pool
//! - Every unit reports its own outcome over its own channel (no shared result list)
//! - A single join waits for every outcome before building the result
//!
//! ## Components
//!
//! - `BatchProcessor`: schedules batches and keeps running counters
//! - `BatchHandle`: awaitable completion of one batch
//! - `UnitOutcome` / `BatchReport`: per-record results and their aggregate

pub mod handle;
pub mod outcome;
pub mod processor;

pub use handle::{BatchError, BatchHandle};
pub use outcome::{BatchReport, BatchSummary, UnitError, UnitFailure, UnitOutcome};
pub use processor::{BatchProcessor, ProcessorConfig, ProcessorStats, StatsSnapshot};
