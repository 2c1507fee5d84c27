//! Service layer: process wiring and fire-and-track batch submission.

pub mod app;
pub mod tracker;

pub use app::{Services, build_services, seed_demo_records};
pub use tracker::{AcceptedBatch, BatchId, BatchState, BatchTracker};
