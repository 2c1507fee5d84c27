//! `batchflow-core` — domain building blocks for status-transition batches.
//!
//! This crate contains **pure domain** types (no infrastructure concerns).

pub mod error;
pub mod id;
pub mod record;

pub use error::{DomainError, DomainResult};
pub use id::RecordId;
pub use record::{Record, status};
