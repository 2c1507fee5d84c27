//! Infrastructure layer: record store contract, worker pool, batch processing, config.

pub mod batch;
pub mod config;
pub mod pool;
pub mod record_store;

pub use batch::{BatchError, BatchHandle, BatchProcessor, BatchReport};
pub use config::{BatchflowConfig, ConfigError};
pub use pool::{PoolConfig, PoolError, WorkerPool};
pub use record_store::{InMemoryRecordStore, RecordStore, StoreError};
