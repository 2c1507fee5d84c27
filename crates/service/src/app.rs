//! Process wiring: one store, one worker pool, one processor, one tracker.
//!
//! The pool is created here once and shared by every batch until
//! [`Services::shutdown`] at process exit.

use std::sync::Arc;

use batchflow_core::{Record, RecordId};
use batchflow_infra::{
    BatchProcessor, BatchflowConfig, InMemoryRecordStore, PoolError, WorkerPool,
};

use crate::tracker::{AcceptedBatch, BatchTracker};

/// Long-lived services shared by every request.
pub struct Services {
    pub config: BatchflowConfig,
    pub store: Arc<InMemoryRecordStore>,
    pub pool: Arc<WorkerPool>,
    pub processor: BatchProcessor<InMemoryRecordStore>,
    pub tracker: BatchTracker,
}

/// Build the process-wide services from configuration.
pub fn build_services(config: BatchflowConfig) -> Result<Services, PoolError> {
    let store = InMemoryRecordStore::arc();
    let pool = Arc::new(WorkerPool::new(config.pool.clone())?);
    let processor = BatchProcessor::new(store.clone(), pool.clone())
        .with_config(config.processor.clone());

    Ok(Services {
        config,
        store,
        pool,
        processor,
        tracker: BatchTracker::new(),
    })
}

impl Services {
    /// Accept a batch over every stored record and return without waiting.
    pub async fn process_items(&self) -> AcceptedBatch {
        self.tracker.submit(&self.processor).await
    }

    /// Drain and stop the worker pool. Blocks until queued work is done.
    pub fn shutdown(&self) {
        self.pool.shutdown();
    }
}

/// Fill `store` with `count` unprocessed demo records (ids `1..=count`).
pub fn seed_demo_records(store: &InMemoryRecordStore, count: usize) -> Vec<Record> {
    (1..=count as u64)
        .map(|n| {
            store.seed(
                Record::new(RecordId::new(n), format!("item-{n}"))
                    .with_description(format!("demo record {n}"))
                    .with_email(format!("item{n}@example.com")),
            )
        })
        .collect()
}
