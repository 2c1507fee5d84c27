//! Fire-and-track registry for submitted batches.
//!
//! `submit` returns as soon as the batch is scheduled; its state can then be
//! polled by id while the returned completion handle stays the authoritative
//! completion signal.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use uuid::Uuid;

use batchflow_infra::batch::BatchSummary;
use batchflow_infra::{BatchError, BatchProcessor, BatchReport, RecordStore};

/// Identifier of a tracked batch.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct BatchId(Uuid);

impl BatchId {
    /// Create a new identifier (UUIDv7, time-ordered).
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for BatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for BatchId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Lifecycle of a tracked batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum BatchState {
    Running {
        submitted_at: DateTime<Utc>,
    },
    Completed {
        submitted_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        summary: BatchSummary,
    },
    Failed {
        submitted_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        error: String,
    },
}

impl BatchState {
    pub fn is_running(&self) -> bool {
        matches!(self, BatchState::Running { .. })
    }

    pub fn submitted_at(&self) -> DateTime<Utc> {
        match self {
            BatchState::Running { submitted_at }
            | BatchState::Completed { submitted_at, .. }
            | BatchState::Failed { submitted_at, .. } => *submitted_at,
        }
    }
}

/// A batch that has been accepted for processing.
#[derive(Debug)]
pub struct AcceptedBatch {
    pub id: BatchId,
    pub completion: JoinHandle<Result<BatchReport, BatchError>>,
}

impl AcceptedBatch {
    /// Wait for the batch to finish.
    pub async fn wait(self) -> Result<BatchReport, BatchError> {
        self.completion
            .await
            .map_err(|e| BatchError::Join(format!("batch {}: tracking task failed: {e}", self.id)))?
    }
}

/// Finished batches kept by default before the oldest are evicted.
pub const DEFAULT_RETENTION: usize = 256;

/// In-memory registry of submitted batches.
///
/// Running batches are always kept. Once more than `retention` batches have
/// finished, the oldest finished ones are evicted; [`BatchTracker::forget`]
/// drops one earlier.
#[derive(Debug, Clone)]
pub struct BatchTracker {
    batches: Arc<RwLock<HashMap<BatchId, BatchState>>>,
    retention: usize,
}

impl Default for BatchTracker {
    fn default() -> Self {
        Self {
            batches: Arc::default(),
            retention: DEFAULT_RETENTION,
        }
    }
}

impl BatchTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep at most `retention` finished batches.
    pub fn with_retention(mut self, retention: usize) -> Self {
        self.retention = retention;
        self
    }

    /// Start a batch on `processor` and track it. Must run inside a Tokio runtime.
    pub async fn submit<S>(&self, processor: &BatchProcessor<S>) -> AcceptedBatch
    where
        S: RecordStore + 'static,
    {
        let id = BatchId::new();
        let submitted_at = Utc::now();
        let handle = processor.process_all();

        self.batches
            .write()
            .await
            .insert(id, BatchState::Running { submitted_at });
        tracing::info!(batch_id = %id, batch = handle.batch_number(), "batch accepted");

        let batches = self.batches.clone();
        let retention = self.retention;
        let completion = tokio::spawn(async move {
            let result = handle.join_report().await;
            let finished_at = Utc::now();

            let state = match &result {
                Ok(report) => {
                    let summary = report.summary();
                    tracing::info!(
                        batch_id = %id,
                        total = summary.total,
                        processed = summary.processed,
                        absent = summary.absent,
                        failed = summary.failed,
                        "batch completed"
                    );
                    BatchState::Completed {
                        submitted_at,
                        finished_at,
                        summary,
                    }
                }
                Err(e) => {
                    tracing::warn!(batch_id = %id, error = %e, "batch failed");
                    BatchState::Failed {
                        submitted_at,
                        finished_at,
                        error: e.to_string(),
                    }
                }
            };

            let mut batches = batches.write().await;
            batches.insert(id, state);
            evict_finished(&mut batches, retention);
            result
        });

        AcceptedBatch { id, completion }
    }

    pub async fn status(&self, id: &BatchId) -> Option<BatchState> {
        self.batches.read().await.get(id).cloned()
    }

    /// All tracked batches, oldest first.
    pub async fn list(&self) -> Vec<(BatchId, BatchState)> {
        let mut all: Vec<_> = self
            .batches
            .read()
            .await
            .iter()
            .map(|(id, state)| (*id, state.clone()))
            .collect();
        all.sort_by_key(|(id, state)| (state.submitted_at(), *id.as_uuid()));
        all
    }

    /// Drop a finished batch from the registry. Running batches are kept.
    pub async fn forget(&self, id: &BatchId) -> Option<BatchState> {
        let mut batches = self.batches.write().await;
        if batches.get(id).is_some_and(BatchState::is_running) {
            return None;
        }
        batches.remove(id)
    }
}

fn evict_finished(batches: &mut HashMap<BatchId, BatchState>, retention: usize) {
    let mut finished: Vec<_> = batches
        .iter()
        .filter(|(_, state)| !state.is_running())
        .map(|(id, state)| (*id, state.submitted_at()))
        .collect();
    if finished.len() <= retention {
        return;
    }
    finished.sort_unstable_by_key(|(id, submitted_at)| (*submitted_at, *id.as_uuid()));
    let excess = finished.len() - retention;
    for (id, _) in finished.into_iter().take(excess) {
        batches.remove(&id);
    }
}
