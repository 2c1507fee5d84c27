//! Completion handle for one batch.

use std::future::{Future, IntoFuture};
use std::pin::Pin;

use tokio::sync::oneshot;

use batchflow_core::{Record, RecordId};

use super::outcome::{BatchReport, UnitOutcome};
use crate::pool::PoolError;
use crate::record_store::StoreError;

/// Batch-level failure. Per-record failures never surface here.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BatchError {
    /// The id snapshot could not be read, so nothing was scheduled.
    #[error("failed to snapshot record ids: {0}")]
    Snapshot(StoreError),
    /// The worker pool was shut down before the batch could be scheduled.
    #[error("worker pool is shut down")]
    PoolClosed,
    /// Outcomes went missing between the workers and the join.
    #[error("batch aggregation failed: {0}")]
    Join(String),
}

impl From<PoolError> for BatchError {
    fn from(_: PoolError) -> Self {
        BatchError::PoolClosed
    }
}

/// A scheduled unit the join still has to hear from.
#[derive(Debug)]
pub(crate) struct PendingUnit {
    pub(crate) id: RecordId,
    pub(crate) outcome: oneshot::Receiver<UnitOutcome>,
}

pub(crate) type Snapshot = Result<Vec<PendingUnit>, StoreError>;

/// Handle to a running batch.
///
/// The work proceeds on the pool whether or not the handle is awaited, so a
/// caller may acknowledge the request first and join later. Joining consumes
/// the handle: it resolves exactly once, after every unit has reported.
///
/// The default result (`.await`, [`BatchHandle::join`]) is best-effort: records
/// that vanished or failed to save are silently left out. Use
/// [`BatchHandle::join_report`] to see them.
#[derive(Debug)]
pub struct BatchHandle {
    batch: u64,
    snapshot: Result<oneshot::Receiver<Snapshot>, BatchError>,
}

impl BatchHandle {
    pub(crate) fn scheduled(batch: u64, snapshot: oneshot::Receiver<Snapshot>) -> Self {
        Self {
            batch,
            snapshot: Ok(snapshot),
        }
    }

    pub(crate) fn failed(batch: u64, error: BatchError) -> Self {
        Self {
            batch,
            snapshot: Err(error),
        }
    }

    /// Sequence number of this batch within its processor (starts at 1).
    pub fn batch_number(&self) -> u64 {
        self.batch
    }

    /// Records that were transitioned and persisted, in no particular order.
    pub async fn join(self) -> Result<Vec<Record>, BatchError> {
        self.join_report().await.map(BatchReport::into_records)
    }

    /// Every outcome of the batch, including absent and failed records.
    pub async fn join_report(self) -> Result<BatchReport, BatchError> {
        let snapshot = self
            .snapshot?
            .await
            .map_err(|_| snapshot_lost(self.batch))?;
        let units = snapshot.map_err(BatchError::Snapshot)?;

        let mut report = BatchReport::with_capacity(units.len());
        let mut lost = Vec::new();
        for unit in units {
            match unit.outcome.await {
                Ok(outcome) => report.push(outcome),
                Err(_) => lost.push(unit.id),
            }
        }
        finish(self.batch, report, &lost)
    }

    /// Blocking [`BatchHandle::join`] for synchronous callers.
    ///
    /// Panics if called from within an async runtime.
    pub fn join_blocking(self) -> Result<Vec<Record>, BatchError> {
        self.join_report_blocking().map(BatchReport::into_records)
    }

    /// Blocking [`BatchHandle::join_report`]. Panics inside an async runtime.
    pub fn join_report_blocking(self) -> Result<BatchReport, BatchError> {
        let snapshot = self
            .snapshot?
            .blocking_recv()
            .map_err(|_| snapshot_lost(self.batch))?;
        let units = snapshot.map_err(BatchError::Snapshot)?;

        let mut report = BatchReport::with_capacity(units.len());
        let mut lost = Vec::new();
        for unit in units {
            match unit.outcome.blocking_recv() {
                Ok(outcome) => report.push(outcome),
                Err(_) => lost.push(unit.id),
            }
        }
        finish(self.batch, report, &lost)
    }
}

impl IntoFuture for BatchHandle {
    type Output = Result<Vec<Record>, BatchError>;
    type IntoFuture = Pin<Box<dyn Future<Output = Self::Output> + Send>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(self.join())
    }
}

fn snapshot_lost(batch: u64) -> BatchError {
    BatchError::Join(format!("batch {batch}: snapshot job ended without reporting"))
}

// Only called once every unit has been awaited.
fn finish(batch: u64, report: BatchReport, lost: &[RecordId]) -> Result<BatchReport, BatchError> {
    if lost.is_empty() {
        return Ok(report);
    }
    let ids: Vec<String> = lost.iter().map(ToString::to_string).collect();
    Err(BatchError::Join(format!(
        "batch {batch}: no outcome for {} unit(s): {}",
        lost.len(),
        ids.join(", ")
    )))
}
