//! Per-unit outcomes and their aggregation.

use serde::Serialize;

use batchflow_core::{Record, RecordId};

use crate::record_store::StoreError;

/// Why a single unit of work failed. Never escalated to the batch.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UnitError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("unit panicked: {0}")]
    Panicked(String),
}

/// Terminal result of one unit of work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitOutcome {
    /// Status transitioned and persisted.
    Success(Record),
    /// The id no longer resolves to a record; nothing was written.
    Absent(RecordId),
    /// A store operation failed (or the unit panicked).
    Failure { id: RecordId, error: UnitError },
}

impl UnitOutcome {
    pub fn record_id(&self) -> RecordId {
        match self {
            UnitOutcome::Success(record) => record.id_typed(),
            UnitOutcome::Absent(id) => *id,
            UnitOutcome::Failure { id, .. } => *id,
        }
    }

    pub fn into_record(self) -> Option<Record> {
        match self {
            UnitOutcome::Success(record) => Some(record),
            _ => None,
        }
    }
}

/// A failed unit, kept for reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitFailure {
    pub id: RecordId,
    pub error: UnitError,
}

/// Every outcome of a batch, partitioned by kind.
///
/// [`BatchReport::into_records`] gives the best-effort batch result; the other
/// two lists are the information that result intentionally drops.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub processed: Vec<Record>,
    pub absent: Vec<RecordId>,
    pub failures: Vec<UnitFailure>,
}

impl BatchReport {
    pub fn with_capacity(units: usize) -> Self {
        Self {
            processed: Vec::with_capacity(units),
            absent: Vec::new(),
            failures: Vec::new(),
        }
    }

    pub fn push(&mut self, outcome: UnitOutcome) {
        match outcome {
            UnitOutcome::Success(record) => self.processed.push(record),
            UnitOutcome::Absent(id) => self.absent.push(id),
            UnitOutcome::Failure { id, error } => self.failures.push(UnitFailure { id, error }),
        }
    }

    /// Number of units the batch scheduled.
    pub fn total(&self) -> usize {
        self.processed.len() + self.absent.len() + self.failures.len()
    }

    pub fn summary(&self) -> BatchSummary {
        BatchSummary {
            total: self.total(),
            processed: self.processed.len(),
            absent: self.absent.len(),
            failed: self.failures.len(),
        }
    }

    pub fn into_records(self) -> Vec<Record> {
        self.processed
    }
}

impl FromIterator<UnitOutcome> for BatchReport {
    fn from_iter<I: IntoIterator<Item = UnitOutcome>>(iter: I) -> Self {
        let mut report = BatchReport::default();
        for outcome in iter {
            report.push(outcome);
        }
        report
    }
}

/// Outcome counts of one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub total: usize,
    pub processed: usize,
    pub absent: usize,
    pub failed: usize,
}
