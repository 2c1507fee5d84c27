use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::RecordId;

/// Status tags understood by the batch processor.
///
/// `status` is free-form; these are the only two values with batch semantics.
pub mod status {
    pub const UNPROCESSED: &str = "unprocessed";
    pub const PROCESSED: &str = "processed";
}

/// A stored record whose status is transitioned by batches.
///
/// `name`, `description` and `email` are payload the processor never inspects.
/// `version` and `updated_at` are assigned by the store on every accepted write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    id: RecordId,
    pub name: String,
    pub description: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default)]
    version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    updated_at: Option<DateTime<Utc>>,
}

impl Record {
    /// Create a fresh, never-persisted record in the `unprocessed` state.
    pub fn new(id: RecordId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            description: String::new(),
            status: status::UNPROCESSED.to_string(),
            email: None,
            version: 0,
            updated_at: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = status.into();
        self
    }

    pub fn id_typed(&self) -> RecordId {
        self.id
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }

    pub fn is_processed(&self) -> bool {
        self.status == status::PROCESSED
    }

    /// Transition to `processed`. Re-applying on a processed record is a no-op.
    pub fn mark_processed(&mut self) {
        if !self.is_processed() {
            self.status = status::PROCESSED.to_string();
        }
    }

    /// Optimistic concurrency check against the version a writer read.
    pub fn check_version(&self, expected: u64) -> DomainResult<()> {
        if self.version == expected {
            Ok(())
        } else {
            Err(DomainError::conflict(format!(
                "record {} is at version {}, write was based on version {}",
                self.id, self.version, expected
            )))
        }
    }

    /// True when `other` carries the same caller-owned fields as `self`.
    ///
    /// Store-assigned fields (`version`, `updated_at`) are ignored.
    pub fn same_content(&self, other: &Record) -> bool {
        self.id == other.id
            && self.name == other.name
            && self.description == other.description
            && self.status == other.status
            && self.email == other.email
    }

    /// Fill in store-assigned fields after an accepted write.
    pub fn stamped(mut self, version: u64, at: DateTime<Utc>) -> Self {
        self.version = version;
        self.updated_at = Some(at);
        self
    }
}
