//! Record store contract consumed by the batch processor, plus an in-memory
//! implementation for tests/dev.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::Utc;

use batchflow_core::{DomainError, Record, RecordId};

/// Storage operations the batch processor relies on.
///
/// Implementations may block on I/O; they are only ever called from pool workers.
pub trait RecordStore: Send + Sync {
    /// All ids currently known to the store.
    fn list_ids(&self) -> Result<Vec<RecordId>, StoreError>;

    /// Load a record. A missing record is `Ok(None)`, not an error.
    fn get(&self, id: RecordId) -> Result<Option<Record>, StoreError>;

    /// Persist a record and return it with store-assigned fields filled in.
    fn put(&self, record: Record) -> Result<Record, StoreError>;
}

impl<S> RecordStore for Arc<S>
where
    S: RecordStore + ?Sized,
{
    fn list_ids(&self) -> Result<Vec<RecordId>, StoreError> {
        (**self).list_ids()
    }

    fn get(&self, id: RecordId) -> Result<Option<Record>, StoreError> {
        (**self).get(id)
    }

    fn put(&self, record: Record) -> Result<Record, StoreError> {
        (**self).put(record)
    }
}

/// Record store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// Transient: the store could not be reached. Callers of the store may retry.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// The store refused the write (stale version, constraint violation).
    #[error("write rejected: {0}")]
    WriteRejected(String),
}

impl StoreError {
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    pub fn rejected(msg: impl Into<String>) -> Self {
        Self::WriteRejected(msg.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

impl From<DomainError> for StoreError {
    fn from(value: DomainError) -> Self {
        StoreError::WriteRejected(value.to_string())
    }
}

/// In-memory record store for tests/dev.
///
/// Writes are version-checked: a `put` must carry the version it read. A `put`
/// that changes no caller-owned field returns the stored record untouched.
#[derive(Debug)]
pub struct InMemoryRecordStore {
    records: RwLock<BTreeMap<RecordId, Record>>,
    next_id: AtomicU64,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Store a new record under a freshly assigned id.
    pub fn insert(&self, name: impl Into<String>, description: impl Into<String>) -> Record {
        let id = RecordId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let record = Record::new(id, name)
            .with_description(description)
            .stamped(1, Utc::now());
        self.write_map().insert(id, record.clone());
        record
    }

    /// Store `record` as-is under its own id, replacing anything there.
    pub fn seed(&self, record: Record) -> Record {
        let id = record.id_typed();
        self.next_id.fetch_max(id.get().saturating_add(1), Ordering::Relaxed);
        let record = record.stamped(1, Utc::now());
        self.write_map().insert(id, record.clone());
        record
    }

    pub fn list(&self) -> Vec<Record> {
        self.read_map().values().cloned().collect()
    }

    pub fn remove(&self, id: RecordId) -> Option<Record> {
        self.write_map().remove(&id)
    }

    pub fn len(&self) -> usize {
        self.read_map().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read_map().is_empty()
    }

    fn read_map(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<RecordId, Record>> {
        self.records.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_map(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<RecordId, Record>> {
        self.records.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for InMemoryRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordStore for InMemoryRecordStore {
    fn list_ids(&self) -> Result<Vec<RecordId>, StoreError> {
        Ok(self.read_map().keys().copied().collect())
    }

    fn get(&self, id: RecordId) -> Result<Option<Record>, StoreError> {
        Ok(self.read_map().get(&id).cloned())
    }

    fn put(&self, record: Record) -> Result<Record, StoreError> {
        let mut map = self.write_map();
        let id = record.id_typed();

        match map.get(&id) {
            Some(stored) => {
                stored.check_version(record.version())?;
                if stored.same_content(&record) {
                    return Ok(stored.clone());
                }
                let persisted = record.stamped(stored.version() + 1, Utc::now());
                map.insert(id, persisted.clone());
                Ok(persisted)
            }
            None => {
                if record.version() != 0 {
                    return Err(StoreError::rejected(format!(
                        "record {id} no longer exists"
                    )));
                }
                self.next_id.fetch_max(id.get().saturating_add(1), Ordering::Relaxed);
                let persisted = record.stamped(1, Utc::now());
                map.insert(id, persisted.clone());
                Ok(persisted)
            }
        }
    }
}
