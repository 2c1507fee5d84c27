//! Batch processor: snapshot ids, fan out one unit per id, fan in all outcomes.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use batchflow_core::{Record, RecordId};

use super::handle::{BatchError, BatchHandle, PendingUnit};
use super::outcome::{UnitError, UnitOutcome};
use crate::pool::{Spawner, WorkerPool, panic_message};
use crate::record_store::{RecordStore, StoreError};

/// Processor configuration.
#[derive(Debug, Clone, Default)]
pub struct ProcessorConfig {
    /// Artificial delay before each unit's read, standing in for store latency
    pub simulated_latency: Duration,
}

impl ProcessorConfig {
    pub fn with_simulated_latency(mut self, latency: Duration) -> Self {
        self.simulated_latency = latency;
        self
    }
}

/// Running counters across all batches of a processor.
#[derive(Debug, Default)]
pub struct ProcessorStats {
    sequence: AtomicU64,
    batches_started: AtomicU64,
    records_processed: AtomicU64,
    records_absent: AtomicU64,
    units_failed: AtomicU64,
}

impl ProcessorStats {
    /// Numbers every submission, including ones the pool rejects.
    fn next_batch(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn batch_started(&self) {
        self.batches_started.fetch_add(1, Ordering::Relaxed);
    }

    fn record(&self, outcome: &UnitOutcome) {
        let counter = match outcome {
            UnitOutcome::Success(_) => &self.records_processed,
            UnitOutcome::Absent(_) => &self.records_absent,
            UnitOutcome::Failure { .. } => &self.units_failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            batches_started: self.batches_started.load(Ordering::Relaxed),
            records_processed: self.records_processed.load(Ordering::Relaxed),
            records_absent: self.records_absent.load(Ordering::Relaxed),
            units_failed: self.units_failed.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`ProcessorStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Batches whose snapshot job reached the pool
    pub batches_started: u64,
    pub records_processed: u64,
    pub records_absent: u64,
    pub units_failed: u64,
}

/// Transitions every record in a store to `processed`.
///
/// Each batch runs on the shared [`WorkerPool`]; the processor never creates
/// threads of its own.
pub struct BatchProcessor<S> {
    store: Arc<S>,
    pool: Arc<WorkerPool>,
    config: ProcessorConfig,
    stats: Arc<ProcessorStats>,
}

impl<S: RecordStore + 'static> BatchProcessor<S> {
    pub fn new(store: Arc<S>, pool: Arc<WorkerPool>) -> Self {
        Self {
            store,
            pool,
            config: ProcessorConfig::default(),
            stats: Arc::new(ProcessorStats::default()),
        }
    }

    pub fn with_config(mut self, config: ProcessorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Start a batch over the ids the store holds right now.
    ///
    /// Returns immediately. Ids added or removed after the snapshot is taken are
    /// not part of this batch. Records that are missing or fail to save are
    /// dropped from the result rather than failing the batch; see
    /// [`BatchHandle::join_report`] for the full picture.
    pub fn process_all(&self) -> BatchHandle {
        let batch = self.stats.next_batch();

        let spawner = match self.pool.spawner() {
            Ok(spawner) => spawner,
            Err(e) => {
                warn!(batch, error = %e, "batch rejected");
                return BatchHandle::failed(batch, e.into());
            }
        };

        let (snapshot_tx, snapshot_rx) = oneshot::channel();
        let dispatcher = Dispatcher {
            batch,
            store: self.store.clone(),
            stats: self.stats.clone(),
            latency: self.config.simulated_latency,
            spawner: spawner.clone(),
        };

        let submitted = spawner.execute(move || {
            let snapshot = dispatcher.dispatch();
            let _ = snapshot_tx.send(snapshot);
        });

        match submitted {
            Ok(()) => {
                self.stats.batch_started();
                BatchHandle::scheduled(batch, snapshot_rx)
            }
            Err(e) => {
                warn!(batch, error = %e, "batch rejected");
                BatchHandle::failed(batch, BatchError::from(e))
            }
        }
    }
}

/// Snapshot job: reads the id set once and enqueues one unit per id.
struct Dispatcher<S> {
    batch: u64,
    store: Arc<S>,
    stats: Arc<ProcessorStats>,
    latency: Duration,
    spawner: Spawner,
}

impl<S: RecordStore + 'static> Dispatcher<S> {
    fn dispatch(self) -> Result<Vec<PendingUnit>, StoreError> {
        let batch = self.batch;
        let ids = self.store.list_ids().inspect_err(|e| {
            warn!(batch, error = %e, "failed to snapshot record ids");
        })?;

        info!(batch, units = ids.len(), "batch scheduled");

        let mut pending = Vec::with_capacity(ids.len());
        for id in ids {
            let (tx, rx) = oneshot::channel();
            let unit = UnitOfWork {
                batch,
                id,
                store: self.store.clone(),
                stats: self.stats.clone(),
                latency: self.latency,
            };
            if let Err(e) = self.spawner.execute(move || {
                let _ = tx.send(unit.run());
            }) {
                // The outcome sender went down with the job; the join reports it.
                error!(batch, record_id = %id, error = %e, "failed to schedule unit");
            }
            pending.push(PendingUnit { id, outcome: rx });
        }
        Ok(pending)
    }
}

/// Read-mutate-write of a single record.
struct UnitOfWork<S> {
    batch: u64,
    id: RecordId,
    store: Arc<S>,
    stats: Arc<ProcessorStats>,
    latency: Duration,
}

impl<S: RecordStore> UnitOfWork<S> {
    fn run(self) -> UnitOutcome {
        let (batch, id) = (self.batch, self.id);

        let outcome = match panic::catch_unwind(AssertUnwindSafe(|| self.transition())) {
            Ok(Ok(Some(record))) => UnitOutcome::Success(record),
            Ok(Ok(None)) => UnitOutcome::Absent(id),
            Ok(Err(e)) => UnitOutcome::Failure {
                id,
                error: UnitError::Store(e),
            },
            Err(payload) => UnitOutcome::Failure {
                id,
                error: UnitError::Panicked(panic_message(payload.as_ref())),
            },
        };

        match &outcome {
            UnitOutcome::Success(record) => {
                debug!(batch, record_id = %id, version = record.version(), "record processed");
            }
            UnitOutcome::Absent(_) => debug!(batch, record_id = %id, "record absent, skipped"),
            UnitOutcome::Failure { error, .. } => {
                warn!(batch, record_id = %id, error = %error, "record failed");
            }
        }

        self.stats.record(&outcome);
        outcome
    }

    fn transition(&self) -> Result<Option<Record>, StoreError> {
        if !self.latency.is_zero() {
            thread::sleep(self.latency);
        }

        let Some(mut record) = self.store.get(self.id)? else {
            return Ok(None);
        };
        record.mark_processed();
        self.store.put(record).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeSet, HashSet};
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::sync::{Mutex, OnceLock};

    use batchflow_core::status;
    use proptest::prelude::*;

    use crate::pool::PoolConfig;
    use crate::record_store::InMemoryRecordStore;

    /// Pool shared by every test, the way a process shares one pool.
    fn shared_pool() -> Arc<WorkerPool> {
        static POOL: OnceLock<Arc<WorkerPool>> = OnceLock::new();
        POOL.get_or_init(|| {
            Arc::new(
                WorkerPool::new(PoolConfig::default().with_size(4).with_name("processor-test"))
                    .unwrap(),
            )
        })
        .clone()
    }

    /// In-memory store with injectable faults.
    #[derive(Default)]
    struct ScriptedStore {
        inner: InMemoryRecordStore,
        listed_only: Vec<RecordId>,
        failing_gets: HashSet<RecordId>,
        failing_puts: HashSet<RecordId>,
        panicking_gets: HashSet<RecordId>,
        list_unavailable: bool,
        gate: Option<Gate>,
        gets: AtomicUsize,
        puts: AtomicUsize,
    }

    /// Blocks reads of one id until released, announcing when a read is waiting.
    struct Gate {
        id: RecordId,
        entered: Mutex<mpsc::Sender<()>>,
        release: Mutex<mpsc::Receiver<()>>,
    }

    impl Gate {
        /// Returns the gate plus (entered, release) ends for the test body.
        fn new(id: u64) -> (Self, mpsc::Receiver<()>, mpsc::Sender<()>) {
            let (entered_tx, entered_rx) = mpsc::channel();
            let (release_tx, release_rx) = mpsc::channel();
            let gate = Gate {
                id: RecordId::new(id),
                entered: Mutex::new(entered_tx),
                release: Mutex::new(release_rx),
            };
            (gate, entered_rx, release_tx)
        }
    }

    impl ScriptedStore {
        fn with_records(ids: &[u64]) -> Self {
            let store = Self::default();
            for &raw in ids {
                store.inner.seed(Record::new(RecordId::new(raw), format!("record-{raw}")));
            }
            store
        }

        fn calls(&self) -> (usize, usize) {
            (self.gets.load(Ordering::SeqCst), self.puts.load(Ordering::SeqCst))
        }
    }

    impl RecordStore for ScriptedStore {
        fn list_ids(&self) -> Result<Vec<RecordId>, StoreError> {
            if self.list_unavailable {
                return Err(StoreError::unavailable("listing offline"));
            }
            let mut ids = self.inner.list_ids()?;
            ids.extend(self.listed_only.iter().copied());
            Ok(ids)
        }

        fn get(&self, id: RecordId) -> Result<Option<Record>, StoreError> {
            self.gets.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = self.gate.as_ref().filter(|g| g.id == id) {
                let _ = gate.entered.lock().unwrap().send(());
                let _ = gate.release.lock().unwrap().recv();
            }
            if self.panicking_gets.contains(&id) {
                panic!("driver crashed reading {id}");
            }
            if self.failing_gets.contains(&id) {
                return Err(StoreError::unavailable(format!("read of {id} timed out")));
            }
            self.inner.get(id)
        }

        fn put(&self, record: Record) -> Result<Record, StoreError> {
            self.puts.fetch_add(1, Ordering::SeqCst);
            if self.failing_puts.contains(&record.id_typed()) {
                return Err(StoreError::rejected("constraint violated"));
            }
            self.inner.put(record)
        }
    }

    fn processor(store: ScriptedStore) -> BatchProcessor<ScriptedStore> {
        BatchProcessor::new(Arc::new(store), shared_pool())
    }

    fn ids_of(records: &[Record]) -> BTreeSet<u64> {
        records.iter().map(|r| r.id_typed().get()).collect()
    }

    #[tokio::test]
    async fn single_record_is_processed() {
        let processor = processor(ScriptedStore::with_records(&[1]));

        let result = processor.process_all().await.unwrap();

        assert_eq!(result.len(), 1);
        assert_eq!(result[0].id_typed(), RecordId::new(1));
        assert_eq!(result[0].status, status::PROCESSED);
        let stored = processor.store().inner.get(RecordId::new(1)).unwrap().unwrap();
        assert_eq!(stored.status, status::PROCESSED);
    }

    #[tokio::test]
    async fn missing_record_is_silently_skipped() {
        let store = ScriptedStore {
            listed_only: vec![RecordId::new(2)],
            ..ScriptedStore::default()
        };
        let processor = processor(store);

        let report = processor.process_all().join_report().await.unwrap();

        assert!(report.processed.is_empty());
        assert_eq!(report.absent, vec![RecordId::new(2)]);
        assert!(report.failures.is_empty());
        assert!(processor.store().inner.is_empty());
    }

    #[tokio::test]
    async fn each_unit_reads_once_and_writes_at_most_once() {
        let ids: Vec<u64> = (1..=20).collect();
        let mut store = ScriptedStore::with_records(&ids);
        store.listed_only = vec![RecordId::new(40), RecordId::new(41)];
        let processor = processor(store);

        let result = processor.process_all().await.unwrap();

        assert_eq!(result.len(), 20);
        assert_eq!(processor.store().calls(), (22, 20));
    }

    #[tokio::test]
    async fn failed_read_is_never_followed_by_a_write() {
        let mut store = ScriptedStore::with_records(&[1, 2, 3]);
        store.failing_gets.insert(RecordId::new(2));
        store.panicking_gets.insert(RecordId::new(3));
        let processor = processor(store);

        let report = processor.process_all().join_report().await.unwrap();

        assert_eq!(report.failures.len(), 2);
        assert_eq!(processor.store().calls(), (3, 1));
    }

    #[tokio::test]
    async fn failed_read_is_contained_to_its_record() {
        let mut store = ScriptedStore::with_records(&[1, 2, 3]);
        store.failing_gets.insert(RecordId::new(2));
        let processor = processor(store);

        let report = processor.process_all().join_report().await.unwrap();

        assert_eq!(ids_of(&report.processed), BTreeSet::from([1, 3]));
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].id, RecordId::new(2));
        assert!(matches!(
            report.failures[0].error,
            UnitError::Store(StoreError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn rejected_write_does_not_affect_siblings() {
        let mut store = ScriptedStore::with_records(&[1, 2, 3, 4]);
        store.failing_puts.insert(RecordId::new(4));
        let processor = processor(store);

        let result = processor.process_all().await.unwrap();

        assert_eq!(ids_of(&result), BTreeSet::from([1, 2, 3]));
        let untouched = processor.store().inner.get(RecordId::new(4)).unwrap().unwrap();
        assert_eq!(untouched.status, status::UNPROCESSED);
    }

    #[tokio::test]
    async fn panicking_unit_becomes_a_failure() {
        let mut store = ScriptedStore::with_records(&[1, 2]);
        store.panicking_gets.insert(RecordId::new(1));
        let processor = processor(store);

        let report = processor.process_all().join_report().await.unwrap();

        assert_eq!(ids_of(&report.processed), BTreeSet::from([2]));
        assert!(matches!(report.failures[0].error, UnitError::Panicked(ref msg) if msg.contains("driver crashed")));
    }

    #[tokio::test]
    async fn handle_stays_pending_while_a_unit_is_blocked() {
        let (gate, entered, release) = Gate::new(2);
        let mut store = ScriptedStore::with_records(&[1, 2, 3]);
        store.gate = Some(gate);
        let processor = processor(store);

        let join = tokio::spawn(processor.process_all().join());
        entered.recv_timeout(Duration::from_secs(5)).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!join.is_finished());

        release.send(()).unwrap();
        let result = join.await.unwrap().unwrap();
        assert_eq!(ids_of(&result), BTreeSet::from([1, 2, 3]));
    }

    #[tokio::test]
    async fn reprocessing_is_a_no_op_transition() {
        let store = ScriptedStore::default();
        for raw in [1, 2] {
            store.inner.seed(
                Record::new(RecordId::new(raw), "done").with_status(status::PROCESSED),
            );
        }
        let before = store.inner.list();
        let processor = processor(store);

        let mut first = processor.process_all().await.unwrap();
        let mut second = processor.process_all().await.unwrap();
        first.sort_by_key(Record::id_typed);
        second.sort_by_key(Record::id_typed);

        assert_eq!(first, before);
        assert_eq!(second, before);
    }

    #[tokio::test]
    async fn snapshot_failure_fails_the_batch() {
        let store = ScriptedStore {
            list_unavailable: true,
            ..ScriptedStore::with_records(&[1])
        };
        let processor = processor(store);

        let err = processor.process_all().await.unwrap_err();

        assert!(matches!(err, BatchError::Snapshot(StoreError::Unavailable(_))));
    }

    #[test]
    fn ids_added_after_snapshot_are_not_in_the_batch() {
        let (gate, entered, release) = Gate::new(1);
        let mut store = ScriptedStore::with_records(&[1]);
        store.gate = Some(gate);
        let processor = processor(store);

        let handle = processor.process_all();
        entered.recv_timeout(Duration::from_secs(5)).unwrap();
        processor.store().inner.seed(Record::new(RecordId::new(5), "late"));
        release.send(()).unwrap();

        let result = handle.join_blocking().unwrap();
        assert_eq!(ids_of(&result), BTreeSet::from([1]));
        assert!(processor.store().inner.get(RecordId::new(5)).unwrap().is_some());
    }

    #[test]
    fn closed_pool_rejects_new_batches() {
        let pool = Arc::new(WorkerPool::new(PoolConfig::default().with_size(1)).unwrap());
        let processor = BatchProcessor::new(Arc::new(ScriptedStore::with_records(&[1])), pool.clone());
        pool.shutdown();

        let handle = processor.process_all();
        assert_eq!(handle.batch_number(), 1);
        assert_eq!(handle.join_blocking(), Err(BatchError::PoolClosed));
        assert_eq!(processor.stats().batches_started, 0);
        assert_eq!(processor.store().calls(), (0, 0));
    }

    #[test]
    fn pool_is_reused_across_batches_and_stats_accumulate() {
        let mut store = ScriptedStore::with_records(&[1, 2, 3]);
        store.listed_only.push(RecordId::new(9));
        store.failing_puts.insert(RecordId::new(3));
        let processor = processor(store);

        for _ in 0..3 {
            let result = processor.process_all().join_blocking().unwrap();
            assert_eq!(ids_of(&result), BTreeSet::from([1, 2]));
        }

        assert_eq!(
            processor.stats(),
            StatsSnapshot {
                batches_started: 3,
                records_processed: 6,
                records_absent: 3,
                units_failed: 3,
            }
        );
        assert!(!processor.pool().is_shut_down());
    }

    #[test]
    fn simulated_latency_is_applied_per_unit() {
        let pool = Arc::new(WorkerPool::new(PoolConfig::default().with_size(1)).unwrap());
        let processor = BatchProcessor::new(Arc::new(ScriptedStore::with_records(&[1, 2])), pool)
            .with_config(ProcessorConfig::default().with_simulated_latency(Duration::from_millis(20)));

        let started = std::time::Instant::now();
        let result = processor.process_all().join_blocking().unwrap();

        assert_eq!(result.len(), 2);
        assert!(started.elapsed() >= Duration::from_millis(40));
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 64,
            ..ProptestConfig::default()
        })]

        /// Property: the result holds exactly the stored ids whose read and write
        /// both succeeded, each in the processed state.
        #[test]
        fn result_is_exactly_the_clean_transitions(
            stored in prop::collection::btree_set(1u64..200, 0..40),
            phantom in prop::collection::btree_set(200u64..260, 0..5),
            bad_reads in prop::collection::btree_set(1u64..200, 0..10),
            bad_writes in prop::collection::btree_set(1u64..200, 0..10),
        ) {
            let ids: Vec<u64> = stored.iter().copied().collect();
            let mut store = ScriptedStore::with_records(&ids);
            store.listed_only = phantom.iter().copied().map(RecordId::new).collect();
            store.failing_gets = bad_reads.iter().copied().map(RecordId::new).collect();
            store.failing_puts = bad_writes.iter().copied().map(RecordId::new).collect();
            let processor = processor(store);

            let report = processor.process_all().join_report_blocking().unwrap();

            let expected: BTreeSet<u64> = stored
                .iter()
                .copied()
                .filter(|id| !bad_reads.contains(id) && !bad_writes.contains(id))
                .collect();
            prop_assert_eq!(ids_of(&report.processed), expected);
            prop_assert!(report.processed.iter().all(Record::is_processed));
            prop_assert_eq!(report.total(), stored.len() + phantom.len());
            prop_assert_eq!(report.absent.len(), phantom.len());

            let readable = stored.iter().filter(|id| !bad_reads.contains(id)).count();
            prop_assert_eq!(processor.store().calls(), (stored.len() + phantom.len(), readable));
        }
    }
}
