//! Fixed-size worker pool shared by every batch in the process.
//!
//! Workers are named OS threads pulling boxed jobs off one shared queue. The pool
//! is created once at startup and torn down with [`WorkerPool::shutdown`]: intake
//! closes, queued jobs still run, then the workers are joined.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, mpsc};
use std::thread;

use tracing::{debug, error, info};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of worker threads (fixed for the life of the pool)
    pub size: usize,
    /// Thread name prefix, also used in logs
    pub name: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: 10,
            name: "batchflow-worker".to_string(),
        }
    }
}

impl PoolConfig {
    pub fn with_size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

/// Worker pool error.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("worker pool size must be at least 1")]
    EmptyPool,
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("worker pool is shut down")]
    ShutDown,
}

/// Bounded pool of worker threads.
#[derive(Debug)]
pub struct WorkerPool {
    name: String,
    size: usize,
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl WorkerPool {
    /// Spawn `config.size` workers.
    pub fn new(config: PoolConfig) -> Result<Self, PoolError> {
        if config.size == 0 {
            return Err(PoolError::EmptyPool);
        }

        let (tx, rx) = mpsc::channel::<Job>();
        let rx = Arc::new(Mutex::new(rx));

        let mut workers = Vec::with_capacity(config.size);
        for index in 0..config.size {
            let rx = rx.clone();
            let pool_name = config.name.clone();
            let handle = thread::Builder::new()
                .name(format!("{}-{}", config.name, index))
                .spawn(move || worker_loop(&pool_name, index, &rx))?;
            workers.push(handle);
        }

        info!(pool = %config.name, size = config.size, "worker pool started");

        Ok(Self {
            name: config.name,
            size: config.size,
            sender: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_shut_down(&self) -> bool {
        lock(&self.sender).is_none()
    }

    /// Cloneable submission handle. Fails once the pool has been shut down.
    ///
    /// Jobs may carry a spawner to enqueue follow-up work; the queue stays open
    /// until the last spawner is dropped, so such follow-ups are never lost.
    /// Only jobs running on this pool hold spawners.
    pub(crate) fn spawner(&self) -> Result<Spawner, PoolError> {
        lock(&self.sender)
            .as_ref()
            .map(|tx| Spawner { sender: tx.clone() })
            .ok_or(PoolError::ShutDown)
    }

    /// Enqueue a job.
    pub fn execute<F>(&self, job: F) -> Result<(), PoolError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.spawner()?.execute(job)
    }

    /// Close intake, let queued jobs finish, and join every worker.
    ///
    /// Idempotent. Must not be called from one of the pool's own workers.
    /// Blocks until every outstanding [`Spawner`] has been dropped, which happens
    /// once the jobs carrying them have run.
    pub fn shutdown(&self) {
        let sender = lock(&self.sender).take();
        if sender.is_none() {
            return;
        }
        drop(sender);

        let workers: Vec<_> = lock(&self.workers).drain(..).collect();
        let current = thread::current().id();
        for handle in workers {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                error!(pool = %self.name, "worker thread terminated abnormally");
            }
        }

        info!(pool = %self.name, "worker pool stopped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Submission handle for a [`WorkerPool`].
#[derive(Debug, Clone)]
pub(crate) struct Spawner {
    sender: mpsc::Sender<Job>,
}

impl Spawner {
    pub(crate) fn execute<F>(&self, job: F) -> Result<(), PoolError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.sender
            .send(Box::new(job))
            .map_err(|_| PoolError::ShutDown)
    }
}

fn worker_loop(pool: &str, index: usize, rx: &Mutex<mpsc::Receiver<Job>>) {
    debug!(pool, worker = index, "worker started");

    loop {
        // The guard is a temporary, released before the job runs.
        let next = lock(rx).recv();
        let job = match next {
            Ok(job) => job,
            Err(_) => break,
        };

        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
            error!(
                pool,
                worker = index,
                panic = %panic_message(payload.as_ref()),
                "job panicked"
            );
        }
    }

    debug!(pool, worker = index, "worker stopped");
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
