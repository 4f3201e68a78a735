//! Bounded pool of worker threads backing one operation queue.
//!
//! A fixed number of long-lived OS threads pull tasks from a shared channel.
//! Submitting never blocks: when every worker is busy the task waits in the
//! channel until one frees up.
//!
//! # Features
//!
//! - Configurable number of workers
//! - Panics inside a task are caught and counted, the worker keeps running
//! - Graceful shutdown that drains the backlog
//! - Pool statistics tracking

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info};

/// Errors that can occur in the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// A worker thread could not be spawned.
    #[error("Worker initialization failed: {0}")]
    WorkerInitFailed(String),

    /// The pool was configured with zero workers.
    #[error("Worker pool '{0}' needs at least one worker")]
    InvalidSize(String),

    /// Pool has been shut down.
    #[error("Pool is not running")]
    NotRunning,
}

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Name of the pool, usually the queue name.
    pub name: String,
    /// Number of worker threads to spawn.
    pub num_workers: usize,
    /// Prefix for worker thread names.
    pub thread_name_prefix: String,
}

impl WorkerPoolConfig {
    /// Creates a new configuration with the specified number of workers.
    pub fn new(name: impl Into<String>, num_workers: usize) -> Self {
        Self {
            name: name.into(),
            num_workers,
            thread_name_prefix: "pkgorch".to_string(),
        }
    }

    /// Sets the thread name prefix.
    pub fn with_thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }
}

/// Statistics about the worker pool.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolStats {
    /// Total number of workers in the pool.
    pub num_workers: usize,
    /// Number of workers currently running a task.
    pub active_workers: usize,
    /// Tasks waiting for a free worker.
    pub backlog: usize,
    /// Tasks that returned normally.
    pub tasks_completed: u64,
    /// Tasks that panicked.
    pub tasks_panicked: u64,
}

impl PoolStats {
    /// Returns the total number of tasks processed.
    pub fn total_processed(&self) -> u64 {
        self.tasks_completed + self.tasks_panicked
    }
}

/// Shared state for tracking pool statistics.
struct SharedPoolStats {
    tasks_completed: AtomicU64,
    tasks_panicked: AtomicU64,
    active_workers: AtomicU64,
}

impl SharedPoolStats {
    fn new() -> Self {
        Self {
            tasks_completed: AtomicU64::new(0),
            tasks_panicked: AtomicU64::new(0),
            active_workers: AtomicU64::new(0),
        }
    }

    fn record_completion(&self) {
        self.tasks_completed.fetch_add(1, Ordering::SeqCst);
    }

    fn record_panic(&self) {
        self.tasks_panicked.fetch_add(1, Ordering::SeqCst);
    }

    fn increment_active(&self) {
        self.active_workers.fetch_add(1, Ordering::SeqCst);
    }

    fn decrement_active(&self) {
        self.active_workers.fetch_sub(1, Ordering::SeqCst);
    }

    fn to_pool_stats(&self, num_workers: usize, backlog: usize) -> PoolStats {
        PoolStats {
            num_workers,
            active_workers: self.active_workers.load(Ordering::SeqCst) as usize,
            backlog,
            tasks_completed: self.tasks_completed.load(Ordering::SeqCst),
            tasks_panicked: self.tasks_panicked.load(Ordering::SeqCst),
        }
    }
}

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Fixed-size pool of worker threads consuming a task channel.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    sender: Mutex<Option<Sender<Task>>>,
    receiver: Receiver<Task>,
    worker_handles: Mutex<Vec<JoinHandle<()>>>,
    stats: Arc<SharedPoolStats>,
}

impl WorkerPool {
    /// Spawns all workers of the pool.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::InvalidSize` for a zero-sized pool and
    /// `PoolError::WorkerInitFailed` if a thread cannot be spawned.
    pub fn start(config: WorkerPoolConfig) -> Result<Self, PoolError> {
        if config.num_workers == 0 {
            return Err(PoolError::InvalidSize(config.name));
        }

        let (sender, receiver) = crossbeam_channel::unbounded::<Task>();
        let stats = Arc::new(SharedPoolStats::new());

        let mut worker_handles = Vec::with_capacity(config.num_workers);
        for i in 0..config.num_workers {
            let worker = Worker {
                id: format!("{}-{}-{}", config.thread_name_prefix, config.name, i),
                receiver: receiver.clone(),
                stats: Arc::clone(&stats),
            };

            let spawned = thread::Builder::new()
                .name(worker.id.clone())
                .spawn(move || worker.run());

            match spawned {
                Ok(handle) => worker_handles.push(handle),
                Err(e) => {
                    // Workers already spawned exit once the sender is dropped.
                    drop(sender);
                    return Err(PoolError::WorkerInitFailed(e.to_string()));
                }
            }
        }

        info!(pool = %config.name, num_workers = config.num_workers, "Worker pool started");

        Ok(Self {
            config,
            sender: Mutex::new(Some(sender)),
            receiver,
            worker_handles: Mutex::new(worker_handles),
            stats,
        })
    }

    /// Hands a task to the pool. Never blocks.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::NotRunning` after [`shutdown`](Self::shutdown).
    pub fn submit<F>(&self, task: F) -> Result<(), PoolError>
    where
        F: FnOnce() + Send + 'static,
    {
        let sender = self.sender.lock();
        let sender = sender.as_ref().ok_or(PoolError::NotRunning)?;
        sender.send(Box::new(task)).map_err(|_| PoolError::NotRunning)
    }

    /// Stops accepting tasks and waits for workers to drain the backlog.
    ///
    /// Safe to call from one of the pool's own workers; that worker is not joined.
    pub fn shutdown(&self) {
        if self.sender.lock().take().is_none() {
            return;
        }

        info!(pool = %self.config.name, "Initiating worker pool shutdown");

        let current = thread::current().id();
        let handles: Vec<_> = self.worker_handles.lock().drain(..).collect();
        for handle in handles {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                error!(pool = %self.config.name, "Worker thread panicked during shutdown");
            }
        }

        info!(pool = %self.config.name, "Worker pool shutdown complete");
    }

    /// Returns current pool statistics.
    pub fn stats(&self) -> PoolStats {
        self.stats
            .to_pool_stats(self.config.num_workers, self.receiver.len())
    }

    /// Returns whether the pool accepts new tasks.
    pub fn is_running(&self) -> bool {
        self.sender.lock().is_some()
    }

    /// Returns the number of workers in the pool.
    pub fn num_workers(&self) -> usize {
        self.config.num_workers
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Workers exit on their own once the channel disconnects; joining
        // here could deadlock when the last handle is dropped on a worker.
        self.sender.lock().take();
    }
}

/// A single worker thread.
struct Worker {
    id: String,
    receiver: Receiver<Task>,
    stats: Arc<SharedPoolStats>,
}

impl Worker {
    /// Runs tasks until the channel is closed and drained.
    fn run(self) {
        debug!(worker_id = %self.id, "Worker started");

        for task in self.receiver.iter() {
            self.stats.increment_active();
            let result = catch_unwind(AssertUnwindSafe(task));
            self.stats.decrement_active();

            match result {
                Ok(()) => self.stats.record_completion(),
                Err(_) => {
                    self.stats.record_panic();
                    error!(worker_id = %self.id, "Task panicked on worker");
                }
            }
        }

        debug!(worker_id = %self.id, "Worker stopped");
    }
}
