//! `WorkerPool` backed by dedicated OS threads.
//!
//! # Design Principles
//!
//! - **No polling**: workers block on `crossbeam_channel::Receiver::recv`
//! - **Clean shutdown**: dropping the sender unblocks every idle worker
//! - **Panic isolation**: a panicking task is counted, the worker keeps going

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::WorkerPoolConfig;

use super::{Job, PoolCounters, PoolError, PoolStats};

/// Fixed set of worker threads pulling from one FIFO queue.
///
/// # Design
///
/// - **Bounded concurrency**: at most `worker_count` tasks run at once
/// - **Unbounded intake**: `submit` never blocks; backpressure belongs to the caller
/// - **Cooperative shutdown**: running tasks finish, queued tasks are discarded
pub struct WorkerPool {
    /// Pool configuration.
    config: WorkerPoolConfig,

    /// Task sender (to workers). Option allows clean shutdown by dropping.
    task_tx: Mutex<Option<Sender<Job>>>,

    /// Pool statistics counters (lock-free atomics).
    counters: Arc<PoolCounters>,

    /// Shutdown flag (lock-free atomic).
    shutdown: Arc<AtomicBool>,

    /// Worker thread handles.
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Create a new worker pool, spawning `config.worker_count` threads.
    ///
    /// # Errors
    ///
    /// - `PoolError::InvalidConfig` if the configuration is invalid
    /// - `PoolError::Spawn` if the OS refuses to create a thread
    pub fn new(config: WorkerPoolConfig) -> Result<Self, PoolError> {
        config.validate().map_err(PoolError::InvalidConfig)?;

        let (task_tx, task_rx) = unbounded::<Job>();
        let counters = Arc::new(PoolCounters::default());
        let shutdown = Arc::new(AtomicBool::new(false));

        let mut workers = Vec::with_capacity(config.worker_count);
        for worker_id in 0..config.worker_count {
            let worker = spawn_worker(
                worker_id,
                task_rx.clone(),
                Arc::clone(&counters),
                Arc::clone(&shutdown),
                &config,
            )
            .map_err(|e| {
                // Already-spawned workers exit once `task_tx` is dropped.
                shutdown.store(true, Ordering::Release);
                PoolError::Spawn(e)
            })?;
            workers.push(worker);
        }

        info!(
            worker_count = config.worker_count,
            "WorkerPool initialized with dedicated OS threads"
        );

        Ok(Self {
            config,
            task_tx: Mutex::new(Some(task_tx)),
            counters,
            shutdown,
            workers: Mutex::new(workers),
        })
    }

    /// Enqueue `task` and return immediately.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::PoolShutdown` once shutdown has begun; the task is
    /// dropped without running.
    pub fn submit<F>(&self, task: F) -> Result<(), PoolError>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(PoolError::PoolShutdown);
        }

        let task_tx_guard = self.task_tx.lock();
        let Some(task_tx) = task_tx_guard.as_ref() else {
            return Err(PoolError::PoolShutdown);
        };

        // Count before sending so a fast worker never decrements first.
        self.counters.queued_tasks.fetch_add(1, Ordering::Relaxed);
        if task_tx.send(Box::new(task)).is_err() {
            self.counters.queued_tasks.fetch_sub(1, Ordering::Relaxed);
            return Err(PoolError::PoolShutdown);
        }
        self.counters.submitted_tasks.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Get current pool statistics.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        self.counters.snapshot(self.config.worker_count)
    }

    /// Number of worker threads.
    #[must_use]
    pub const fn worker_count(&self) -> usize {
        self.config.worker_count
    }

    /// Whether shutdown has begun.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Stop accepting tasks and wait for every worker to exit.
    ///
    /// Tasks already running finish normally; queued tasks are discarded.
    /// Calling this more than once is a no-op.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }

        info!("Shutting down worker pool");

        // Drop the sender to unblock all workers waiting on recv()
        self.task_tx.lock().take();

        let mut workers = self.workers.lock();
        let worker_count = workers.len();
        for (idx, worker) in workers.drain(..).enumerate() {
            if worker.join().is_ok() {
                debug!(worker_id = idx, "Worker joined successfully");
            } else {
                warn!(worker_id = idx, "Worker panicked");
            }
        }

        info!(
            worker_count = worker_count,
            discarded = self.counters.discarded_tasks.load(Ordering::Relaxed),
            "Worker pool shut down complete"
        );
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Signal shutdown but don't join; explicit shutdown() waits.
        if !self.shutdown.swap(true, Ordering::AcqRel) {
            self.task_tx.lock().take();
            debug!("WorkerPool dropped without explicit shutdown - workers will be detached");
        }
    }
}

/// Spawn a worker thread.
fn spawn_worker(
    worker_id: usize,
    task_rx: Receiver<Job>,
    counters: Arc<PoolCounters>,
    shutdown: Arc<AtomicBool>,
    config: &WorkerPoolConfig,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("{}-{worker_id}", config.thread_name_prefix))
        .stack_size(config.thread_stack_size)
        .spawn(move || {
            debug!(worker_id = worker_id, "Worker thread started");

            // When the sender is dropped and the queue drained, recv() errors.
            while let Ok(task) = task_rx.recv() {
                counters.queued_tasks.fetch_sub(1, Ordering::Relaxed);

                if shutdown.load(Ordering::Acquire) {
                    counters.discarded_tasks.fetch_add(1, Ordering::Relaxed);
                    drop(task);
                    continue;
                }

                counters.active_tasks.fetch_add(1, Ordering::Relaxed);
                let outcome = panic::catch_unwind(AssertUnwindSafe(task));
                counters.active_tasks.fetch_sub(1, Ordering::Relaxed);

                if outcome.is_ok() {
                    counters.completed_tasks.fetch_add(1, Ordering::Relaxed);
                } else {
                    counters.panicked_tasks.fetch_add(1, Ordering::Relaxed);
                    error!(worker_id = worker_id, "Task panicked");
                }
            }

            debug!(worker_id = worker_id, "Worker thread exiting");
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::time::Duration;

    fn pool(workers: usize) -> WorkerPool {
        WorkerPool::new(WorkerPoolConfig::new().with_worker_count(workers)).unwrap()
    }

    #[test]
    fn test_worker_pool_basic() {
        let pool = pool(2);
        let (tx, rx) = mpsc::channel();
        pool.submit(move || tx.send("hello").unwrap()).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "hello");
        pool.shutdown();

        let stats = pool.stats();
        assert_eq!(stats.submitted_tasks, 1);
        assert_eq!(stats.completed_tasks, 1);
    }

    #[test]
    fn test_submit_after_shutdown() {
        let pool = pool(1);
        pool.shutdown();
        assert!(matches!(pool.submit(|| {}), Err(PoolError::PoolShutdown)));
        assert!(pool.is_shutdown());
    }

    #[test]
    fn test_panicking_task_does_not_kill_worker() {
        let pool = pool(1);
        let count = Arc::new(AtomicUsize::new(0));
        pool.submit(|| panic!("boom")).unwrap();
        let c = Arc::clone(&count);
        let (tx, rx) = mpsc::channel();
        pool.submit(move || {
            c.fetch_add(1, Ordering::SeqCst);
            tx.send(()).unwrap();
        })
        .unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        pool.shutdown();

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(pool.stats().panicked_tasks, 1);
    }

    #[test]
    fn test_invalid_config() {
        let result = WorkerPool::new(WorkerPoolConfig::new().with_worker_count(0));
        assert!(matches!(result, Err(PoolError::InvalidConfig(_))));
    }
}
