//! Fixed-size worker pool executing connection tasks on dedicated OS threads.
//!
//! Tasks are zero-argument closures pushed onto a shared FIFO queue. Each
//! worker blocks on the queue, runs one task to completion, and loops.
//! Shutdown stops intake, lets running tasks finish, and discards anything
//! still queued.
//!
//! # Example
//!
//! ```rust
//! use lotwarden::config::WorkerPoolConfig;
//! use lotwarden::core::WorkerPool;
//!
//! let pool = WorkerPool::new(WorkerPoolConfig::new().with_worker_count(2)).unwrap();
//! let (tx, rx) = std::sync::mpsc::channel();
//! pool.submit(move || tx.send(21 * 2).unwrap()).unwrap();
//! assert_eq!(rx.recv().unwrap(), 42);
//! pool.shutdown();
//! ```

mod native;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Errors that can occur when using a `WorkerPool`.
#[derive(Debug)]
pub enum PoolError {
    /// The pool has been shut down; the task was dropped.
    PoolShutdown,

    /// Configuration validation failed.
    InvalidConfig(String),

    /// A worker thread could not be spawned.
    Spawn(std::io::Error),
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PoolShutdown => write!(f, "pool has been shut down"),
            Self::InvalidConfig(msg) => write!(f, "invalid configuration: {msg}"),
            Self::Spawn(err) => write!(f, "failed to spawn worker thread: {err}"),
        }
    }
}

impl std::error::Error for PoolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Spawn(err) => Some(err),
            _ => None,
        }
    }
}

/// Statistics about pool utilization.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Number of worker threads.
    pub worker_count: usize,

    /// Currently executing tasks.
    pub active_tasks: u64,

    /// Tasks waiting in the queue.
    pub queued_tasks: u64,

    /// Total tasks that ran to completion.
    pub completed_tasks: u64,

    /// Total tasks that panicked.
    pub panicked_tasks: u64,

    /// Tasks dropped unexecuted because of shutdown.
    pub discarded_tasks: u64,

    /// Total tasks accepted by `submit`.
    pub submitted_tasks: u64,
}

/// Internal counters for pool statistics (thread-safe).
#[derive(Debug, Default)]
pub(crate) struct PoolCounters {
    pub active_tasks: AtomicU64,
    pub queued_tasks: AtomicU64,
    pub completed_tasks: AtomicU64,
    pub panicked_tasks: AtomicU64,
    pub discarded_tasks: AtomicU64,
    pub submitted_tasks: AtomicU64,
}

impl PoolCounters {
    /// Get a snapshot of current statistics.
    pub fn snapshot(&self, worker_count: usize) -> PoolStats {
        PoolStats {
            worker_count,
            active_tasks: self.active_tasks.load(Ordering::Relaxed),
            queued_tasks: self.queued_tasks.load(Ordering::Relaxed),
            completed_tasks: self.completed_tasks.load(Ordering::Relaxed),
            panicked_tasks: self.panicked_tasks.load(Ordering::Relaxed),
            discarded_tasks: self.discarded_tasks.load(Ordering::Relaxed),
            submitted_tasks: self.submitted_tasks.load(Ordering::Relaxed),
        }
    }
}

/// A unit of work for the pool.
pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

pub use native::WorkerPool;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_error_display() {
        let err = PoolError::PoolShutdown;
        assert_eq!(format!("{}", err), "pool has been shut down");

        let err = PoolError::InvalidConfig("worker_count must be greater than 0".into());
        assert_eq!(
            format!("{}", err),
            "invalid configuration: worker_count must be greater than 0"
        );
    }

    #[test]
    fn test_pool_stats_default() {
        let stats = PoolStats::default();
        assert_eq!(stats.worker_count, 0);
        assert_eq!(stats.active_tasks, 0);
        assert_eq!(stats.completed_tasks, 0);
    }

    #[test]
    fn test_pool_counters_snapshot() {
        let counters = PoolCounters::default();
        counters.submitted_tasks.fetch_add(10, Ordering::Relaxed);
        counters.completed_tasks.fetch_add(5, Ordering::Relaxed);
        counters.discarded_tasks.fetch_add(2, Ordering::Relaxed);

        let stats = counters.snapshot(4);
        assert_eq!(stats.worker_count, 4);
        assert_eq!(stats.submitted_tasks, 10);
        assert_eq!(stats.completed_tasks, 5);
        assert_eq!(stats.discarded_tasks, 2);
    }
}
