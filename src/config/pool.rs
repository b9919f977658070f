//! Worker pool configuration.

use serde::{Deserialize, Serialize};

/// Default worker thread stack size (2 MiB).
pub const DEFAULT_THREAD_STACK_SIZE: usize = 2 * 1024 * 1024;

/// Configuration for [`WorkerPool`](crate::core::WorkerPool).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    /// Number of worker threads; defaults to the host's hardware parallelism.
    pub worker_count: usize,
    /// Stack size for each worker thread in bytes.
    pub thread_stack_size: usize,
    /// Worker thread names are `<prefix>-<index>`.
    pub thread_name_prefix: String,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            worker_count: num_cpus::get(),
            thread_stack_size: DEFAULT_THREAD_STACK_SIZE,
            thread_name_prefix: "lw-worker".into(),
        }
    }
}

impl WorkerPoolConfig {
    /// Defaults sized to the host.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of worker threads.
    #[must_use]
    pub const fn with_worker_count(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }

    /// Set the worker stack size in bytes.
    #[must_use]
    pub const fn with_thread_stack_size(mut self, thread_stack_size: usize) -> Self {
        self.thread_stack_size = thread_stack_size;
        self
    }

    /// Set the worker thread name prefix.
    #[must_use]
    pub fn with_thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    /// Validate pool configuration values.
    ///
    /// # Errors
    ///
    /// Returns a description of the first invalid field.
    pub fn validate(&self) -> Result<(), String> {
        if self.worker_count == 0 {
            return Err("worker_count must be greater than 0".into());
        }
        if self.thread_stack_size < 64 * 1024 {
            return Err("thread_stack_size must be at least 64 KiB".into());
        }
        Ok(())
    }
}
