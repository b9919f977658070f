//! Admission ceiling for in-flight connections.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Counts connections between accept and close and refuses new ones at the
/// ceiling. Cloning shares the counter.
#[derive(Debug, Clone)]
pub struct ConnectionLimiter {
    inner: Arc<LimiterInner>,
}

#[derive(Debug)]
struct LimiterInner {
    active: AtomicUsize,
    max_connections: usize,
}

impl ConnectionLimiter {
    /// Limiter allowing `max_connections` simultaneous connections.
    #[must_use]
    pub fn new(max_connections: usize) -> Self {
        Self {
            inner: Arc::new(LimiterInner {
                active: AtomicUsize::new(0),
                max_connections,
            }),
        }
    }

    /// Take a slot, or `None` when at the ceiling. The slot is returned when
    /// the guard drops, on every exit path including unwinding.
    #[must_use]
    pub fn try_acquire(&self) -> Option<ConnectionGuard> {
        let mut current = self.inner.active.load(Ordering::Acquire);
        loop {
            if current >= self.inner.max_connections {
                return None;
            }
            match self.inner.active.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Some(ConnectionGuard {
                        inner: Arc::clone(&self.inner),
                    })
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Connections currently holding a slot.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.inner.active.load(Ordering::Acquire)
    }

    /// The ceiling.
    #[must_use]
    pub fn max_connections(&self) -> usize {
        self.inner.max_connections
    }
}

/// One occupied connection slot.
#[derive(Debug)]
pub struct ConnectionGuard {
    inner: Arc<LimiterInner>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.inner.active.fetch_sub(1, Ordering::AcqRel);
    }
}
