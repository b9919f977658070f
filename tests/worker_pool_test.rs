//! Integration tests for WorkerPool
//!
//! These tests validate:
//! - Bounded concurrency (never more than `worker_count` tasks at once)
//! - FIFO execution on a single worker
//! - Concurrent submission from many threads
//! - Graceful shutdown: running tasks finish, queued tasks are discarded

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use lotwarden::config::WorkerPoolConfig;
use lotwarden::core::{PoolError, WorkerPool};

// ============================================================================
// HELPER FUNCTIONS
// ============================================================================

fn pool(workers: usize) -> WorkerPool {
    WorkerPool::new(
        WorkerPoolConfig::new()
            .with_worker_count(workers)
            .with_thread_name_prefix("test-worker"),
    )
    .unwrap()
}

fn wait_until(timeout: Duration, cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

// ============================================================================
// TESTS
// ============================================================================

#[test]
fn test_concurrency_is_bounded_by_worker_count() {
    let pool = pool(3);
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let done = Arc::new(AtomicUsize::new(0));

    for _ in 0..30 {
        let running = Arc::clone(&running);
        let peak = Arc::clone(&peak);
        let done = Arc::clone(&done);
        pool.submit(move || {
            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(10));
            running.fetch_sub(1, Ordering::SeqCst);
            done.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    }

    assert!(wait_until(Duration::from_secs(10), || done.load(Ordering::SeqCst) == 30));
    assert!(peak.load(Ordering::SeqCst) <= 3);
    pool.shutdown();
    assert_eq!(pool.stats().completed_tasks, 30);
}

#[test]
fn test_single_worker_runs_tasks_in_fifo_order() {
    let pool = pool(1);
    let order = Arc::new(Mutex::new(Vec::new()));
    let (tx, rx) = mpsc::channel();

    for i in 0..20 {
        let order = Arc::clone(&order);
        let tx = tx.clone();
        pool.submit(move || {
            order.lock().push(i);
            if i == 19 {
                tx.send(()).unwrap();
            }
        })
        .unwrap();
    }

    rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(*order.lock(), (0..20).collect::<Vec<_>>());
    pool.shutdown();
}

#[test]
fn test_concurrent_submitters() {
    let pool = Arc::new(pool(4));
    let done = Arc::new(AtomicUsize::new(0));

    let submitters: Vec<_> = (0..8)
        .map(|_| {
            let pool = Arc::clone(&pool);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                for _ in 0..50 {
                    let done = Arc::clone(&done);
                    pool.submit(move || {
                        done.fetch_add(1, Ordering::SeqCst);
                    })
                    .unwrap();
                }
            })
        })
        .collect();
    for s in submitters {
        s.join().unwrap();
    }

    assert!(wait_until(Duration::from_secs(10), || done.load(Ordering::SeqCst) == 400));
    assert_eq!(pool.stats().submitted_tasks, 400);
    pool.shutdown();
}

#[test]
fn test_shutdown_finishes_running_and_discards_queued() {
    let pool = pool(1);
    let (started_tx, started_rx) = mpsc::channel();
    let finished = Arc::new(AtomicUsize::new(0));
    let ran_queued = Arc::new(AtomicUsize::new(0));

    {
        let finished = Arc::clone(&finished);
        pool.submit(move || {
            started_tx.send(()).unwrap();
            thread::sleep(Duration::from_millis(200));
            finished.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    }
    for _ in 0..5 {
        let ran_queued = Arc::clone(&ran_queued);
        pool.submit(move || {
            ran_queued.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    }

    started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    pool.shutdown();

    assert_eq!(finished.load(Ordering::SeqCst), 1);
    assert_eq!(ran_queued.load(Ordering::SeqCst), 0);
    let stats = pool.stats();
    assert_eq!(stats.completed_tasks, 1);
    assert_eq!(stats.discarded_tasks, 5);
    assert_eq!(stats.queued_tasks, 0);
    assert_eq!(stats.active_tasks, 0);
}

#[test]
fn test_submit_after_shutdown_is_rejected() {
    let pool = pool(2);
    pool.shutdown();
    pool.shutdown();
    assert!(matches!(pool.submit(|| {}), Err(PoolError::PoolShutdown)));
    assert_eq!(pool.stats().submitted_tasks, 0);
}

#[test]
fn test_worker_threads_are_named() {
    let pool = pool(1);
    let (tx, rx) = mpsc::channel();
    pool.submit(move || {
        tx.send(thread::current().name().map(str::to_owned)).unwrap();
    })
    .unwrap();
    let name = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(name.as_deref(), Some("test-worker-0"));
    pool.shutdown();
}
