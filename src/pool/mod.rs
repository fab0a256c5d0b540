//! A thread pool that posts arbitrary closures onto [`crate::unbounded`]'s
//! lock-free queue and hands each caller a handle to the eventual result.
//!
//! Grounded on `examples/original_source/test/unittest/threadpool_test.cpp`:
//! `async::threadpool` accepts a callable plus its arguments and returns a
//! future-like object with a blocking `.get()`. The C++ template
//! `post(callable, args...)` becomes a single `FnOnce() -> R` closure here —
//! argument binding is the caller's job (a capturing closure), which is the
//! idiomatic Rust equivalent of variadic template forwarding.

mod task;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_utils::Backoff;

use crate::unbounded::UnboundedQueue;

pub use task::TaskHandle;
use task::{Job, TaskInner};

/// How long an idle worker sleeps before re-checking the queue, once its
/// brief spin has given up. A safety net, not the primary wakeup path:
/// `post`/`Drop` signal `not_empty` on every submission and at shutdown, so
/// this timeout is normally never reached — mirrors
/// [`crate::bounded::BoundedQueue`]'s `RECHECK_INTERVAL`.
const IDLE_RECHECK_INTERVAL: Duration = Duration::from_millis(1);

/// A fixed-size pool of worker threads fed by a single unbounded queue.
///
/// Dropping the pool joins every worker after letting them drain whatever
/// is already queued; see [`ThreadPool::drop`] for the exact shutdown
/// sequence.
pub struct ThreadPool {
    queue: Arc<UnboundedQueue<Option<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    idle: Arc<AtomicUsize>,
    not_empty: Arc<(Mutex<()>, Condvar)>,
}

impl ThreadPool {
    /// Spawns `n_workers` threads, each pulling jobs off the shared queue.
    ///
    /// `n_workers` is clamped to at least 1: a pool with zero workers could
    /// never make progress.
    pub fn new(n_workers: usize) -> Self {
        let n_workers = n_workers.max(1);
        let queue: Arc<UnboundedQueue<Option<Job>>> = Arc::new(UnboundedQueue::new());
        let idle = Arc::new(AtomicUsize::new(n_workers));
        let not_empty = Arc::new((Mutex::new(()), Condvar::new()));

        let mut workers = Vec::with_capacity(n_workers);
        for id in 0..n_workers {
            let queue = queue.clone();
            let idle = idle.clone();
            let not_empty = not_empty.clone();
            workers.push(
                thread::Builder::new()
                    .name(format!("canal-pool-{}", id))
                    .spawn(move || worker_loop(queue, idle, not_empty))
                    .expect("failed to spawn thread pool worker"),
            );
        }

        ThreadPool {
            queue,
            workers: Mutex::new(workers),
            idle,
            not_empty,
        }
    }

    /// Posts `f` for execution by the next free worker, returning a handle
    /// that any number of observers may later use to retrieve the result.
    ///
    /// `f` runs under `catch_unwind`: a panic is captured on the handle
    /// rather than taking down the worker thread.
    pub fn post<F, R>(&self, f: F) -> TaskHandle<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let inner = Arc::new(TaskInner::new());
        let job_inner = inner.clone();
        let job: Job = Box::new(move || job_inner.run(f));
        self.queue.enqueue(Some(job));
        self.not_empty.1.notify_one();
        TaskHandle::new(inner)
    }

    /// Number of workers currently waiting for a job (a snapshot, not a
    /// guarantee about the next `post` call's wait time).
    pub fn idle_size(&self) -> usize {
        self.idle.load(Ordering::Acquire)
    }

    /// Number of worker threads in the pool.
    pub fn size(&self) -> usize {
        self.workers.lock().unwrap().len()
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        // A `None` entry is a per-worker stop sentinel: posting exactly one
        // per worker guarantees each worker sees its own sentinel after
        // draining whatever real jobs were already ahead of it in the
        // queue, then exits. Jobs posted concurrently with drop from
        // another thread may land before or after the sentinels; that race
        // is inherent to posting into a pool that is simultaneously being
        // torn down.
        let n = self.workers.lock().unwrap().len();
        for _ in 0..n {
            self.queue.enqueue(None);
        }
        self.not_empty.1.notify_all();
        for worker in self.workers.lock().unwrap().drain(..) {
            let _ = worker.join();
        }
    }
}

fn worker_loop(
    queue: Arc<UnboundedQueue<Option<Job>>>,
    idle: Arc<AtomicUsize>,
    not_empty: Arc<(Mutex<()>, Condvar)>,
) {
    loop {
        match queue.dequeue() {
            Some(Some(job)) => {
                idle.fetch_sub(1, Ordering::AcqRel);
                job();
                idle.fetch_add(1, Ordering::AcqRel);
            }
            Some(None) => return,
            None => park_until_signaled(&not_empty),
        }
    }
}

/// Spins briefly, then suspends on `not_empty` with a bounded timeout so a
/// signal racing a not-yet-started wait cannot stall the worker forever.
fn park_until_signaled(not_empty: &(Mutex<()>, Condvar)) {
    let backoff = Backoff::new();
    while !backoff.is_completed() {
        backoff.snooze();
    }
    let (lock, condvar) = not_empty;
    let guard = lock.lock().unwrap();
    let _ = condvar.wait_timeout(guard, IDLE_RECHECK_INTERVAL).unwrap();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI64;
    use std::time::Duration;

    #[test]
    fn post_free_function_like_closure() {
        let pool = ThreadPool::new(4);
        let handle = pool.post(|| 2 + 2);
        assert_eq!(handle.get_once(), 4);
    }

    #[test]
    fn post_closure_over_captured_state() {
        let pool = ThreadPool::new(4);
        let a = 3;
        let b = 4;
        let handle = pool.post(move || a * b);
        assert_eq!(handle.get_once(), 12);
    }

    #[test]
    fn multiple_observers_share_one_result() {
        let pool = ThreadPool::new(2);
        let handle = pool.post(|| String::from("done"));
        let h2 = handle.clone();
        assert_eq!(handle.get(), "done");
        assert_eq!(h2.get(), "done");
        assert_eq!(h2.get_once(), "done");
    }

    #[test]
    fn panicking_task_propagates_to_get() {
        let pool = ThreadPool::new(2);
        let handle = pool.post(|| -> i32 { panic!("task blew up") });
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handle.get()));
        assert!(result.is_err());
    }

    #[test]
    fn try_get_reflects_completion_without_blocking() {
        let pool = ThreadPool::new(1);
        let handle = pool.post(|| {
            thread::sleep(Duration::from_millis(30));
            7
        });
        assert!(handle.try_get().is_none());
        assert_eq!(handle.get(), 7);
        assert!(matches!(handle.try_get(), Some(Ok(7))));
    }

    #[test]
    fn nested_post_from_outside_a_worker() {
        // Mirrors threadpool_test.cpp's nested-post scenario: the blocking
        // `.get()` on a task that itself posts more work happens from the
        // caller's own thread, not from inside a worker, so a pool with a
        // single worker cannot deadlock on itself here.
        struct Summer {
            pool: ThreadPool,
        }
        impl Summer {
            fn sum(&self, a: i64, b: i64) -> i64 {
                a + b
            }
            fn post_sum(&self, a: i64, b: i64) -> i64 {
                let handle = self.pool.post(move || a + b);
                handle.get_once()
            }
        }

        let summer = Summer {
            pool: ThreadPool::new(1),
        };
        assert_eq!(summer.sum(2, 3), 5);
        assert_eq!(summer.post_sum(2, 3), 5);
    }

    #[test]
    fn idle_size_reports_free_workers_at_rest() {
        let pool = ThreadPool::new(3);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(pool.idle_size(), 3);
    }

    #[test]
    fn many_jobs_all_complete() {
        let pool = ThreadPool::new(8);
        let handles: Vec<_> = (0..500i64).map(|i| pool.post(move || i * 2)).collect();
        let total = AtomicI64::new(0);
        for h in handles {
            total.fetch_add(h.get_once(), Ordering::Relaxed);
        }
        let expected: i64 = (0..500i64).map(|i| i * 2).sum();
        assert_eq!(total.load(Ordering::Relaxed), expected);
    }
}
