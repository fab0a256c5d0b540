//! A bounded, lock-free MPMC queue implemented as a ring buffer.
//!
//! Adapted directly from the teacher's `mpmc_bounded_queue.rs`, itself a
//! port of Dmitry Vyukov's bounded MPMC queue algorithm
//! (http://www.1024cores.net/home/lock-free-algorithms/queues/bounded-mpmc-queue).
//! Each slot carries its own sequence number rather than a shared head/tail
//! pair, so producers and consumers only ever contend on their own atomic
//! counter, not each other's.
//!
//! Three changes from the teacher's version:
//! - `compare_and_swap` (deprecated, removed from std) becomes
//!   `compare_exchange_weak`.
//! - The four hand-written `[u8; 64]` padding fields become
//!   [`crossbeam_utils::CachePadded`] around the two hot counters.
//! - `enqueue`/`enqueue_with` return `Result<bool, T>` / `Result<bool, F>`
//!   instead of a bare `bool`: `Err` hands the value/constructor back when
//!   the queue was observed full (so blocking variants can retry it without
//!   an `Option` wrapper), while `Ok(false)` reports the original's other
//!   failure case — a safe-mode constructor that panicked claimed the slot
//!   but produced nothing (see `examples/original_source/test/unittest/
//!   bounded_queue_test.cpp`'s `CHECK(q.enqueue(2) == false)` for the
//!   throwing-constructor case). Blocking variants built on top suspend on
//!   a condvar instead of spinning forever.

use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crossbeam_utils::{Backoff, CachePadded};

use crate::config::{Fast, QueueConfig};

/// How long a suspended blocking call sleeps before re-checking its
/// condition. A safety net, not the primary wakeup path: `notify_one` fires
/// on every successful enqueue/dequeue, so this timeout is normally never
/// reached.
const RECHECK_INTERVAL: Duration = Duration::from_millis(1);

struct Cell<T> {
    sequence: AtomicUsize,
    value: UnsafeCell<Option<T>>,
}

unsafe impl<T: Send> Send for Cell<T> {}
unsafe impl<T: Send> Sync for Cell<T> {}

enum Taken<T> {
    Value(T),
    /// A safe-mode constructor panicked for this slot. The ticket still
    /// advances; `dequeue` reports this one call as empty.
    Hole,
    Empty,
}

/// A bounded multi-producer multi-consumer queue backed by a fixed-size
/// ring buffer.
///
/// `C` controls only whether `enqueue_with`'s constructor runs under
/// `catch_unwind` (see [`crate::config::QueueConfig`]); the bounded queue
/// has no block size to configure.
pub struct BoundedQueue<T, C: QueueConfig = Fast> {
    buffer: Box<[Cell<T>]>,
    mask: usize,
    enqueue_pos: CachePadded<AtomicUsize>,
    dequeue_pos: CachePadded<AtomicUsize>,
    not_full: Condvar,
    not_empty: Condvar,
    wait_lock: Mutex<()>,
    _config: PhantomData<C>,
}

unsafe impl<T: Send, C: QueueConfig> Send for BoundedQueue<T, C> {}
unsafe impl<T: Send, C: QueueConfig> Sync for BoundedQueue<T, C> {}

impl<T, C: QueueConfig> BoundedQueue<T, C> {
    /// Creates a queue able to hold at least `capacity` elements, rounded
    /// up to the next power of two (minimum 2), matching the layout the
    /// ring buffer's masking arithmetic requires.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = if capacity < 2 {
            2
        } else {
            capacity.next_power_of_two()
        };
        let buffer = (0..capacity)
            .map(|i| Cell {
                sequence: AtomicUsize::new(i),
                value: UnsafeCell::new(None),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        BoundedQueue {
            buffer,
            mask: capacity - 1,
            enqueue_pos: CachePadded::new(AtomicUsize::new(0)),
            dequeue_pos: CachePadded::new(AtomicUsize::new(0)),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
            wait_lock: Mutex::new(()),
            _config: PhantomData,
        }
    }

    /// Total number of slots in the ring buffer.
    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    /// Approximate occupancy. Racy under concurrent use: useful for
    /// diagnostics, not for synchronization.
    pub fn len(&self) -> usize {
        let enq = self.enqueue_pos.load(Ordering::Relaxed);
        let deq = self.dequeue_pos.load(Ordering::Relaxed);
        enq.saturating_sub(deq)
    }

    /// `true` if no elements are currently enqueued (subject to the same
    /// raciness as [`Self::len`]).
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pushes `value`. `Ok(true)` on success; `Ok(false)` if a
    /// [`crate::config::Checked`] constructor panicked (impossible here
    /// since `value` already exists, kept for symmetry with
    /// [`Self::enqueue_with`]); `Err(value)` handed back if the queue was
    /// observed full.
    pub fn enqueue(&self, value: T) -> Result<bool, T> {
        match self.enqueue_with(move || value) {
            Ok(success) => Ok(success),
            Err(ctor) => Err(ctor()),
        }
    }

    /// Claims a slot and runs `ctor` to fill it, returning `ctor` back
    /// unexecuted if the queue was full. Under [`crate::config::Checked`],
    /// a panic inside `ctor` leaves the slot empty instead of unwinding
    /// through the queue, and this call reports `Ok(false)` — the slot was
    /// claimed, but nothing was stored into it. The claimed slot still
    /// advances the ring the same as a successful store; [`Self::dequeue`]
    /// reports the hole as an empty read for the one call that reaches it.
    pub fn enqueue_with<F>(&self, ctor: F) -> Result<bool, F>
    where
        F: FnOnce() -> T,
    {
        let mask = self.mask;
        let mut pos = self.enqueue_pos.load(Ordering::Relaxed);
        loop {
            let cell = &self.buffer[pos & mask];
            let seq = cell.sequence.load(Ordering::Acquire);
            let diff = seq as isize - pos as isize;
            if diff == 0 {
                match self.enqueue_pos.compare_exchange_weak(
                    pos,
                    pos + 1,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => return Ok(self.publish(cell, pos, ctor)),
                    Err(actual) => pos = actual,
                }
            } else if diff < 0 {
                return Err(ctor);
            } else {
                pos = self.enqueue_pos.load(Ordering::Relaxed);
            }
        }
    }

    /// Stores `ctor`'s output into `cell` and publishes it. Returns whether
    /// construction actually succeeded (always `true` outside
    /// [`crate::config::Checked`]).
    fn publish<F>(&self, cell: &Cell<T>, pos: usize, ctor: F) -> bool
    where
        F: FnOnce() -> T,
    {
        let success = if C::SAFE {
            match catch_unwind(AssertUnwindSafe(ctor)) {
                Ok(value) => {
                    unsafe { *cell.value.get() = Some(value) };
                    true
                }
                Err(_) => {
                    unsafe { *cell.value.get() = None };
                    false
                }
            }
        } else {
            unsafe { *cell.value.get() = Some(ctor()) };
            true
        };
        cell.sequence.store(pos + 1, Ordering::Release);
        self.not_empty.notify_one();
        success
    }

    /// Pops the next value, or `None` if the queue is currently empty.
    ///
    /// A safe-mode construction failure surfaces here as a single `None`:
    /// the ticket this call claims has already advanced past the hole, so
    /// the *next* `dequeue` call sees the following slot, but this call
    /// itself reports empty rather than transparently retrying.
    pub fn dequeue(&self) -> Option<T> {
        match self.take_one() {
            Taken::Value(v) => Some(v),
            Taken::Hole => None,
            Taken::Empty => None,
        }
    }

    fn take_one(&self) -> Taken<T> {
        let mask = self.mask;
        let mut pos = self.dequeue_pos.load(Ordering::Relaxed);
        loop {
            let cell = &self.buffer[pos & mask];
            let seq = cell.sequence.load(Ordering::Acquire);
            let diff = seq as isize - (pos + 1) as isize;
            if diff == 0 {
                match self.dequeue_pos.compare_exchange_weak(
                    pos,
                    pos + 1,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        let value = unsafe { (*cell.value.get()).take() };
                        cell.sequence.store(pos + mask + 1, Ordering::Release);
                        self.not_full.notify_one();
                        return match value {
                            Some(v) => Taken::Value(v),
                            None => Taken::Hole,
                        };
                    }
                    Err(actual) => pos = actual,
                }
            } else if diff < 0 {
                return Taken::Empty;
            } else {
                pos = self.dequeue_pos.load(Ordering::Relaxed);
            }
        }
    }

    /// Pushes `value`, spinning briefly and then suspending until a slot
    /// frees up.
    pub fn blocking_enqueue(&self, value: T) {
        let mut value = value;
        loop {
            match self.enqueue(value) {
                Ok(_) => return,
                Err(v) => value = v,
            }
            self.wait_for(&self.not_full);
        }
    }

    /// `enqueue_with`'s blocking counterpart.
    pub fn blocking_enqueue_with<F>(&self, ctor: F)
    where
        F: FnOnce() -> T,
    {
        let mut ctor = ctor;
        loop {
            match self.enqueue_with(ctor) {
                Ok(_) => return,
                Err(c) => ctor = c,
            }
            self.wait_for(&self.not_full);
        }
    }

    /// Pops the next value, spinning briefly and then suspending until one
    /// is available.
    pub fn blocking_dequeue(&self) -> T {
        loop {
            if let Some(v) = self.dequeue() {
                return v;
            }
            self.wait_for(&self.not_empty);
        }
    }

    fn wait_for(&self, condvar: &Condvar) {
        let backoff = Backoff::new();
        while !backoff.is_completed() {
            backoff.snooze();
        }
        let guard = self.wait_lock.lock().unwrap();
        let _ = condvar.wait_timeout(guard, RECHECK_INTERVAL).unwrap();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Checked;
    use std::sync::atomic::AtomicUsize as StdAtomicUsize;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn enqueue_dequeue_fifo() {
        let q: BoundedQueue<i32> = BoundedQueue::with_capacity(4);
        assert_eq!(q.dequeue(), None);
        assert!(q.enqueue(1).is_ok());
        assert!(q.enqueue(2).is_ok());
        assert_eq!(q.dequeue(), Some(1));
        assert_eq!(q.dequeue(), Some(2));
        assert_eq!(q.dequeue(), None);
    }

    #[test]
    fn enqueue_returns_value_when_full() {
        let q: BoundedQueue<i32> = BoundedQueue::with_capacity(2);
        assert!(q.enqueue(1).is_ok());
        assert!(q.enqueue(2).is_ok());
        assert_eq!(q.enqueue(3), Err(3));
        assert_eq!(q.dequeue(), Some(1));
        assert!(q.enqueue(3).is_ok());
    }

    #[test]
    fn capacity_rounds_up_to_power_of_two() {
        let q: BoundedQueue<i32> = BoundedQueue::with_capacity(5);
        assert_eq!(q.capacity(), 8);
    }

    #[test]
    fn checked_mode_reports_construction_panics_as_a_hole() {
        // Mirrors bounded_queue_test.cpp's throwing-constructor case:
        // `enqueue(2) == false`, then three dequeues report true, false,
        // true for the real value, the hole, and the next real value.
        let q: BoundedQueue<i32, Checked> = BoundedQueue::with_capacity(4);
        assert!(matches!(q.enqueue_with(|| 1), Ok(true)));
        assert!(matches!(q.enqueue_with(|| panic!("boom")), Ok(false)));
        assert!(matches!(q.enqueue_with(|| 3), Ok(true)));
        assert_eq!(q.dequeue(), Some(1));
        assert_eq!(q.dequeue(), None);
        assert_eq!(q.dequeue(), Some(3));
        assert_eq!(q.dequeue(), None);
    }

    #[test]
    fn blocking_dequeue_waits_for_a_producer() {
        let q = Arc::new(BoundedQueue::<i32>::with_capacity(4));
        let reader = {
            let q = q.clone();
            thread::spawn(move || q.blocking_dequeue())
        };
        thread::sleep(Duration::from_millis(20));
        q.enqueue(99).unwrap();
        assert_eq!(reader.join().unwrap(), 99);
    }

    #[test]
    fn blocking_enqueue_waits_for_a_consumer() {
        let q = Arc::new(BoundedQueue::<i32>::with_capacity(2));
        q.enqueue(1).unwrap();
        q.enqueue(2).unwrap();
        let writer = {
            let q = q.clone();
            thread::spawn(move || q.blocking_enqueue(3))
        };
        thread::sleep(Duration::from_millis(20));
        assert_eq!(q.dequeue(), Some(1));
        writer.join().unwrap();
        assert_eq!(q.dequeue(), Some(2));
        assert_eq!(q.dequeue(), Some(3));
    }

    #[test]
    fn concurrent_producers_and_consumers_see_every_message() {
        let nthreads = 8usize;
        let nmsgs = 1000usize;
        let q = Arc::new(BoundedQueue::<usize>::with_capacity(nthreads * nmsgs));
        assert_eq!(q.dequeue(), None);

        crossbeam::scope(|scope| {
            for _ in 0..nthreads {
                let q = q.clone();
                scope.spawn(move |_| {
                    for i in 0..nmsgs {
                        q.blocking_enqueue(i);
                    }
                });
            }
            let total = Arc::new(StdAtomicUsize::new(0));
            for _ in 0..nthreads {
                let q = q.clone();
                let total = total.clone();
                scope.spawn(move |_| {
                    for _ in 0..nmsgs {
                        q.blocking_dequeue();
                        total.fetch_add(1, Ordering::Relaxed);
                    }
                });
            }
        })
        .unwrap();

        assert_eq!(q.dequeue(), None);
    }
}
