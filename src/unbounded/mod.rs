//! An unbounded, lock-free MPMC queue built from a chain of fixed-size
//! blocks.
//!
//! Grounded on the block-chain algorithm described for `async::queue` (see
//! `examples/original_source/test/unittest/queue_test.cpp`), translated to
//! the cell layout the teacher already uses for its bounded queue
//! (`examples/crhino-canal/src/mpmc/mpmc_bounded_queue.rs`): every slot
//! carries its own atomic state tag instead of relying on a single lock.
//!
//! Producers never block: a full block just grows the chain. Consumers
//! only ever claim a slot a producer has already reserved (checked via a
//! compare-exchange against the block's producer count, not a blind
//! `fetch_add`), so a truly empty queue returns `None` rather than spinning
//! forever on a cell nobody promised to fill.
//!
//! Block reclamation uses `crossbeam-epoch`, the ecosystem's standard
//! solution to exactly this problem (safe reclamation for Michael-Scott
//! style chains), rather than a hand-rolled reference count: a block
//! retired by `dequeue`/`bulk_dequeue` is deferred the same way
//! `Guard::defer_destroy` defers a drop, except the deferred closure resets
//! the block and parks it on a freelist instead of dropping it, so
//! `grow_tail` can hand it back out instead of allocating. See `DESIGN.md`
//! for why epoch-based retirement replaces the spec's description of a
//! manual "ops in flight" counter.

mod block;

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use crossbeam_epoch::{self as epoch, Atomic, Owned, Shared};
use crossbeam_utils::Backoff;

use crate::config::{Fast, QueueConfig};
use block::{Block, Cell, EMPTY, INVALID, STORED, STORING};

/// An unbounded multi-producer multi-consumer queue.
///
/// `C` selects the per-block cell count and whether constructor panics are
/// contained (see [`crate::config::QueueConfig`]); most callers can use the
/// default [`Fast`] configuration.
pub struct UnboundedQueue<T, C: QueueConfig = Fast> {
    head: Atomic<Block<T, C>>,
    tail: Atomic<Block<T, C>>,
    /// Blocks retired by `advance_head` after draining, reset and parked
    /// here instead of freed, so `grow_tail` can hand them back out.
    freelist: Arc<Mutex<Vec<Box<Block<T, C>>>>>,
}

unsafe impl<T: Send, C: QueueConfig> Send for UnboundedQueue<T, C> {}
unsafe impl<T: Send, C: QueueConfig> Sync for UnboundedQueue<T, C> {}

impl<T: Send + 'static, C: QueueConfig> Default for UnboundedQueue<T, C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static, C: QueueConfig> UnboundedQueue<T, C> {
    /// Creates an empty queue, seeded with a single block.
    pub fn new() -> Self {
        let guard = unsafe { epoch::unprotected() };
        let initial = Owned::new(Block::<T, C>::new()).into_shared(guard);
        UnboundedQueue {
            head: Atomic::from(initial),
            tail: Atomic::from(initial),
            freelist: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Returns a block to extend the chain with, reusing one from the
    /// recycle freelist if one is parked there instead of allocating.
    fn new_block(&self) -> Owned<Block<T, C>> {
        match self.freelist.lock().unwrap().pop() {
            Some(boxed) => unsafe { Owned::from_raw(Box::into_raw(boxed)) },
            None => Owned::new(Block::<T, C>::new()),
        }
    }

    /// Pushes `value` onto the queue.
    pub fn enqueue(&self, value: T) {
        self.enqueue_with(move || value)
    }

    /// Pushes the value produced by `ctor` onto the queue.
    ///
    /// `ctor` runs in place of the claimed cell's construction step. Under
    /// [`crate::config::Checked`] a panic inside `ctor` is caught and the
    /// cell is marked `Invalid` (silently skipped by dequeuers) instead of
    /// unwinding through the queue.
    pub fn enqueue_with<F>(&self, ctor: F)
    where
        F: FnOnce() -> T,
    {
        let guard = &epoch::pin();
        loop {
            let tail = self.tail.load(Ordering::Acquire, guard);
            let block = unsafe { tail.deref() };
            let pos = block.producer.fetch_add(1, Ordering::AcqRel);
            if pos < C::BLOCK_SIZE {
                let cell = &block.cells[pos];
                cell.state.store(STORING, Ordering::Relaxed);
                if C::SAFE {
                    match catch_unwind(AssertUnwindSafe(ctor)) {
                        Ok(value) => {
                            unsafe { (*cell.value.get()).write(value) };
                            cell.state.store(STORED, Ordering::Release);
                        }
                        Err(_) => cell.state.store(INVALID, Ordering::Release),
                    }
                } else {
                    let value = ctor();
                    unsafe { (*cell.value.get()).write(value) };
                    cell.state.store(STORED, Ordering::Release);
                }
                return;
            }
            self.grow_tail(tail, block, guard);
        }
    }

    /// Pushes every item of `items` as a single contiguous batch.
    ///
    /// No other enqueue's cells can land inside the batch's claimed range,
    /// though the batch itself may straddle a block boundary and so is not
    /// guaranteed to occupy physically adjacent memory.
    pub fn bulk_enqueue<I>(&self, items: I)
    where
        I: IntoIterator<Item = T>,
    {
        let mut items = items.into_iter();
        let mut remaining = match items.size_hint() {
            (lower, Some(upper)) if lower == upper => lower,
            _ => {
                let buffered: Vec<T> = items.collect();
                return self.bulk_enqueue(buffered);
            }
        };
        if remaining == 0 {
            return;
        }
        let guard = &epoch::pin();
        loop {
            let tail = self.tail.load(Ordering::Acquire, guard);
            let block = unsafe { tail.deref() };
            let start = block.producer.fetch_add(remaining, Ordering::AcqRel);
            if start < C::BLOCK_SIZE {
                let take = (C::BLOCK_SIZE - start).min(remaining);
                for offset in 0..take {
                    let value = items
                        .next()
                        .expect("bulk_enqueue: fewer items than reserved slots");
                    let cell = &block.cells[start + offset];
                    cell.state.store(STORING, Ordering::Relaxed);
                    unsafe { (*cell.value.get()).write(value) };
                    cell.state.store(STORED, Ordering::Release);
                }
                remaining -= take;
                if remaining == 0 {
                    return;
                }
            }
            self.grow_tail(tail, block, guard);
        }
    }

    /// Pops the next value, or `None` if the queue is currently empty.
    pub fn dequeue(&self) -> Option<T> {
        let guard = &epoch::pin();
        loop {
            let head = self.head.load(Ordering::Acquire, guard);
            let block = unsafe { head.deref() };
            let c = block.consumer.load(Ordering::Acquire);
            if c >= C::BLOCK_SIZE {
                if !self.advance_head(head, block, guard) {
                    return None;
                }
                continue;
            }
            let produced = block.producer.load(Ordering::Acquire).min(C::BLOCK_SIZE);
            if c >= produced {
                return None;
            }
            if block
                .consumer
                .compare_exchange(c, c + 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_err()
            {
                continue;
            }
            return take_cell(&block.cells[c]);
        }
    }

    /// Pops up to `max` values, returning as soon as fewer are available.
    pub fn bulk_dequeue(&self, max: usize) -> Vec<T> {
        let mut out = Vec::with_capacity(max);
        if max == 0 {
            return out;
        }
        let guard = &epoch::pin();
        'outer: while out.len() < max {
            let head = self.head.load(Ordering::Acquire, guard);
            let block = unsafe { head.deref() };
            let c = block.consumer.load(Ordering::Acquire);
            if c >= C::BLOCK_SIZE {
                if !self.advance_head(head, block, guard) {
                    break;
                }
                continue 'outer;
            }
            let produced = block.producer.load(Ordering::Acquire).min(C::BLOCK_SIZE);
            if c >= produced {
                break;
            }
            let remaining = max - out.len();
            let take = (produced - c).min(remaining);
            if block
                .consumer
                .compare_exchange(c, c + take, Ordering::AcqRel, Ordering::Relaxed)
                .is_err()
            {
                continue 'outer;
            }
            for offset in 0..take {
                // `Invalid` cells (safe-mode construction panics) produce no
                // element for this call; the reserved slot is still consumed,
                // so the batch can come back shorter than `take`.
                if let Some(v) = take_cell(&block.cells[c + offset]) {
                    out.push(v);
                }
            }
            if c + take >= C::BLOCK_SIZE {
                let _ = self.advance_head(head, block, guard);
            }
        }
        out
    }

    /// Number of cells in blocks currently allocated, whether reachable
    /// from the head or parked on the recycle freelist (their storage is
    /// still live, just not currently part of the chain).
    ///
    /// An introspection aid, not a precise occupied-slot count: trailing
    /// blocks may be only partially produced or consumed.
    pub fn node_count(&self) -> usize {
        let guard = &epoch::pin();
        let mut count = 0;
        let mut cur = self.head.load(Ordering::Acquire, guard);
        while !cur.is_null() {
            count += C::BLOCK_SIZE;
            let block = unsafe { cur.deref() };
            cur = block.next.load(Ordering::Acquire, guard);
        }
        count += self.freelist.lock().unwrap().len() * C::BLOCK_SIZE;
        count
    }

    fn grow_tail<'g>(
        &self,
        tail: Shared<'g, Block<T, C>>,
        block: &Block<T, C>,
        guard: &'g epoch::Guard,
    ) {
        let next = block.next.load(Ordering::Acquire, guard);
        if !next.is_null() {
            let _ = self
                .tail
                .compare_exchange(tail, next, Ordering::AcqRel, Ordering::Relaxed, guard);
            return;
        }
        let new_block = self.new_block().into_shared(guard);
        match block.next.compare_exchange(
            Shared::null(),
            new_block,
            Ordering::AcqRel,
            Ordering::Acquire,
            guard,
        ) {
            Ok(_) => {
                let _ = self.tail.compare_exchange(
                    tail,
                    new_block,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                    guard,
                );
            }
            Err(e) => {
                // Lost the race to extend the chain; park our spare block on
                // the freelist instead of the successor the winner installed.
                let raw = new_block.as_raw() as *mut Block<T, C>;
                let mut boxed = unsafe { Box::from_raw(raw) };
                boxed.reset();
                self.freelist.lock().unwrap().push(boxed);
                let _ = self.tail.compare_exchange(
                    tail,
                    e.current,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                    guard,
                );
            }
        }
    }

    /// Advances `self.head` past an exhausted block. Returns `false` if
    /// there is no successor yet (queue drained at this point in time).
    fn advance_head<'g>(
        &self,
        head: Shared<'g, Block<T, C>>,
        block: &Block<T, C>,
        guard: &'g epoch::Guard,
    ) -> bool {
        let next = block.next.load(Ordering::Acquire, guard);
        if next.is_null() {
            return false;
        }
        if self
            .head
            .compare_exchange(head, next, Ordering::AcqRel, Ordering::Relaxed, guard)
            .is_ok()
        {
            self.retire(head, guard);
        }
        true
    }

    /// Schedules a drained, unreachable block for epoch-safe retirement onto
    /// the recycle freelist instead of freeing it.
    ///
    /// Built the same way `Guard::defer_destroy` is (capturing the pointer
    /// in a deferred closure that runs once no guard can still observe the
    /// old epoch), except the reconstructed block is reset and parked in
    /// `freelist` rather than dropped, so `new_block` can hand it back out.
    fn retire<'g>(&self, retired: Shared<'g, Block<T, C>>, guard: &'g epoch::Guard) {
        let freelist = self.freelist.clone();
        let raw = retired.as_raw() as *mut Block<T, C>;
        unsafe {
            guard.defer_unchecked(move || {
                let mut boxed = Box::from_raw(raw);
                boxed.reset();
                freelist.lock().unwrap().push(boxed);
            });
        }
    }
}

/// Reads and clears a cell already known to be `Stored` or `Invalid`,
/// spin-waiting through the brief `Storing` window in between.
fn take_cell<T>(cell: &Cell<T>) -> Option<T> {
    let backoff = Backoff::new();
    loop {
        match cell.state.load(Ordering::Acquire) {
            STORED => {
                let value = unsafe { (*cell.value.get()).assume_init_read() };
                cell.state.store(EMPTY, Ordering::Release);
                return Some(value);
            }
            INVALID => {
                cell.state.store(EMPTY, Ordering::Release);
                return None;
            }
            _ => backoff.snooze(),
        }
    }
}

impl<T, C: QueueConfig> Drop for UnboundedQueue<T, C> {
    fn drop(&mut self) {
        // Single-threaded at this point: walk the chain and free every
        // block without going through the epoch machinery.
        unsafe {
            let guard = epoch::unprotected();
            let mut cur = self.head.load(Ordering::Relaxed, guard);
            while !cur.is_null() {
                let next = cur.deref().next.load(Ordering::Relaxed, guard);
                drop(cur.into_owned());
                cur = next;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Checked;
    use std::sync::Arc;

    struct TinyBlocks;
    impl QueueConfig for TinyBlocks {
        const BLOCK_SIZE: usize = 4;
    }

    #[test]
    fn enqueue_dequeue_fifo() {
        let q: UnboundedQueue<i32> = UnboundedQueue::new();
        q.enqueue(1);
        q.enqueue(2);
        q.enqueue(3);
        assert_eq!(q.dequeue(), Some(1));
        assert_eq!(q.dequeue(), Some(2));
        assert_eq!(q.dequeue(), Some(3));
        assert_eq!(q.dequeue(), None);
    }

    #[test]
    fn dequeue_on_empty_queue_returns_none() {
        let q: UnboundedQueue<i32> = UnboundedQueue::new();
        assert_eq!(q.dequeue(), None);
        q.enqueue(42);
        assert_eq!(q.dequeue(), Some(42));
        assert_eq!(q.dequeue(), None);
    }

    #[test]
    fn grows_across_many_blocks() {
        let q: UnboundedQueue<i32, TinyBlocks> = UnboundedQueue::new();
        for i in 0..50 {
            q.enqueue(i);
        }
        assert!(q.node_count() >= 50);
        for i in 0..50 {
            assert_eq!(q.dequeue(), Some(i));
        }
        assert_eq!(q.dequeue(), None);
    }

    #[test]
    fn sustained_churn_across_many_retired_blocks() {
        // One item in flight at a time, with a 4-cell block, forces a
        // fresh block every 4 iterations: the head block is fully drained
        // and retired (onto the recycle freelist) well before the tail
        // stops growing, repeatedly exercising retire-then-reuse.
        let q: UnboundedQueue<i32, TinyBlocks> = UnboundedQueue::new();
        for i in 0..100 {
            q.enqueue(i);
            assert_eq!(q.dequeue(), Some(i));
        }
        assert_eq!(q.dequeue(), None);
    }

    #[test]
    fn bulk_enqueue_then_bulk_dequeue() {
        let q: UnboundedQueue<i32, TinyBlocks> = UnboundedQueue::new();
        q.bulk_enqueue(0..10);
        let batch = q.bulk_dequeue(6);
        assert_eq!(batch, (0..6).collect::<Vec<_>>());
        let rest = q.bulk_dequeue(10);
        assert_eq!(rest, (6..10).collect::<Vec<_>>());
        assert_eq!(q.bulk_dequeue(5), Vec::<i32>::new());
    }

    #[test]
    fn checked_mode_contains_constructor_panics() {
        let q: UnboundedQueue<i32, Checked> = UnboundedQueue::new();
        q.enqueue_with(|| 1);
        q.enqueue_with(|| panic!("boom"));
        q.enqueue_with(|| 3);
        assert_eq!(q.dequeue(), Some(1));
        assert_eq!(q.dequeue(), Some(3));
        assert_eq!(q.dequeue(), None);
    }

    #[test]
    fn concurrent_producers_and_consumers_preserve_total() {
        const ITERATIONS: i64 = 888;
        const PRODUCERS: i64 = 5;
        let expected_sum: i64 = (0..ITERATIONS).sum::<i64>() * PRODUCERS;
        let expected_count = (ITERATIONS * PRODUCERS) as usize;

        let q: Arc<UnboundedQueue<i64>> = Arc::new(UnboundedQueue::new());
        let sum = Arc::new(std::sync::atomic::AtomicI64::new(0));
        let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        crossbeam::scope(|scope| {
            for _ in 0..PRODUCERS {
                let q = q.clone();
                scope.spawn(move |_| {
                    for i in 0..ITERATIONS {
                        q.enqueue(i);
                    }
                });
            }
            for _ in 0..PRODUCERS {
                let q = q.clone();
                let sum = sum.clone();
                let count = count.clone();
                scope.spawn(move |_| {
                    let backoff = Backoff::new();
                    while count.load(Ordering::Acquire) < expected_count {
                        if let Some(v) = q.dequeue() {
                            sum.fetch_add(v, Ordering::Relaxed);
                            count.fetch_add(1, Ordering::Release);
                            backoff.reset();
                        } else {
                            backoff.snooze();
                        }
                    }
                });
            }
        })
        .unwrap();

        assert_eq!(count.load(Ordering::Acquire), expected_count);
        assert_eq!(sum.load(Ordering::Acquire), expected_sum);
        assert_eq!(q.dequeue(), None);
    }
}
