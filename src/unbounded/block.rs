//! A single fixed-size block in the unbounded queue's block chain.
//!
//! Mirrors the cell layout of [`crate::bounded`]'s ring buffer (a state tag
//! alongside each slot) but the tag tracks *construction*, not a sequence
//! number: a block's cells are claimed left to right and never revisited,
//! so there is no wraparound to reason about.

use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use crossbeam_epoch::{Atomic, Shared};

use crate::config::QueueConfig;

pub(crate) const EMPTY: u8 = 0;
pub(crate) const STORING: u8 = 1;
pub(crate) const STORED: u8 = 2;
pub(crate) const INVALID: u8 = 3;

pub(crate) struct Cell<T> {
    pub(crate) state: AtomicU8,
    pub(crate) value: UnsafeCell<MaybeUninit<T>>,
}

impl<T> Cell<T> {
    fn empty() -> Self {
        Cell {
            state: AtomicU8::new(EMPTY),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }
}

unsafe impl<T: Send> Send for Cell<T> {}
unsafe impl<T: Send> Sync for Cell<T> {}

/// One node of the unbounded queue's block chain.
///
/// `producer`/`consumer` are the per-block equivalent of the bounded ring's
/// head/tail indices, except they only ever move forward: once a block is
/// exhausted (`index >= C::BLOCK_SIZE`) the relevant side moves on to
/// `next` rather than wrapping.
pub(crate) struct Block<T, C: QueueConfig> {
    pub(crate) cells: Box<[Cell<T>]>,
    pub(crate) producer: AtomicUsize,
    pub(crate) consumer: AtomicUsize,
    pub(crate) next: Atomic<Block<T, C>>,
    _config: PhantomData<C>,
}

impl<T, C: QueueConfig> Block<T, C> {
    pub(crate) fn new() -> Self {
        debug_assert!(
            C::BLOCK_SIZE.is_power_of_two(),
            "QueueConfig::BLOCK_SIZE must be a power of two"
        );
        let mut cells = Vec::with_capacity(C::BLOCK_SIZE);
        for _ in 0..C::BLOCK_SIZE {
            cells.push(Cell::empty());
        }
        Block {
            cells: cells.into_boxed_slice(),
            producer: AtomicUsize::new(0),
            consumer: AtomicUsize::new(0),
            next: Atomic::null(),
            _config: PhantomData,
        }
    }

    /// Restores a fully-drained block to its just-allocated state so it can
    /// be handed back out by the recycle freelist instead of freed.
    ///
    /// Every cell is already `Empty` by the time a block is retired (both
    /// `Stored` and `Invalid` cells are reset to `Empty` as they are taken).
    pub(crate) fn reset(&mut self) {
        self.producer.store(0, Ordering::Relaxed);
        self.consumer.store(0, Ordering::Relaxed);
        self.next.store(Shared::null(), Ordering::Relaxed);
        for cell in self.cells.iter_mut() {
            cell.state.store(EMPTY, Ordering::Relaxed);
        }
    }
}

impl<T, C: QueueConfig> Drop for Block<T, C> {
    fn drop(&mut self) {
        // Only cells a producer finished publishing still hold a live `T`;
        // `Empty`/`Storing`/`Invalid` cells have nothing (or nothing
        // complete) to run a destructor on.
        for cell in self.cells.iter_mut() {
            if *cell.state.get_mut() == STORED {
                unsafe { ptr::drop_in_place((*cell.value.get()).as_mut_ptr()) };
            }
        }
    }
}

unsafe impl<T: Send, C: QueueConfig> Send for Block<T, C> {}
unsafe impl<T: Send, C: QueueConfig> Sync for Block<T, C> {}
