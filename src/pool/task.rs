//! The result handle returned by [`super::ThreadPool::post`].
//!
//! A plain oneshot channel only supports a single receiver; the original
//! `async::threadpool`'s future-like return value has no such restriction
//! (any number of call sites may hold and `.get()` the same handle), so
//! this is built directly around a `Mutex`-guarded state machine plus a
//! `Condvar` instead.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};

use crate::error::TaskError;

/// A boxed unit of work posted to the pool's queue.
pub(crate) type Job = Box<dyn FnOnce() + Send>;

enum TaskState<R> {
    Pending,
    Ready(R),
    Panicked(String),
    /// Consumed by a prior [`TaskHandle::get_once`] call.
    Taken,
}

pub(crate) struct TaskInner<R> {
    state: Mutex<TaskState<R>>,
    ready: Condvar,
}

impl<R> TaskInner<R> {
    pub(crate) fn new() -> Self {
        TaskInner {
            state: Mutex::new(TaskState::Pending),
            ready: Condvar::new(),
        }
    }

    /// Runs `f`, containing any panic, and publishes the outcome.
    pub(crate) fn run<F>(&self, f: F)
    where
        F: FnOnce() -> R,
    {
        let outcome = catch_unwind(AssertUnwindSafe(f));
        let mut guard = self.state.lock().unwrap();
        *guard = match outcome {
            Ok(value) => TaskState::Ready(value),
            Err(payload) => TaskState::Panicked(TaskError::Panicked(payload).message().to_string()),
        };
        drop(guard);
        self.ready.notify_all();
    }
}

/// A handle to the eventual result of a task posted with
/// [`super::ThreadPool::post`].
///
/// Clone it to share the same pending (or completed) result with more than
/// one observer. [`TaskHandle::get`] is the repeatable accessor (it clones
/// `R` out on each call); [`TaskHandle::get_once`] consumes the handle and
/// moves `R` out instead, for the common case where only one observer ever
/// needs it.
pub struct TaskHandle<R> {
    inner: Arc<TaskInner<R>>,
}

impl<R> TaskHandle<R> {
    pub(crate) fn new(inner: Arc<TaskInner<R>>) -> Self {
        TaskHandle { inner }
    }

    /// Blocks until the task completes, returning a clone of its result.
    ///
    /// Re-raises the original panic (as a fresh unwind carrying the
    /// captured message) if the task panicked. Panics if the result was
    /// already moved out by [`Self::get_once`] on another clone of this
    /// handle.
    pub fn get(&self) -> R
    where
        R: Clone,
    {
        let mut guard = self.inner.state.lock().unwrap();
        loop {
            match &*guard {
                TaskState::Pending => guard = self.inner.ready.wait(guard).unwrap(),
                TaskState::Ready(value) => return value.clone(),
                TaskState::Panicked(message) => {
                    let message = message.clone();
                    drop(guard);
                    std::panic::resume_unwind(Box::new(message));
                }
                TaskState::Taken => {
                    panic!("TaskHandle::get called after the result was taken by get_once")
                }
            }
        }
    }

    /// Blocks until the task completes, then consumes the handle and moves
    /// the result out. Unlike [`Self::get`], `R` need not be `Clone`.
    ///
    /// Re-raises the original panic if the task panicked. Panics if the
    /// result was already moved out by an earlier `get_once` call on
    /// another clone of this handle.
    pub fn get_once(self) -> R {
        let mut guard = self.inner.state.lock().unwrap();
        loop {
            if matches!(&*guard, TaskState::Pending) {
                guard = self.inner.ready.wait(guard).unwrap();
                continue;
            }
            break;
        }
        let state = std::mem::replace(&mut *guard, TaskState::Taken);
        drop(guard);
        match state {
            TaskState::Ready(value) => value,
            TaskState::Panicked(message) => std::panic::resume_unwind(Box::new(message)),
            TaskState::Taken => {
                panic!("TaskHandle::get_once called after the result was already taken")
            }
            TaskState::Pending => unreachable!("loop above only exits once state is not Pending"),
        }
    }

    /// Non-blocking, non-panicking peek at the task's outcome.
    ///
    /// Returns `None` while the task is still running, `Some(Ok(value))`
    /// once it completes normally, and `Some(Err(_))` if it panicked.
    /// Always `None` after [`Self::get_once`] has taken the result.
    pub fn try_get(&self) -> Option<Result<R, TaskError>>
    where
        R: Clone,
    {
        let guard = self.inner.state.lock().unwrap();
        match &*guard {
            TaskState::Pending => None,
            TaskState::Ready(value) => Some(Ok(value.clone())),
            TaskState::Panicked(message) => Some(Err(TaskError::from_message(message.clone()))),
            TaskState::Taken => None,
        }
    }

    /// `true` once the task has produced a result (or panicked).
    pub fn is_ready(&self) -> bool {
        !matches!(&*self.inner.state.lock().unwrap(), TaskState::Pending)
    }
}

impl<R> Clone for TaskHandle<R> {
    fn clone(&self) -> Self {
        TaskHandle {
            inner: self.inner.clone(),
        }
    }
}

impl<R> fmt::Debug for TaskHandle<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("ready", &self.is_ready())
            .finish()
    }
}
