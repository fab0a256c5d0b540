// #![deny(missing_docs, dead_code)]

//! ### Canal
//!
//! A library of multithreaded concurrency primitives: a lock-free unbounded
//! MPMC queue, a bounded MPMC ring buffer with optional blocking semantics,
//! and a thread pool built on top of the unbounded queue.

#[cfg(test)]
extern crate crossbeam;

pub mod bounded;
pub mod config;
pub mod error;
pub mod pool;
pub mod unbounded;
mod util;

pub use bounded::BoundedQueue;
pub use config::{Checked, Fast, QueueConfig};
pub use error::TaskError;
pub use pool::{TaskHandle, ThreadPool};
pub use unbounded::UnboundedQueue;
