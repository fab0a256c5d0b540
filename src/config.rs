//! Configuration traits shared by the unbounded and bounded queues.
//!
//! The C++ original selects safe vs. unsafe construction behavior and the
//! unbounded queue's block size via compile-time traits classes. The direct
//! Rust equivalent is a trait with associated constants, implemented by a
//! pair of zero-sized marker types.

/// Associated-constant configuration for a queue instantiation.
///
/// `BLOCK_SIZE` is only consulted by [`crate::unbounded::UnboundedQueue`];
/// the bounded queue ignores it.
pub trait QueueConfig: Send + Sync + 'static {
    /// Number of cells per block in the unbounded queue. Must be a power of
    /// two; a debug assertion enforces this at queue construction.
    const BLOCK_SIZE: usize = 1024;

    /// When `true`, a constructor closure passed to `enqueue_with` is run
    /// under `catch_unwind` and a panic marks the claimed slot `Invalid`
    /// instead of unwinding through the queue's internals.
    const SAFE: bool = false;
}

/// Default configuration: no per-element panic containment.
///
/// Appropriate when the element type's construction cannot panic, or when a
/// panic during construction is acceptable to treat as a process-level
/// bug rather than a queue-level condition.
#[derive(Debug, Clone, Copy, Default)]
pub struct Fast;

impl QueueConfig for Fast {}

/// Safe-mode configuration: contains constructor panics as `Invalid` cells.
#[derive(Debug, Clone, Copy, Default)]
pub struct Checked;

impl QueueConfig for Checked {
    const SAFE: bool = true;
}
