//! Error types surfaced by the thread pool's non-panicking accessors.
//!
//! Every other failure mode in this crate (full/empty queues, safe-mode
//! construction failures) has a more precise non-`Result` representation
//! (`bool`/`Option`), so this is the crate's entire error surface.

use std::fmt;

/// The outcome of a [`crate::pool::TaskHandle`] when the posted closure did
/// not return normally.
pub enum TaskError {
    /// The task panicked; the payload is the value passed to `panic!`.
    Panicked(Box<dyn std::any::Any + Send + 'static>),
}

impl TaskError {
    /// Builds a `TaskError` carrying `message` as its payload.
    ///
    /// Used to reconstruct a `TaskError` for a [`crate::pool::TaskHandle`]
    /// observer after the original panic payload (a `Box<dyn Any + Send>`,
    /// not `Clone`) has already been reduced to a message once, so that
    /// more than one observer can each receive their own `TaskError`.
    pub fn from_message(message: impl Into<String>) -> Self {
        TaskError::Panicked(Box::new(message.into()))
    }

    /// Best-effort description of the panic payload, for display purposes.
    ///
    /// Most panics carry a `&'static str` or `String` message; anything else
    /// (a custom payload passed to `panic_any`) falls back to a placeholder.
    pub fn message(&self) -> &str {
        let TaskError::Panicked(payload) = self;
        if let Some(s) = payload.downcast_ref::<&'static str>() {
            s
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.as_str()
        } else {
            "<non-string panic payload>"
        }
    }
}

impl fmt::Debug for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Panicked").field(&self.message()).finish()
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task panicked: {}", self.message())
    }
}

impl std::error::Error for TaskError {}
