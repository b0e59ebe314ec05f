//! Queue errors

use std::sync::Arc;

/// Errors returned to queue callers.
///
/// A worker error is shared by every caller of the drain cycle that
/// produced it, hence the `Arc`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueError {
    /// The queue no longer accepts work
    #[error("Queue is closed")]
    Closed,

    /// The worker failed for this cycle
    #[error("Worker failed: {0}")]
    Worker(Arc<ember_core::Error>),

    /// The drain ended without resolving this caller
    #[error("Queue dropped the task before completing it")]
    Dropped,
}

impl QueueError {
    /// The worker error, if any.
    pub fn worker_error(&self) -> Option<&ember_core::Error> {
        match self {
            QueueError::Worker(e) => Some(e),
            _ => None,
        }
    }
}

impl From<QueueError> for ember_core::Error {
    fn from(e: QueueError) -> Self {
        match e {
            QueueError::Worker(inner) => match Arc::try_unwrap(inner) {
                Ok(err) => err,
                Err(shared) => ember_core::Error::InvalidOperation(shared.to_string()),
            },
            other => ember_core::Error::InvalidOperation(other.to_string()),
        }
    }
}
