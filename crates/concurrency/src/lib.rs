//! Concurrency primitives for Ember
//!
//! - [`WriteQueue`]: batches local writes into worker cycles
//! - [`ApplyHeadQueue`]: serializes head transitions, local before remote
//! - [`TaskManager`]: deduplicates and retries remote meta events
//!
//! Each queue keeps its state behind a `parking_lot::Mutex` that is never
//! held across an `.await`, and runs at most one drain task at a time.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod apply_head;
pub mod error;
pub mod task_manager;
pub mod write_queue;

pub use apply_head::{ApplyHeadBatch, ApplyHeadQueue, ApplyHeadTask, ApplyHeadWorker};
pub use error::QueueError;
pub use task_manager::{
    EventHandler, TaskItem, TaskManager, TaskManagerConfig, DEFAULT_REMOVE_AFTER,
    DEFAULT_RETRY_TIMEOUT,
};
pub use write_queue::{WriteQueue, WriteWorker, DEFAULT_CHUNK_SIZE};
