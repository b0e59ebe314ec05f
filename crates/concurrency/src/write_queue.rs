//! Batched write queue
//!
//! Callers submit batches of tasks and await the result of the worker call
//! that covered them. A drain cycle takes up to `chunk_size` queued batches,
//! calls the worker once with their tasks concatenated in queue order, and
//! resolves every caller of that cycle with the same result.
//!
//! # Design Notes
//!
//! - **Single flight**: one drain task at most, guarded by `processing`
//! - **FIFO cycles**: batches are taken from the front of the queue
//! - **Isolation**: a failed cycle resolves its callers with the error and
//!   the drain moves on to the next cycle

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{oneshot, Notify};
use tracing::{debug, warn};

use crate::error::QueueError;

/// Default number of batches per drain cycle.
pub const DEFAULT_CHUNK_SIZE: usize = 32;

/// Worker invoked once per drain cycle.
#[async_trait]
pub trait WriteWorker<T, R>: Send + Sync {
    /// Apply `tasks`, the concatenation of every batch in the cycle.
    async fn write(&self, tasks: Vec<T>) -> ember_core::Result<R>;
}

struct Pending<T, R> {
    tasks: Vec<T>,
    done: oneshot::Sender<Result<R, QueueError>>,
}

struct State<T, R> {
    queue: VecDeque<Pending<T, R>>,
    processing: bool,
    closed: bool,
}

struct Inner<T, R> {
    worker: Arc<dyn WriteWorker<T, R>>,
    chunk_size: usize,
    state: Mutex<State<T, R>>,
    idle: Notify,
}

/// Queue serializing writes through a batching worker.
pub struct WriteQueue<T, R> {
    inner: Arc<Inner<T, R>>,
}

impl<T, R> Clone for WriteQueue<T, R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T, R> WriteQueue<T, R>
where
    T: Send + 'static,
    R: Clone + Send + 'static,
{
    /// Create a queue over `worker`. A `chunk_size` of 0 is treated as 1.
    pub fn new(worker: Arc<dyn WriteWorker<T, R>>, chunk_size: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                worker,
                chunk_size: chunk_size.max(1),
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    processing: false,
                    closed: false,
                }),
                idle: Notify::new(),
            }),
        }
    }

    /// Submit one task.
    pub async fn push(&self, task: T) -> Result<R, QueueError> {
        self.bulk(vec![task]).await
    }

    /// Submit a batch; its tasks reach the worker together and in order.
    pub async fn bulk(&self, tasks: Vec<T>) -> Result<R, QueueError> {
        let (done, rx) = oneshot::channel();
        let spawn = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(QueueError::Closed);
            }
            state.queue.push_back(Pending { tasks, done });
            !std::mem::replace(&mut state.processing, true)
        };
        if spawn {
            tokio::spawn(Self::drain(Arc::clone(&self.inner)));
        }
        rx.await.unwrap_or(Err(QueueError::Dropped))
    }

    /// Number of batches waiting for a cycle.
    pub fn len(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    /// True if no batch is waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop accepting work and wait until every queued batch is resolved.
    pub async fn close(&self) {
        self.inner.state.lock().closed = true;
        loop {
            let notified = self.inner.idle.notified();
            {
                let state = self.inner.state.lock();
                if state.queue.is_empty() && !state.processing {
                    break;
                }
            }
            notified.await;
        }
        debug!(target: "ember::queue", "Write queue closed");
    }

    async fn drain(inner: Arc<Inner<T, R>>) {
        loop {
            let cycle: Vec<Pending<T, R>> = {
                let mut state = inner.state.lock();
                if state.queue.is_empty() {
                    state.processing = false;
                    drop(state);
                    inner.idle.notify_waiters();
                    return;
                }
                let take = inner.chunk_size.min(state.queue.len());
                state.queue.drain(..take).collect()
            };

            let mut tasks = Vec::new();
            let mut waiters = Vec::with_capacity(cycle.len());
            for pending in cycle {
                tasks.extend(pending.tasks);
                waiters.push(pending.done);
            }
            debug!(
                target: "ember::queue",
                batches = waiters.len(),
                tasks = tasks.len(),
                "Write cycle"
            );

            let result = inner
                .worker
                .write(tasks)
                .await
                .map_err(|e| QueueError::Worker(Arc::new(e)));
            if let Err(e) = &result {
                warn!(target: "ember::queue", error = %e, "Write cycle failed");
            }
            for done in waiters {
                let _ = done.send(result.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_core::Error;

    /// Records every invocation; fails when it sees the task "fail".
    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<Vec<String>>>,
    }

    #[async_trait]
    impl WriteWorker<String, usize> for Recorder {
        async fn write(&self, tasks: Vec<String>) -> ember_core::Result<usize> {
            tokio::task::yield_now().await;
            if tasks.iter().any(|t| t == "fail") {
                return Err(Error::InvalidOperation("worker refused".into()));
            }
            let mut calls = self.calls.lock();
            calls.push(tasks);
            Ok(calls.len())
        }
    }

    fn queue(chunk: usize) -> (Arc<Recorder>, WriteQueue<String, usize>) {
        let recorder = Arc::new(Recorder::default());
        let q = WriteQueue::new(recorder.clone() as Arc<dyn WriteWorker<String, usize>>, chunk);
        (recorder, q)
    }

    #[tokio::test]
    async fn test_chunk_one_preserves_submission_order() {
        let (recorder, q) = queue(1);
        let (a, b, c) = tokio::join!(
            q.push("a".to_string()),
            q.push("b".to_string()),
            q.push("c".to_string())
        );
        assert_eq!((a.unwrap(), b.unwrap(), c.unwrap()), (1, 2, 3));
        assert_eq!(
            *recorder.calls.lock(),
            vec![vec!["a".to_string()], vec!["b".to_string()], vec!["c".to_string()]]
        );
    }

    #[tokio::test]
    async fn test_chunk_32_single_invocation() {
        let (recorder, q) = queue(DEFAULT_CHUNK_SIZE);
        let (a, b, c) = tokio::join!(
            q.push("a".to_string()),
            q.push("b".to_string()),
            q.push("c".to_string())
        );
        assert_eq!((a.unwrap(), b.unwrap(), c.unwrap()), (1, 1, 1));
        assert_eq!(
            *recorder.calls.lock(),
            vec![vec!["a".to_string(), "b".to_string(), "c".to_string()]]
        );
    }

    #[tokio::test]
    async fn test_bulk_keeps_batch_together() {
        let (recorder, q) = queue(1);
        q.bulk(vec!["x".to_string(), "y".to_string()]).await.unwrap();
        assert_eq!(
            *recorder.calls.lock(),
            vec![vec!["x".to_string(), "y".to_string()]]
        );
    }

    #[tokio::test]
    async fn test_failed_cycle_does_not_block_next() {
        let (recorder, q) = queue(1);
        let (bad, good) = tokio::join!(q.push("fail".to_string()), q.push("ok".to_string()));
        assert!(matches!(bad, Err(QueueError::Worker(_))));
        assert_eq!(good.unwrap(), 1);
        assert_eq!(recorder.calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_cycle_error_reaches_every_caller() {
        let (_recorder, q) = queue(DEFAULT_CHUNK_SIZE);
        let (a, b) = tokio::join!(q.push("fail".to_string()), q.push("fine".to_string()));
        assert!(a.unwrap_err().worker_error().is_some());
        assert!(b.unwrap_err().worker_error().is_some());
    }

    #[tokio::test]
    async fn test_close_waits_then_rejects() {
        let (recorder, q) = queue(1);
        let pusher = q.clone();
        let pending = tokio::spawn(async move { pusher.push("late".to_string()).await });
        tokio::task::yield_now().await;

        q.close().await;
        assert!(q.is_empty());
        assert!(pending.await.unwrap().is_ok());
        assert_eq!(recorder.calls.lock().len(), 1);

        assert!(matches!(
            q.push("after".to_string()).await,
            Err(QueueError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_close_on_idle_queue_returns() {
        let (_recorder, q) = queue(4);
        q.close().await;
        assert!(matches!(
            q.push("x".to_string()).await,
            Err(QueueError::Closed)
        ));
    }
}
