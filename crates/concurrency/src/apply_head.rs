//! Serialized head application
//!
//! Every head transition, local or remote, goes through this queue so that
//! store transactions never interleave. Before each pop the queue is sorted
//! so that update-bearing tasks run first (stable, so FIFO among equals).
//!
//! Processed updates accumulate into a batch. A batch is yielded after a
//! task that carries updates, or once no update-bearing task remains. `all`
//! is true when every task still queued at that point carries updates.
//! Every ticket resolves with the first batch yielded after its task ran.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, error};

use crate::error::QueueError;
use ember_core::{Block, ClockHead, DocUpdate};

/// One head transition.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApplyHeadTask {
    /// Head to move to
    pub new_head: ClockHead,
    /// Head the transition was computed against
    pub prev_head: ClockHead,
    /// Local document updates carried by the transition (empty for remote)
    pub updates: Vec<DocUpdate>,
    /// Blocks the new head needs (event and delta blocks)
    pub blocks: Vec<Block>,
}

impl ApplyHeadTask {
    /// True when the task carries local updates.
    pub fn has_updates(&self) -> bool {
        !self.updates.is_empty()
    }
}

/// Updates yielded by the queue.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApplyHeadBatch {
    /// Updates of every update-bearing task since the previous batch
    pub updates: Vec<DocUpdate>,
    /// True when every task still queued carried updates
    pub all: bool,
}

/// Worker applying one transition at a time.
#[async_trait]
pub trait ApplyHeadWorker: Send + Sync {
    /// Apply `task`; `local_updates` is true when it carries updates.
    async fn apply(&self, task: ApplyHeadTask, local_updates: bool) -> ember_core::Result<()>;
}

struct Queued {
    task: ApplyHeadTask,
    done: oneshot::Sender<Result<ApplyHeadBatch, QueueError>>,
}

struct State {
    queue: VecDeque<Queued>,
    processing: bool,
}

struct Inner {
    worker: Arc<dyn ApplyHeadWorker>,
    state: Mutex<State>,
    batches: broadcast::Sender<ApplyHeadBatch>,
}

/// Queue serializing head application.
#[derive(Clone)]
pub struct ApplyHeadQueue {
    inner: Arc<Inner>,
}

/// Capacity of the batch broadcast channel.
const BATCH_CHANNEL: usize = 256;

impl ApplyHeadQueue {
    /// Create a queue over `worker`.
    pub fn new(worker: Arc<dyn ApplyHeadWorker>) -> Self {
        let (batches, _) = broadcast::channel(BATCH_CHANNEL);
        Self {
            inner: Arc::new(Inner {
                worker,
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    processing: false,
                }),
                batches,
            }),
        }
    }

    /// Enqueue a transition; resolves with the batch that follows it.
    pub async fn push(&self, task: ApplyHeadTask) -> Result<ApplyHeadBatch, QueueError> {
        let (done, rx) = oneshot::channel();
        let spawn = {
            let mut state = self.inner.state.lock();
            state.queue.push_back(Queued { task, done });
            !std::mem::replace(&mut state.processing, true)
        };
        if spawn {
            tokio::spawn(Self::process(Arc::clone(&self.inner)));
        }
        rx.await.unwrap_or(Err(QueueError::Dropped))
    }

    /// Stream of every yielded batch.
    pub fn batches(&self) -> broadcast::Receiver<ApplyHeadBatch> {
        self.inner.batches.subscribe()
    }

    /// Number of queued tasks.
    pub fn size(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    async fn process(inner: Arc<Inner>) {
        let mut updates: Vec<DocUpdate> = Vec::new();
        let mut waiting: Vec<oneshot::Sender<Result<ApplyHeadBatch, QueueError>>> = Vec::new();

        loop {
            let next = {
                let mut state = inner.state.lock();
                // stable: update-bearing tasks first, FIFO otherwise
                state
                    .queue
                    .make_contiguous()
                    .sort_by_key(|q| !q.task.has_updates());
                match state.queue.pop_front() {
                    Some(next) => next,
                    None => {
                        state.processing = false;
                        break;
                    }
                }
            };

            let Queued { task, done } = next;
            let local_updates = task.has_updates();
            let task_updates = task.updates.clone();
            debug!(
                target: "ember::queue",
                new_head = task.new_head.len(),
                updates = task_updates.len(),
                "Applying head"
            );

            if let Err(e) = inner.worker.apply(task, local_updates).await {
                error!(target: "ember::queue", error = %e, "Head application failed");
                Self::resolve(&inner, &mut updates, &mut waiting, false);
                let _ = done.send(Err(QueueError::Worker(Arc::new(e))));
                continue;
            }

            updates.extend(task_updates);
            waiting.push(done);

            let (remaining_with_updates, all) = {
                let state = inner.state.lock();
                (
                    state.queue.iter().any(|q| q.task.has_updates()),
                    state.queue.iter().all(|q| q.task.has_updates()),
                )
            };
            if local_updates || !remaining_with_updates {
                Self::resolve(&inner, &mut updates, &mut waiting, all);
            }
        }

        if !waiting.is_empty() {
            Self::resolve(&inner, &mut updates, &mut waiting, true);
        }
    }

    fn resolve(
        inner: &Inner,
        updates: &mut Vec<DocUpdate>,
        waiting: &mut Vec<oneshot::Sender<Result<ApplyHeadBatch, QueueError>>>,
        all: bool,
    ) {
        if waiting.is_empty() {
            return;
        }
        let batch = ApplyHeadBatch {
            updates: std::mem::take(updates),
            all,
        };
        let _ = inner.batches.send(batch.clone());
        for done in waiting.drain(..) {
            let _ = done.send(Ok(batch.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_core::{Cid, Codec, Error};

    fn cid(n: u8) -> Cid {
        Cid::hash(Codec::Structured, &[n])
    }

    fn task(n: u8, updates: &[&str]) -> ApplyHeadTask {
        ApplyHeadTask {
            new_head: vec![cid(n)],
            prev_head: vec![],
            updates: updates.iter().map(|id| DocUpdate::delete(*id)).collect(),
            blocks: vec![],
        }
    }

    /// Records applied heads and the local flag; fails on head `cid(99)`.
    #[derive(Default)]
    struct Recorder {
        applied: Mutex<Vec<(Cid, bool)>>,
    }

    #[async_trait]
    impl ApplyHeadWorker for Recorder {
        async fn apply(&self, task: ApplyHeadTask, local: bool) -> ember_core::Result<()> {
            tokio::task::yield_now().await;
            if task.new_head == vec![cid(99)] {
                return Err(Error::MissingBlock(cid(99)));
            }
            self.applied.lock().push((task.new_head[0], local));
            Ok(())
        }
    }

    fn queue() -> (Arc<Recorder>, ApplyHeadQueue) {
        let recorder = Arc::new(Recorder::default());
        (recorder.clone(), ApplyHeadQueue::new(recorder))
    }

    #[tokio::test]
    async fn test_single_task_batch() {
        let (recorder, q) = queue();
        let batch = q.push(task(1, &["a"])).await.unwrap();
        assert_eq!(batch.updates, vec![DocUpdate::delete("a")]);
        assert!(batch.all);
        assert_eq!(*recorder.applied.lock(), vec![(cid(1), true)]);
        assert_eq!(q.size(), 0);
    }

    #[tokio::test]
    async fn test_remote_task_waits_for_local() {
        let (recorder, q) = queue();
        let (remote, local1, local2) = tokio::join!(
            q.push(task(1, &[])),
            q.push(task(2, &["a"])),
            q.push(task(3, &["b"]))
        );
        let applied = recorder.applied.lock().clone();
        assert_eq!(
            applied,
            vec![(cid(2), true), (cid(3), true), (cid(1), false)]
        );
        let local1 = local1.unwrap();
        assert_eq!(local1.updates, vec![DocUpdate::delete("a")]);
        assert!(!local1.all);
        assert_eq!(local2.unwrap().updates, vec![DocUpdate::delete("b")]);
        let remote = remote.unwrap();
        assert!(remote.updates.is_empty());
        assert!(remote.all);
    }

    #[tokio::test]
    async fn test_sorting_moves_remote_behind_local() {
        let (recorder, q) = queue();
        let (first, remote, local) = tokio::join!(
            q.push(task(1, &["x"])),
            q.push(task(2, &[])),
            q.push(task(3, &["y"]))
        );
        let applied = recorder.applied.lock().clone();
        assert_eq!(
            applied,
            vec![(cid(1), true), (cid(3), true), (cid(2), false)]
        );
        let first = first.unwrap();
        assert_eq!(first.updates, vec![DocUpdate::delete("x")]);
        assert!(!first.all);
        assert_eq!(local.unwrap().updates, vec![DocUpdate::delete("y")]);
        let remote = remote.unwrap();
        assert!(remote.updates.is_empty());
        assert!(remote.all);
    }

    #[tokio::test]
    async fn test_worker_error_resolves_only_failing_task() {
        let (recorder, q) = queue();
        let (bad, good) = tokio::join!(q.push(task(99, &["a"])), q.push(task(2, &["b"])));
        assert!(matches!(
            bad.unwrap_err().worker_error(),
            Some(Error::MissingBlock(_))
        ));
        assert_eq!(good.unwrap().updates, vec![DocUpdate::delete("b")]);
        assert_eq!(recorder.applied.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_batches_stream() {
        let (_recorder, q) = queue();
        let mut batches = q.batches();
        q.push(task(1, &["a"])).await.unwrap();
        q.push(task(2, &[])).await.unwrap();
        let first = batches.recv().await.unwrap();
        let second = batches.recv().await.unwrap();
        assert_eq!(first.updates, vec![DocUpdate::delete("a")]);
        assert!(second.updates.is_empty());
    }
}
