//! CRDT clock: head application
//!
//! Every head transition goes through the [`ApplyHeadQueue`], whose worker
//! is the only code that opens store transactions. A transition either
//! fast-forwards (the current head is the task's `prev_head`) or merges the
//! new head into the current one and writes the rematerialized root.
//!
//! Local transitions are handed to a [`CommitHook`] (the loader) before the
//! transaction commits; if the hook fails the transaction is rolled back.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, error};

use ember_concurrency::{ApplyHeadBatch, ApplyHeadQueue, ApplyHeadTask, ApplyHeadWorker};
use ember_core::{heads_equal, sort_head, Block, Cid, ClockHead, DocUpdate, Result, TransactionMeta};
use ember_storage::{require_block, TransactionalBlockStore};

use crate::root::{changes_since, merge_heads, root};

/// Capacity of the watcher broadcast channel.
const WATCH_CHANNEL: usize = 256;

/// Receives the blocks of every local transaction before it commits.
#[async_trait]
pub trait CommitHook: Send + Sync {
    /// Make `blocks` durable under `meta`.
    async fn committed(&self, blocks: Vec<Block>, meta: &TransactionMeta) -> Result<()>;
}

struct ClockCore {
    store: Arc<TransactionalBlockStore>,
    head: Mutex<ClockHead>,
    root: Mutex<Option<Cid>>,
    hook: Option<Arc<dyn CommitHook>>,
    gate: tokio::sync::Mutex<()>,
}

impl ClockCore {
    /// Runs with the transaction open; the caller commits or rolls back.
    async fn transition(
        &self,
        current: &[Cid],
        new_head: &[Cid],
        prev_head: &[Cid],
    ) -> Result<(ClockHead, Option<Cid>)> {
        for cid in new_head {
            require_block(&*self.store, cid).await?;
        }
        if heads_equal(current, prev_head) {
            debug!(target: "ember::clock", head = new_head.len(), "Fast-forward");
            return Ok((new_head.to_vec(), None));
        }

        let merged = merge_heads(&*self.store, current, new_head).await?;
        let prior = *self.root.lock();
        let result = root(&*self.store, &merged, prior.as_ref()).await?;
        debug!(
            target: "ember::clock",
            head = merged.len(),
            additions = result.additions.len(),
            removals = result.removals.len(),
            "Merged head"
        );
        for block in result.additions {
            self.store.put_block(block);
        }
        Ok((merged, Some(result.root)))
    }
}

#[async_trait]
impl ApplyHeadWorker for ClockCore {
    async fn apply(&self, task: ApplyHeadTask, local_updates: bool) -> Result<()> {
        let _gate = self.gate.lock().await;

        let current = sort_head(self.head.lock().clone());
        let new_head = sort_head(task.new_head);
        if current == new_head {
            debug!(target: "ember::clock", "Head unchanged");
            return Ok(());
        }

        self.store.begin()?;
        for block in task.blocks {
            self.store.put_block(block);
        }

        let outcome = match self.transition(&current, &new_head, &task.prev_head).await {
            Ok((head, root)) => match (&self.hook, local_updates) {
                (Some(hook), true) => {
                    let meta = TransactionMeta::new(head.clone());
                    hook.committed(self.store.pending_entries(), &meta)
                        .await
                        .map(|()| (head, root))
                }
                _ => Ok((head, root)),
            },
            Err(e) => Err(e),
        };

        match outcome {
            Ok((head, root)) => {
                self.store.commit();
                *self.head.lock() = head;
                if root.is_some() {
                    *self.root.lock() = root;
                }
                Ok(())
            }
            Err(e) => {
                self.store.rollback();
                error!(target: "ember::clock", error = %e, "Head application rolled back");
                Err(e)
            }
        }
    }
}

/// Current head of one store plus the queue that moves it.
#[derive(Clone)]
pub struct CrdtClock {
    core: Arc<ClockCore>,
    queue: ApplyHeadQueue,
    watchers: broadcast::Sender<Vec<DocUpdate>>,
}

impl CrdtClock {
    /// Clock over `store`, handing local transactions to `hook`.
    pub fn new(store: Arc<TransactionalBlockStore>, hook: Option<Arc<dyn CommitHook>>) -> Self {
        let core = Arc::new(ClockCore {
            store,
            head: Mutex::new(Vec::new()),
            root: Mutex::new(None),
            hook,
            gate: tokio::sync::Mutex::new(()),
        });
        let (watchers, _) = broadcast::channel(WATCH_CHANNEL);
        Self {
            queue: ApplyHeadQueue::new(core.clone()),
            core,
            watchers,
        }
    }

    /// Current head.
    pub fn head(&self) -> ClockHead {
        self.core.head.lock().clone()
    }

    /// Replace the head without a transition (loading from durable state).
    pub fn set_head(&self, head: ClockHead) {
        *self.core.head.lock() = sort_head(head);
    }

    /// The store this clock writes to.
    pub fn store(&self) -> &Arc<TransactionalBlockStore> {
        &self.core.store
    }

    /// Number of transitions waiting in the queue.
    pub fn pending(&self) -> usize {
        self.queue.size()
    }

    /// Apply a transition and notify watchers.
    ///
    /// Resolves once the batch holding the transition is yielded.
    pub async fn apply_head(&self, task: ApplyHeadTask) -> Result<ApplyHeadBatch> {
        let local = task.has_updates();
        let since = if task.prev_head.is_empty() {
            self.head()
        } else {
            task.prev_head.clone()
        };
        let batch = self.queue.push(task).await?;
        self.process_updates(&batch, local, &since).await?;
        Ok(batch)
    }

    async fn process_updates(
        &self,
        batch: &ApplyHeadBatch,
        local: bool,
        since: &[Cid],
    ) -> Result<()> {
        if self.watchers.receiver_count() == 0 {
            return Ok(());
        }
        let updates = if local && batch.all {
            batch.updates.clone()
        } else {
            changes_since(&**self.store(), &self.head(), since).await?
        };
        if !updates.is_empty() {
            let _ = self.watchers.send(updates);
        }
        Ok(())
    }

    /// Stream of the updates of every applied generation.
    pub fn subscribe(&self) -> broadcast::Receiver<Vec<DocUpdate>> {
        self.watchers.subscribe()
    }

    /// Hold off head application until the guard drops.
    pub async fn exclusive(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.core.gate.lock().await
    }
}
