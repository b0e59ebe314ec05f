//! Remote event task manager
//!
//! Remote meta events arrive asynchronously, possibly more than once and
//! out of order. The manager records every parent of an incoming event as
//! handled (a child supersedes its ancestors), drops queued items that are
//! already handled, and drains the rest one at a time through an
//! [`EventHandler`].
//!
//! A failing item is retried on later drains; once its retry count passes
//! `remove_after` it is dropped with a warning. After a failure the drain
//! sleeps `retry_timeout`, schedules a background drain for what is left,
//! and returns the error to its caller.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use tracing::{debug, warn};

use ember_core::{Block, Cid, Result};

/// Default retry bound.
pub const DEFAULT_REMOVE_AFTER: usize = 3;

/// Default pause after a failed drain.
pub const DEFAULT_RETRY_TIMEOUT: Duration = Duration::from_millis(50);

/// Task manager tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskManagerConfig {
    /// Failures tolerated before an item is dropped
    pub remove_after: usize,
    /// Pause after a failed drain
    pub retry_timeout: Duration,
}

impl Default for TaskManagerConfig {
    fn default() -> Self {
        Self {
            remove_after: DEFAULT_REMOVE_AFTER,
            retry_timeout: DEFAULT_RETRY_TIMEOUT,
        }
    }
}

/// Processes one remote event.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle the event block `event` addressed by `cid`.
    async fn handle_event(&self, cid: &Cid, event: &Block) -> Result<()>;
}

/// A queued remote event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskItem {
    /// Event CID
    pub cid: Cid,
    /// Event block
    pub event: Block,
    /// Failed attempts so far
    pub retries: usize,
}

#[derive(Deserialize)]
struct EventParents {
    #[serde(default)]
    parents: Vec<Cid>,
}

struct State {
    queue: Vec<TaskItem>,
    handled: HashSet<Cid>,
    processing: bool,
}

struct Inner {
    handler: Arc<dyn EventHandler>,
    config: TaskManagerConfig,
    state: Mutex<State>,
}

/// Deduplicating, retrying queue of remote events.
#[derive(Clone)]
pub struct TaskManager {
    inner: Arc<Inner>,
}

impl TaskManager {
    /// Create a manager over `handler`.
    pub fn new(handler: Arc<dyn EventHandler>, config: TaskManagerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                handler,
                config,
                state: Mutex::new(State {
                    queue: Vec::new(),
                    handled: HashSet::new(),
                    processing: false,
                }),
            }),
        }
    }

    /// Queue a remote event and drain.
    ///
    /// Returns `Ok` immediately if a drain is already running; that drain
    /// picks the event up.
    pub async fn handle_event(&self, event: Block) -> Result<()> {
        let header: EventParents = event.decode()?;
        {
            let mut state = self.inner.state.lock();
            for parent in header.parents {
                state.handled.insert(parent);
            }
            state.queue.push(TaskItem {
                cid: event.cid,
                event,
                retries: 0,
            });
            let State { queue, handled, .. } = &mut *state;
            queue.retain(|item| !handled.contains(&item.cid));
        }
        Self::process(Arc::clone(&self.inner)).await
    }

    /// Number of queued events.
    pub fn size(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    /// True if `cid` has been handled or superseded.
    pub fn is_handled(&self, cid: &Cid) -> bool {
        self.inner.state.lock().handled.contains(cid)
    }

    fn process(inner: Arc<Inner>) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> {
        Box::pin(async move {
            {
                let mut state = inner.state.lock();
                if state.processing {
                    return Ok(());
                }
                state.processing = true;
            }

            let outcome = Self::drain(&inner).await;

            if let Err(e) = outcome {
                tokio::time::sleep(inner.config.retry_timeout).await;
                let remaining = {
                    let mut state = inner.state.lock();
                    state.processing = false;
                    state.queue.len()
                };
                if remaining > 0 {
                    let background = Arc::clone(&inner);
                    tokio::spawn(async move {
                        if let Err(e) = Self::process(background).await {
                            debug!(target: "ember::tasks", error = %e, "Background drain failed");
                        }
                    });
                }
                return Err(e);
            }

            inner.state.lock().processing = false;
            Ok(())
        })
    }

    async fn drain(inner: &Inner) -> Result<()> {
        loop {
            let item = {
                let mut state = inner.state.lock();
                let State { queue, handled, .. } = &mut *state;
                queue.retain(|item| !handled.contains(&item.cid));
                match queue.first() {
                    Some(item) => item.clone(),
                    None => return Ok(()),
                }
            };

            match inner.handler.handle_event(&item.cid, &item.event).await {
                Ok(()) => {
                    let mut state = inner.state.lock();
                    state.handled.insert(item.cid);
                    state.queue.retain(|t| t.cid != item.cid);
                    debug!(target: "ember::tasks", cid = %item.cid, "Event handled");
                }
                Err(e) => {
                    let mut state = inner.state.lock();
                    let remove_after = inner.config.remove_after;
                    if let Some(pos) = state.queue.iter().position(|t| t.cid == item.cid) {
                        state.queue[pos].retries += 1;
                        let retries = state.queue[pos].retries;
                        if retries > remove_after {
                            state.queue.remove(pos);
                            warn!(
                                target: "ember::tasks",
                                cid = %item.cid,
                                retries,
                                error = %e,
                                "Dropping event after repeated failures"
                            );
                        } else {
                            debug!(target: "ember::tasks", cid = %item.cid, retries, error = %e, "Event failed");
                        }
                    }
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_core::Error;
    use serde::Serialize;
    use std::collections::HashMap;

    #[derive(Serialize)]
    struct Event {
        parents: Vec<Cid>,
        data: String,
    }

    fn event(parents: Vec<Cid>, data: &str) -> Block {
        Block::encode(&Event {
            parents,
            data: data.into(),
        })
        .unwrap()
    }

    /// Counts calls per cid; fails a cid while its budget is positive.
    #[derive(Default)]
    struct Counter {
        calls: Mutex<Vec<Cid>>,
        failures: Mutex<HashMap<Cid, usize>>,
    }

    #[async_trait]
    impl EventHandler for Counter {
        async fn handle_event(&self, cid: &Cid, _event: &Block) -> Result<()> {
            self.calls.lock().push(*cid);
            let mut failures = self.failures.lock();
            if let Some(left) = failures.get_mut(cid) {
                if *left > 0 {
                    *left -= 1;
                    return Err(Error::GatewayError("remote meta unavailable".into()));
                }
            }
            Ok(())
        }
    }

    fn manager(counter: Arc<Counter>, remove_after: usize) -> TaskManager {
        TaskManager::new(
            counter,
            TaskManagerConfig {
                remove_after,
                retry_timeout: Duration::from_millis(1),
            },
        )
    }

    async fn wait_until(mut f: impl FnMut() -> bool) {
        for _ in 0..500 {
            if f() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_same_event_processed_once() {
        let counter = Arc::new(Counter::default());
        let tm = manager(counter.clone(), 3);
        let e = event(vec![], "one");
        tm.handle_event(e.clone()).await.unwrap();
        tm.handle_event(e.clone()).await.unwrap();
        assert_eq!(*counter.calls.lock(), vec![e.cid]);
        assert!(tm.is_handled(&e.cid));
    }

    #[tokio::test]
    async fn test_child_supersedes_parent() {
        let counter = Arc::new(Counter::default());
        let tm = manager(counter.clone(), 3);
        let parent = event(vec![], "parent");
        let child = event(vec![parent.cid], "child");

        tm.handle_event(child.clone()).await.unwrap();
        tm.handle_event(parent.clone()).await.unwrap();
        assert_eq!(*counter.calls.lock(), vec![child.cid]);
        assert_eq!(tm.size(), 0);
    }

    #[tokio::test]
    async fn test_failure_retried_in_background() {
        let counter = Arc::new(Counter::default());
        let e = event(vec![], "flaky");
        counter.failures.lock().insert(e.cid, 1);
        let tm = manager(counter.clone(), 3);

        assert!(tm.handle_event(e.clone()).await.is_err());
        wait_until(|| tm.is_handled(&e.cid)).await;
        assert_eq!(counter.calls.lock().len(), 2);
        assert_eq!(tm.size(), 0);
    }

    #[tokio::test]
    async fn test_dropped_after_retry_bound() {
        let counter = Arc::new(Counter::default());
        let e = event(vec![], "broken");
        counter.failures.lock().insert(e.cid, usize::MAX);
        let tm = manager(counter.clone(), 2);

        assert!(tm.handle_event(e.clone()).await.is_err());
        wait_until(|| tm.size() == 0).await;
        // initial attempt plus retries until the count passes the bound
        assert_eq!(counter.calls.lock().len(), 3);
        assert!(!tm.is_handled(&e.cid));
    }

    #[tokio::test]
    async fn test_rejects_non_event_block() {
        let counter = Arc::new(Counter::default());
        let tm = manager(counter, 3);
        let err = tm.handle_event(Block::raw(b"\xc1".to_vec())).await;
        assert!(matches!(err, Err(Error::SerializationError(_))));
    }

    #[test]
    fn test_default_config() {
        let config = TaskManagerConfig::default();
        assert_eq!(config.remove_after, 3);
        assert_eq!(config.retry_timeout, Duration::from_millis(50));
    }
}
