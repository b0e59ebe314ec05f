//! CRDT database handle
//!
//! Wires the pieces together:
//!
//! ```text
//! put/delete/bulk -> WriteQueue -> CrdtWriter (delta + event blocks)
//!                                      |
//! remote meta -> TaskManager ----> CrdtClock::apply_head -> store + Loader
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use ember_concurrency::{ApplyHeadTask, EventHandler, TaskManager, WriteQueue, WriteWorker};
use ember_core::{Block, Cid, ClockHead, DocUpdate, Error, Result, TransactionMeta};
use ember_durability::{DbMetaEvent, Gateway, MemoryGateway};
use ember_storage::{
    BlockCodec, BlockFetcher, EncryptedCodec, IdentityCodec, KeyBag, TransactionalBlockStore,
};

use crate::clock::advance;
use crate::compaction::{self, CompactStrategyRegistry, CompactionReport};
use crate::config::EngineConfig;
use crate::crdt_clock::{CommitHook, CrdtClock};
use crate::loader::{Loader, RemoteStore};
use crate::root::{all_entries, changes_since, get_doc, merge_heads, write_event};

/// Where a database lives and what it is wired to.
pub struct CrdtOptions {
    gateway: Arc<dyn Gateway>,
    url: Url,
    remote: Option<(Arc<dyn Gateway>, Url)>,
    registry: CompactStrategyRegistry,
    keybag: Option<KeyBag>,
}

impl CrdtOptions {
    /// Database at `url` on `gateway`.
    pub fn new(gateway: Arc<dyn Gateway>, url: Url) -> Self {
        Self {
            gateway,
            url,
            remote: None,
            registry: CompactStrategyRegistry::default(),
            keybag: None,
        }
    }

    /// Database on a fresh in-memory gateway.
    pub fn memory(name: &str) -> Result<Self> {
        let url = Url::parse(&format!("memory://ember/{}", name))
            .map_err(|e| Error::ConfigError(format!("invalid database name '{}': {}", name, e)))?;
        Ok(Self::new(Arc::new(MemoryGateway::new()), url))
    }

    /// Sync with a remote at `url` on `gateway`.
    pub fn with_remote(mut self, gateway: Arc<dyn Gateway>, url: Url) -> Self {
        self.remote = Some((gateway, url));
        self
    }

    /// Use `registry` to resolve compaction strategies.
    pub fn with_registry(mut self, registry: CompactStrategyRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Take encryption keys from `keybag` instead of an in-memory one.
    pub fn with_keybag(mut self, keybag: KeyBag) -> Self {
        self.keybag = Some(keybag);
        self
    }
}

/// Fetcher that sees blocks of a write before they reach the store.
struct Staged<'a> {
    blocks: HashMap<Cid, Block>,
    store: &'a TransactionalBlockStore,
}

#[async_trait]
impl BlockFetcher for Staged<'_> {
    async fn get_block(&self, cid: &Cid) -> Result<Option<Block>> {
        match self.blocks.get(cid) {
            Some(block) => Ok(Some(block.clone())),
            None => Ok(self.store.get(cid)),
        }
    }
}

struct CrdtWriter {
    clock: CrdtClock,
}

#[async_trait]
impl WriteWorker<DocUpdate, ClockHead> for CrdtWriter {
    async fn write(&self, updates: Vec<DocUpdate>) -> Result<ClockHead> {
        let prev_head = self.clock.head();
        let (blocks, event) = write_event(&prev_head, &updates)?;
        let staged = Staged {
            blocks: blocks.iter().map(|b| (b.cid, b.clone())).collect(),
            store: self.clock.store(),
        };
        let new_head = advance(&staged, &prev_head, event).await?;
        debug!(target: "ember::queue", updates = updates.len(), event = %event, "Write staged");

        self.clock
            .apply_head(ApplyHeadTask {
                new_head,
                prev_head,
                updates,
                blocks,
            })
            .await?;
        Ok(self.clock.head())
    }
}

struct RemoteMetaHandler {
    loader: Arc<Loader>,
    clock: CrdtClock,
}

#[async_trait]
impl EventHandler for RemoteMetaHandler {
    async fn handle_event(&self, _cid: &Cid, event: &Block) -> Result<()> {
        let meta = DbMetaEvent::from_block(event)?;
        let Some(state) = self.loader.handle_db_meta(&meta).await? else {
            return Ok(());
        };
        // an empty prev_head fast-forwards a fresh replica and merges otherwise
        self.clock
            .apply_head(ApplyHeadTask {
                new_head: state.head,
                prev_head: Vec::new(),
                updates: Vec::new(),
                blocks: state.blocks,
            })
            .await?;
        self.loader.adopt(&state.cars).await
    }
}

/// A document database.
pub struct Crdt {
    config: EngineConfig,
    clock: CrdtClock,
    loader: Arc<Loader>,
    writes: WriteQueue<DocUpdate, ClockHead>,
    tasks: TaskManager,
    registry: CompactStrategyRegistry,
    forwarder: Mutex<Option<JoinHandle<()>>>,
}

impl Crdt {
    /// Open (or create) the database described by `options`.
    ///
    /// Reloads every CAR the local gateway holds and, with a remote,
    /// pulls the metas already published there.
    pub async fn open(config: EngineConfig, options: CrdtOptions) -> Result<Self> {
        config.validate()?;
        options.registry.get(&config.compaction.strategy)?;

        let codec: Arc<dyn BlockCodec> = if config.encryption.enabled {
            let keybag = options.keybag.unwrap_or_else(KeyBag::memory);
            let keys = keybag.get_named_key(&config.store.name, false)?;
            let key = keys.default_key().ok_or_else(|| {
                Error::ConfigError(format!("no default key for '{}'", config.store.name))
            })?;
            Arc::new(EncryptedCodec::new(
                *key.material(),
                config.encryption.nonce_source()?,
            ))
        } else {
            Arc::new(IdentityCodec)
        };

        let remote = match options.remote {
            Some((gateway, url)) => Some(RemoteStore::open(gateway, &url).await?),
            None => None,
        };
        let loader = Arc::new(Loader::open(options.gateway, &options.url, codec, remote).await?);

        let (store, head) = match loader.load().await? {
            Some(state) => {
                let store = TransactionalBlockStore::with_committed(state.blocks);
                let head = merge_heads(&store, &[], &state.head).await?;
                (store, head)
            }
            None => (TransactionalBlockStore::new(), Vec::new()),
        };
        let store = Arc::new(store);
        let hook: Arc<dyn CommitHook> = loader.clone();
        let clock = CrdtClock::new(store, Some(hook));
        clock.set_head(head);

        let writes = WriteQueue::new(
            Arc::new(CrdtWriter {
                clock: clock.clone(),
            }),
            config.write_queue.chunk_size,
        );
        let tasks = TaskManager::new(
            Arc::new(RemoteMetaHandler {
                loader: loader.clone(),
                clock: clock.clone(),
            }),
            config.tasks.task_manager(),
        );

        let crdt = Self {
            config,
            clock,
            loader,
            writes,
            tasks,
            registry: options.registry,
            forwarder: Mutex::new(None),
        };
        if crdt.loader.has_remote() {
            crdt.connect().await?;
        }
        info!(
            target: "ember::loader",
            name = %crdt.config.store.name,
            head = crdt.clock.head().len(),
            cars = crdt.loader.car_log().len(),
            "Database opened"
        );
        Ok(crdt)
    }

    async fn connect(&self) -> Result<()> {
        if let Some(mut subscription) = self.loader.subscribe_remote().await? {
            let tasks = self.tasks.clone();
            let handle = tokio::spawn(async move {
                while let Some(envelope) = subscription.recv().await {
                    let records = match envelope.into_meta() {
                        Ok(records) => records,
                        Err(e) => {
                            warn!(target: "ember::tasks", error = %e, "Ignoring remote envelope");
                            continue;
                        }
                    };
                    for record in records {
                        match record.to_event().and_then(|event| event.to_block()) {
                            Ok(block) => {
                                if let Err(e) = tasks.handle_event(block).await {
                                    debug!(target: "ember::tasks", error = %e, "Remote meta deferred");
                                }
                            }
                            Err(e) => {
                                warn!(target: "ember::tasks", error = %e, "Ignoring remote meta")
                            }
                        }
                    }
                }
            });
            *self.forwarder.lock() = Some(handle);
        }

        for event in self.loader.remote_metas().await? {
            if let Err(e) = self.tasks.handle_event(event.to_block()?).await {
                warn!(
                    target: "ember::tasks",
                    meta = %event.event_cid,
                    error = %e,
                    "Remote meta retried in background"
                );
            }
        }
        if let Err(e) = self.loader.sync().await {
            warn!(target: "ember::loader", error = %e, "Pending uploads left in the WAL");
        }
        Ok(())
    }

    /// Write one document.
    pub async fn put(&self, id: impl Into<String>, value: Value) -> Result<ClockHead> {
        self.bulk(vec![DocUpdate::put(id, value)]).await
    }

    /// Delete one document.
    pub async fn delete(&self, id: impl Into<String>) -> Result<ClockHead> {
        self.bulk(vec![DocUpdate::delete(id)]).await
    }

    /// Apply `updates` as one transition.
    ///
    /// Returns the head after the write. Triggers compaction once the CAR
    /// log grows past `compaction.auto_compact`.
    pub async fn bulk(&self, updates: Vec<DocUpdate>) -> Result<ClockHead> {
        if updates.is_empty() {
            return Ok(self.clock.head());
        }
        let head = self.writes.bulk(updates).await?;

        let limit = self.config.compaction.auto_compact;
        if limit > 0 && self.loader.car_log().len() > limit {
            self.compact().await?;
        }
        Ok(head)
    }

    /// Current value of a document.
    pub async fn get(&self, id: &str) -> Result<Option<Value>> {
        get_doc(&**self.clock.store(), &self.clock.head(), id).await
    }

    /// Every live document, by id.
    pub async fn all_docs(&self) -> Result<Vec<(String, Value)>> {
        Ok(all_entries(&**self.clock.store(), &self.clock.head())
            .await?
            .into_iter()
            .collect())
    }

    /// Updates since `since`, oldest first, one per document.
    pub async fn changes(&self, since: &[Cid]) -> Result<Vec<DocUpdate>> {
        changes_since(&**self.clock.store(), &self.clock.head(), since).await
    }

    /// Current head.
    pub fn head(&self) -> ClockHead {
        self.clock.head()
    }

    /// Stream of applied updates.
    pub fn subscribe(&self) -> broadcast::Receiver<Vec<DocUpdate>> {
        self.clock.subscribe()
    }

    /// Compact with the configured strategy.
    pub async fn compact(&self) -> Result<CompactionReport> {
        let strategy = self.config.compaction.strategy.clone();
        self.compact_with(&strategy).await
    }

    /// Compact with the strategy registered as `name`.
    pub async fn compact_with(&self, name: &str) -> Result<CompactionReport> {
        let strategy = self.registry.get(name)?;
        let _exclusive = self.clock.exclusive().await;
        let head = self.clock.head();
        let last_meta = (!head.is_empty()).then(|| TransactionMeta::new(head.clone()));
        compaction::compact(
            &*strategy,
            self.clock.store(),
            head,
            last_meta,
            Some(&*self.loader),
        )
        .await
    }

    /// Store a standalone file; see [`Loader::put_file`].
    pub async fn put_file(&self, bytes: Vec<u8>, public: bool) -> Result<Cid> {
        self.loader.put_file(bytes, public).await
    }

    /// Read a file stored with [`Crdt::put_file`].
    pub async fn get_file(&self, cid: &Cid) -> Result<Vec<u8>> {
        self.loader.get_file(cid).await
    }

    /// Retry pending remote uploads.
    pub async fn sync_remote(&self) -> Result<usize> {
        self.loader.sync().await
    }

    /// Number of remote events waiting for a retry.
    pub fn pending_remote(&self) -> usize {
        self.tasks.size()
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The block store.
    pub fn store(&self) -> &Arc<TransactionalBlockStore> {
        self.clock.store()
    }

    /// The loader.
    pub fn loader(&self) -> &Arc<Loader> {
        &self.loader
    }

    /// Drain outstanding writes and stop listening to the remote.
    pub async fn close(&self) {
        self.writes.close().await;
        if let Some(handle) = self.forwarder.lock().take() {
            handle.abort();
        }
        debug!(target: "ember::loader", name = %self.config.store.name, "Database closed");
    }
}

impl Drop for Crdt {
    fn drop(&mut self) {
        if let Some(handle) = self.forwarder.lock().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn open(name: &str) -> Crdt {
        Crdt::open(EngineConfig::default(), CrdtOptions::memory(name).unwrap())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let db = open("basic").await;
        db.put("a", json!({"hello": "world"})).await.unwrap();
        assert_eq!(db.get("a").await.unwrap(), Some(json!({"hello": "world"})));

        db.delete("a").await.unwrap();
        assert_eq!(db.get("a").await.unwrap(), None);
        assert_eq!(db.head().len(), 1);
    }

    #[tokio::test]
    async fn test_bulk_is_one_event() {
        let db = open("bulk").await;
        db.bulk(vec![
            DocUpdate::put("x", json!(1)),
            DocUpdate::put("y", json!(2)),
        ])
        .await
        .unwrap();
        assert_eq!(db.loader().car_log().len(), 1);
        assert_eq!(db.all_docs().await.unwrap().len(), 2);
        assert_eq!(db.changes(&[]).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_changes_since_head() {
        let db = open("changes").await;
        let first = db.put("one", json!(1)).await.unwrap();
        db.put("two", json!(2)).await.unwrap();
        assert_eq!(
            db.changes(&first).await.unwrap(),
            vec![DocUpdate::put("two", json!(2))]
        );
    }

    #[tokio::test]
    async fn test_empty_bulk_is_noop() {
        let db = open("empty").await;
        assert!(db.bulk(Vec::new()).await.unwrap().is_empty());
        assert!(db.loader().car_log().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_strategy_rejected_at_open() {
        let mut config = EngineConfig::default();
        config.compaction.strategy = "vacuum".to_string();
        let result = Crdt::open(config, CrdtOptions::memory("bad").unwrap()).await;
        assert!(matches!(result, Err(Error::InvalidOperation(_))));
    }

    #[tokio::test]
    async fn test_auto_compact() {
        let mut config = EngineConfig::default();
        config.compaction.auto_compact = 2;
        let db = Crdt::open(config, CrdtOptions::memory("auto").unwrap())
            .await
            .unwrap();
        for i in 0..3 {
            db.put(format!("doc-{}", i), json!(i)).await.unwrap();
        }
        assert_eq!(db.loader().car_log().len(), 1);
        assert_eq!(db.all_docs().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_subscribe_sees_writes() {
        let db = open("watch").await;
        let mut rx = db.subscribe();
        db.put("w", json!("v")).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), vec![DocUpdate::put("w", json!("v"))]);
    }
}
