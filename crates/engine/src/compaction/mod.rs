//! Compaction
//!
//! Rewrites the block log so it keeps only what a strategy touched.
//!
//! # Algorithm
//!
//! 1. Build a [`CompactionContext`] over the store and the current head
//! 2. Run the selected [`CompactStrategy`]; every block it fetches through
//!    the context, and every block it logs explicitly, lands in the
//!    compacted set
//! 3. If the set is empty, stop: storage is left untouched
//! 4. Otherwise swap the committed map for the compacted set and hand it to
//!    the loader, which replaces its CAR log with a single CAR
//!
//! # Safety
//!
//! - Any strategy error aborts the run before anything is replaced
//! - Callers hold off head application for the duration, so no transaction
//!   is pending while the committed map is swapped

mod fireproof;
mod full;
mod noop;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info};

use ember_core::{Block, Cid, ClockHead, Error, Result, TransactionMeta};
use ember_storage::{BlockFetcher, TransactionalBlockStore};

use crate::loader::Loader;

pub use fireproof::FireproofStrategy;
pub use full::FullStrategy;
pub use noop::NoopStrategy;

/// Everything a strategy may read, plus the compacted set it writes.
pub struct CompactionContext<'a> {
    head: ClockHead,
    last_meta: Option<TransactionMeta>,
    store: &'a TransactionalBlockStore,
    logged: Mutex<BTreeMap<Cid, Block>>,
}

impl<'a> CompactionContext<'a> {
    /// Context over `store` at `head`.
    ///
    /// `last_meta` is the meta of the newest transaction, `None` when the
    /// store has never committed one.
    pub fn new(
        store: &'a TransactionalBlockStore,
        head: ClockHead,
        last_meta: Option<TransactionMeta>,
    ) -> Self {
        Self {
            head,
            last_meta,
            store,
            logged: Mutex::new(BTreeMap::new()),
        }
    }

    /// Head being compacted.
    pub fn head(&self) -> &[Cid] {
        &self.head
    }

    /// Meta of the newest transaction.
    pub fn last_meta(&self) -> Option<&TransactionMeta> {
        self.last_meta.as_ref()
    }

    /// The underlying store, for strategies that read it wholesale.
    ///
    /// Blocks read this way are not logged.
    pub fn store(&self) -> &TransactionalBlockStore {
        self.store
    }

    /// Add a block to the compacted set.
    pub fn log(&self, block: Block) {
        self.logged.lock().insert(block.cid, block);
    }

    /// Number of blocks logged so far.
    pub fn logged_len(&self) -> usize {
        self.logged.lock().len()
    }

    /// The compacted set, in CID order.
    pub fn into_logged(self) -> Vec<Block> {
        self.logged.into_inner().into_values().collect()
    }
}

#[async_trait]
impl BlockFetcher for CompactionContext<'_> {
    async fn get_block(&self, cid: &Cid) -> Result<Option<Block>> {
        let block = self.store.get(cid);
        if let Some(block) = &block {
            self.log(block.clone());
        }
        Ok(block)
    }
}

/// A compaction strategy.
#[async_trait]
pub trait CompactStrategy: Send + Sync {
    /// Registry name.
    fn name(&self) -> &str;

    /// Populate the compacted set and return the meta it makes durable.
    async fn compact(&self, ctx: &CompactionContext<'_>) -> Result<TransactionMeta>;
}

/// Name-keyed table of compaction strategies.
///
/// Names are matched case-insensitively. The default registry holds
/// `"fireproof"`, `"full"` and `"no-op"`.
#[derive(Clone)]
pub struct CompactStrategyRegistry {
    strategies: BTreeMap<String, Arc<dyn CompactStrategy>>,
}

impl CompactStrategyRegistry {
    /// Registry with no strategies.
    pub fn empty() -> Self {
        Self {
            strategies: BTreeMap::new(),
        }
    }

    /// Add a strategy.
    ///
    /// # Errors
    ///
    /// `InvalidOperation` if a strategy with the same name exists.
    pub fn register(&mut self, strategy: Arc<dyn CompactStrategy>) -> Result<()> {
        let name = strategy.name().to_lowercase();
        if self.strategies.contains_key(&name) {
            return Err(Error::InvalidOperation(format!(
                "compaction strategy '{}' is already registered",
                name
            )));
        }
        self.strategies.insert(name, strategy);
        Ok(())
    }

    /// Remove a strategy, returning it.
    pub fn unregister(&mut self, name: &str) -> Option<Arc<dyn CompactStrategy>> {
        self.strategies.remove(&name.to_lowercase())
    }

    /// Look up a strategy.
    ///
    /// # Errors
    ///
    /// `InvalidOperation` for an unknown name.
    pub fn get(&self, name: &str) -> Result<Arc<dyn CompactStrategy>> {
        self.strategies
            .get(&name.to_lowercase())
            .cloned()
            .ok_or_else(|| {
                Error::InvalidOperation(format!("unknown compaction strategy '{}'", name))
            })
    }

    /// True if `name` is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.strategies.contains_key(&name.to_lowercase())
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        self.strategies.keys().cloned().collect()
    }
}

impl Default for CompactStrategyRegistry {
    fn default() -> Self {
        let mut strategies: BTreeMap<String, Arc<dyn CompactStrategy>> = BTreeMap::new();
        for strategy in [
            Arc::new(FireproofStrategy) as Arc<dyn CompactStrategy>,
            Arc::new(FullStrategy),
            Arc::new(NoopStrategy),
        ] {
            strategies.insert(strategy.name().to_string(), strategy);
        }
        Self { strategies }
    }
}

impl std::fmt::Debug for CompactStrategyRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompactStrategyRegistry")
            .field("strategies", &self.names())
            .finish()
    }
}

/// Outcome of one compaction run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionReport {
    /// Strategy name
    pub strategy: String,
    /// Meta returned by the strategy
    pub meta: TransactionMeta,
    /// Committed blocks before the run
    pub blocks_before: usize,
    /// Committed blocks after the run
    pub blocks_after: usize,
    /// False when the strategy logged nothing and storage was left alone
    pub replaced: bool,
    /// Wall time
    pub duration_ms: u64,
}

impl CompactionReport {
    /// Blocks dropped by the run.
    pub fn reclaimed(&self) -> usize {
        self.blocks_before.saturating_sub(self.blocks_after)
    }
}

/// Run `strategy` against `store` at `head`.
///
/// With a loader, the compacted set also replaces its CAR log.
pub async fn compact(
    strategy: &dyn CompactStrategy,
    store: &TransactionalBlockStore,
    head: ClockHead,
    last_meta: Option<TransactionMeta>,
    loader: Option<&Loader>,
) -> Result<CompactionReport> {
    let start = Instant::now();
    let blocks_before = store.len();
    info!(
        target: "ember::compaction",
        strategy = strategy.name(),
        blocks = blocks_before,
        "Compaction started"
    );

    let ctx = CompactionContext::new(store, head, last_meta);
    let meta = strategy.compact(&ctx).await?;

    let replaced = ctx.logged_len() > 0;
    if replaced {
        let logged = ctx.into_logged();
        if let Some(loader) = loader {
            loader.compacted(&logged, &meta).await?;
        }
        store.replace_committed(logged);
    } else {
        debug!(target: "ember::compaction", strategy = strategy.name(), "Nothing logged");
    }

    let report = CompactionReport {
        strategy: strategy.name().to_string(),
        meta,
        blocks_before,
        blocks_after: store.len(),
        replaced,
        duration_ms: start.elapsed().as_millis() as u64,
    };
    info!(
        target: "ember::compaction",
        strategy = %report.strategy,
        blocks_before = report.blocks_before,
        blocks_after = report.blocks_after,
        duration_ms = report.duration_ms,
        "Compaction finished"
    );
    Ok(report)
}
