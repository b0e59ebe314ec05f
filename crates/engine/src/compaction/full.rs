//! Full compaction: re-emit every block the store holds.

use async_trait::async_trait;

use ember_core::{Error, Result, TransactionMeta};

use super::{CompactStrategy, CompactionContext};

/// The `"full"` strategy.
#[derive(Debug, Clone, Copy, Default)]
pub struct FullStrategy;

#[async_trait]
impl CompactStrategy for FullStrategy {
    fn name(&self) -> &str {
        "full"
    }

    async fn compact(&self, ctx: &CompactionContext<'_>) -> Result<TransactionMeta> {
        let meta = ctx.last_meta().cloned().ok_or_else(|| {
            Error::InvalidOperation("full compaction needs a committed transaction".into())
        })?;
        let store = ctx.store();
        for block in store.committed_entries() {
            ctx.log(block);
        }
        for block in store.pending_entries() {
            ctx.log(block);
        }
        Ok(meta)
    }
}
