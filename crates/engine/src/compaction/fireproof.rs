//! Incremental compaction
//!
//! Re-reads everything reachable from the head through the logging
//! context, so the compacted set is exactly the live clock plus a freshly
//! materialized root.

use async_trait::async_trait;
use tracing::debug;

use ember_core::{Result, TransactionMeta};
use ember_storage::require_block;

use super::{CompactStrategy, CompactionContext};
use crate::clock::vis;
use crate::root::{all_entries, changes_since, root};

/// The `"fireproof"` strategy.
#[derive(Debug, Clone, Copy, Default)]
pub struct FireproofStrategy;

#[async_trait]
impl CompactStrategy for FireproofStrategy {
    fn name(&self) -> &str {
        "fireproof"
    }

    async fn compact(&self, ctx: &CompactionContext<'_>) -> Result<TransactionMeta> {
        let head = ctx.head();
        for cid in head {
            require_block(ctx, cid).await?;
        }

        let entries = all_entries(ctx, head).await?;
        let trace = vis(ctx, head).await?;

        let result = root(ctx, head, None).await?;
        for block in result.additions.into_iter().chain(result.removals) {
            ctx.log(block);
        }
        let changes = changes_since(ctx, head, &[]).await?;

        debug!(
            target: "ember::compaction",
            docs = entries.len(),
            trace = trace.len(),
            changes = changes.len(),
            logged = ctx.logged_len(),
            "Clock walked"
        );
        Ok(TransactionMeta::new(head.to_vec()))
    }
}
