//! No-op compaction.

use async_trait::async_trait;

use ember_core::{Result, TransactionMeta};

use super::{CompactStrategy, CompactionContext};

/// The `"no-op"` strategy: no I/O, empty meta.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopStrategy;

#[async_trait]
impl CompactStrategy for NoopStrategy {
    fn name(&self) -> &str {
        "no-op"
    }

    async fn compact(&self, _ctx: &CompactionContext<'_>) -> Result<TransactionMeta> {
        Ok(TransactionMeta::default())
    }
}
