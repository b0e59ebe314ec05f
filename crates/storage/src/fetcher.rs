//! Async block lookup seam
//!
//! The clock, root materialization and compaction read blocks only through
//! [`BlockFetcher`], so they work against the transactional store, a
//! logging wrapper, or a loader that reaches out to a gateway.

use std::sync::Arc;

use async_trait::async_trait;
use ember_core::{Block, Cid, Error, Result};

/// Something that can resolve a CID to a block.
#[async_trait]
pub trait BlockFetcher: Send + Sync {
    /// Fetch a block. `Ok(None)` means the block is not available.
    async fn get_block(&self, cid: &Cid) -> Result<Option<Block>>;
}

#[async_trait]
impl<T: BlockFetcher + ?Sized> BlockFetcher for Arc<T> {
    async fn get_block(&self, cid: &Cid) -> Result<Option<Block>> {
        (**self).get_block(cid).await
    }
}

#[async_trait]
impl<T: BlockFetcher + ?Sized> BlockFetcher for &T {
    async fn get_block(&self, cid: &Cid) -> Result<Option<Block>> {
        (**self).get_block(cid).await
    }
}

/// Fetch a block that must exist.
///
/// # Errors
///
/// `Error::MissingBlock(cid)` if the fetcher has no such block.
pub async fn require_block<F: BlockFetcher + ?Sized>(fetcher: &F, cid: &Cid) -> Result<Block> {
    fetcher
        .get_block(cid)
        .await?
        .ok_or(Error::MissingBlock(*cid))
}
