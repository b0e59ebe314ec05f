//! TransactionalBlockStore: content-addressed blocks with an uncommitted overlay
//!
//! The store keeps two ownership-disjoint maps:
//! - `pending`: blocks written since the last `begin()`, not yet committed
//! - `committed`: durable blocks
//!
//! Reads check `pending` first, then `committed`.
//!
//! # Design Notes
//!
//! - **Sole guard**: `begin()` fails while `pending` holds blocks. Concurrent
//!   begins are not queued; callers serialize begin/commit/rollback (the
//!   apply-head queue does this for CRDT writes).
//! - **Commit never removes**: commit only moves pending entries into
//!   committed. The only way committed blocks disappear is
//!   [`TransactionalBlockStore::replace_committed`], used by compaction.
//! - **No tombstones**: `get` cannot distinguish "never written" from
//!   "compacted away"; both return `None`.

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, error};

use ember_core::{Block, Cid, Error, Result};

use crate::fetcher::BlockFetcher;

#[derive(Debug, Default)]
struct Overlay {
    pending: BTreeMap<Cid, Vec<u8>>,
    committed: BTreeMap<Cid, Vec<u8>>,
}

/// Content-addressed block store with a single pending transaction overlay
///
/// Thread-safe through `parking_lot::RwLock`; the lock is never held across
/// an `.await`.
#[derive(Debug, Default)]
pub struct TransactionalBlockStore {
    overlay: RwLock<Overlay>,
}

impl TransactionalBlockStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store whose committed map already holds `blocks`
    pub fn with_committed(blocks: impl IntoIterator<Item = Block>) -> Self {
        let committed = blocks.into_iter().map(|b| (b.cid, b.bytes)).collect();
        Self {
            overlay: RwLock::new(Overlay {
                pending: BTreeMap::new(),
                committed,
            }),
        }
    }

    /// Open a transaction
    ///
    /// # Errors
    ///
    /// Returns `Error::TransactionInProgress` if the pending overlay is
    /// non-empty.
    pub fn begin(&self) -> Result<()> {
        let overlay = self.overlay.read();
        if !overlay.pending.is_empty() {
            let pending = overlay.pending.len();
            error!(target: "ember::store", pending, "begin() while a transaction is open");
            return Err(Error::TransactionInProgress { pending });
        }
        debug!(target: "ember::store", "Transaction opened");
        Ok(())
    }

    /// Write a block into the pending overlay
    pub fn put(&self, cid: Cid, bytes: Vec<u8>) {
        self.overlay.write().pending.insert(cid, bytes);
    }

    /// Write a whole block into the pending overlay
    pub fn put_block(&self, block: Block) {
        self.put(block.cid, block.bytes);
    }

    /// Read a block, pending first
    pub fn get(&self, cid: &Cid) -> Option<Block> {
        let overlay = self.overlay.read();
        overlay
            .pending
            .get(cid)
            .or_else(|| overlay.committed.get(cid))
            .map(|bytes| Block::new(*cid, bytes.clone()))
    }

    /// True if `cid` is readable
    pub fn contains(&self, cid: &Cid) -> bool {
        let overlay = self.overlay.read();
        overlay.pending.contains_key(cid) || overlay.committed.contains_key(cid)
    }

    /// Iterate every readable block: pending first, then committed
    ///
    /// Each call takes a fresh snapshot, so the sequence is restartable.
    pub fn entries(&self) -> Entries {
        let overlay = self.overlay.read();
        let mut blocks = Vec::with_capacity(overlay.pending.len() + overlay.committed.len());
        for (cid, bytes) in &overlay.pending {
            blocks.push(Block::new(*cid, bytes.clone()));
        }
        for (cid, bytes) in &overlay.committed {
            if !overlay.pending.contains_key(cid) {
                blocks.push(Block::new(*cid, bytes.clone()));
            }
        }
        Entries {
            blocks: blocks.into_iter(),
        }
    }

    /// Snapshot of the blocks in the pending overlay
    pub fn pending_entries(&self) -> Vec<Block> {
        self.overlay
            .read()
            .pending
            .iter()
            .map(|(cid, bytes)| Block::new(*cid, bytes.clone()))
            .collect()
    }

    /// Snapshot of the committed blocks
    pub fn committed_entries(&self) -> Vec<Block> {
        self.overlay
            .read()
            .committed
            .iter()
            .map(|(cid, bytes)| Block::new(*cid, bytes.clone()))
            .collect()
    }

    /// Move every pending block into committed
    ///
    /// Returns the blocks that made up the transaction.
    pub fn commit(&self) -> Vec<Block> {
        let mut overlay = self.overlay.write();
        let pending = std::mem::take(&mut overlay.pending);
        let mut blocks = Vec::with_capacity(pending.len());
        for (cid, bytes) in pending {
            blocks.push(Block::new(cid, bytes.clone()));
            overlay.committed.insert(cid, bytes);
        }
        debug!(target: "ember::store", blocks = blocks.len(), "Transaction committed");
        blocks
    }

    /// Discard the pending overlay
    pub fn rollback(&self) {
        let mut overlay = self.overlay.write();
        let dropped = overlay.pending.len();
        overlay.pending.clear();
        debug!(target: "ember::store", dropped, "Transaction rolled back");
    }

    /// Replace the committed map with a compacted block set
    ///
    /// Pending blocks are untouched.
    pub fn replace_committed(&self, blocks: impl IntoIterator<Item = Block>) {
        let mut overlay = self.overlay.write();
        let before = overlay.committed.len();
        overlay.committed = blocks.into_iter().map(|b| (b.cid, b.bytes)).collect();
        debug!(
            target: "ember::store",
            before,
            after = overlay.committed.len(),
            "Committed blocks replaced"
        );
    }

    /// Number of readable blocks
    pub fn len(&self) -> usize {
        let overlay = self.overlay.read();
        overlay.committed.len()
            + overlay
                .pending
                .keys()
                .filter(|cid| !overlay.committed.contains_key(cid))
                .count()
    }

    /// True if no block is readable
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of uncommitted blocks
    pub fn pending_len(&self) -> usize {
        self.overlay.read().pending.len()
    }

    /// True while the pending overlay holds blocks
    pub fn has_pending(&self) -> bool {
        !self.overlay.read().pending.is_empty()
    }
}

#[async_trait]
impl BlockFetcher for TransactionalBlockStore {
    async fn get_block(&self, cid: &Cid) -> Result<Option<Block>> {
        Ok(self.get(cid))
    }
}

/// Snapshot iterator returned by [`TransactionalBlockStore::entries`]
#[derive(Debug)]
pub struct Entries {
    blocks: std::vec::IntoIter<Block>,
}

impl Iterator for Entries {
    type Item = Block;

    fn next(&mut self) -> Option<Block> {
        self.blocks.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.blocks.size_hint()
    }
}

impl ExactSizeIterator for Entries {}

#[cfg(test)]
mod tests {
    use super::*;

    fn cids(store: &TransactionalBlockStore) -> Vec<Cid> {
        store.entries().map(|b| b.cid).collect()
    }

    #[test]
    fn test_put_get_pending() {
        let store = TransactionalBlockStore::new();
        store.begin().unwrap();
        let block = Block::raw(b"hello".to_vec());
        store.put(block.cid, block.bytes.clone());
        assert_eq!(store.get(&block.cid), Some(block.clone()));
        assert!(store.has_pending());
    }

    #[test]
    fn test_commit_then_get() {
        let store = TransactionalBlockStore::new();
        let a = Block::raw(b"hello".to_vec());
        store.begin().unwrap();
        store.put_block(a.clone());
        let committed = store.commit();
        assert_eq!(committed, vec![a.clone()]);
        assert_eq!(store.get(&a.cid), Some(a));
        assert!(!store.has_pending());
    }

    #[test]
    fn test_rollback_discards_pending_only() {
        let store = TransactionalBlockStore::new();
        let a = Block::raw(b"hello".to_vec());
        let b = Block::raw(b"world".to_vec());

        store.begin().unwrap();
        store.put_block(a.clone());
        store.commit();

        store.begin().unwrap();
        store.put_block(b.clone());
        store.rollback();

        assert_eq!(cids(&store), vec![a.cid]);
        assert!(store.get(&b.cid).is_none());
        assert_eq!(store.get(&a.cid), Some(a));
    }

    #[test]
    fn test_second_begin_fails_with_pending() {
        let store = TransactionalBlockStore::new();
        store.begin().unwrap();
        store.put_block(Block::raw(b"x".to_vec()));
        let err = store.begin().unwrap_err();
        assert!(matches!(err, Error::TransactionInProgress { pending: 1 }));
    }

    #[test]
    fn test_begin_on_empty_overlay_succeeds() {
        let store = TransactionalBlockStore::new();
        store.begin().unwrap();
        store.begin().unwrap();
    }

    #[test]
    fn test_entries_pending_first_and_deduplicated() {
        let store = TransactionalBlockStore::new();
        let a = Block::raw(b"a".to_vec());
        let b = Block::raw(b"b".to_vec());
        store.begin().unwrap();
        store.put_block(a.clone());
        store.commit();

        store.begin().unwrap();
        store.put_block(b.clone());
        store.put_block(a.clone());

        let seen = cids(&store);
        assert_eq!(seen.len(), 2);
        // pending (a, b in cid order) come before committed-only entries
        assert!(seen.contains(&a.cid) && seen.contains(&b.cid));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_entries_is_restartable() {
        let store = TransactionalBlockStore::new();
        store.put_block(Block::raw(b"1".to_vec()));
        store.put_block(Block::raw(b"2".to_vec()));
        let first: Vec<_> = store.entries().collect();
        let second: Vec<_> = store.entries().collect();
        assert_eq!(first, second);
        assert_eq!(store.entries().len(), 2);
    }

    #[test]
    fn test_replace_committed_keeps_pending() {
        let store = TransactionalBlockStore::new();
        let keep = Block::raw(b"keep".to_vec());
        let drop = Block::raw(b"drop".to_vec());
        let inflight = Block::raw(b"inflight".to_vec());
        store.put_block(keep.clone());
        store.put_block(drop.clone());
        store.commit();
        store.put_block(inflight.clone());

        store.replace_committed(vec![keep.clone()]);

        assert!(store.contains(&keep.cid));
        assert!(!store.contains(&drop.cid));
        assert!(store.contains(&inflight.cid));
    }

    #[tokio::test]
    async fn test_block_fetcher_reads_overlay() {
        let store = TransactionalBlockStore::new();
        let a = Block::raw(b"fetch".to_vec());
        store.put_block(a.clone());
        assert_eq!(store.get_block(&a.cid).await.unwrap(), Some(a));
    }
}
