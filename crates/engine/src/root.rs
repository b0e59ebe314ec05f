//! CRDT root materialization
//!
//! Each CRDT event carries `{delta: Cid}` pointing at a delta block that
//! holds the event's `[DocUpdate]`. Folding every delta in clock order gives
//! the document state; the state is encoded as one entry block per live
//! document plus a root-node block `{entries: {id -> entry cid}}`.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use ember_core::{Block, Cid, ClockHead, DocUpdate, Result};
use ember_storage::{require_block, BlockFetcher};

use crate::clock::{advance, sorted_events_since, EventBlock};

/// Payload of a CRDT event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrdtEntry {
    /// Delta block holding the event's updates
    pub delta: Cid,
}

/// A CRDT clock event.
pub type CrdtEvent = EventBlock<CrdtEntry>;

#[derive(Debug, Serialize, Deserialize)]
struct DocEntry {
    id: String,
    value: Value,
}

/// Root-node block body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootNode {
    /// Live document ids mapped to their entry blocks
    pub entries: BTreeMap<String, Cid>,
}

/// Blocks produced by [`root`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootResult {
    /// Root-node block CID
    pub root: Cid,
    /// State blocks not present in the prior root
    pub additions: Vec<Block>,
    /// Blocks of the prior root no longer referenced
    pub removals: Vec<Block>,
}

/// Blocks for one local write: the delta block and the event block.
///
/// Returns the blocks and the event CID.
pub fn write_event(parents: &[Cid], updates: &[DocUpdate]) -> Result<(Vec<Block>, Cid)> {
    let delta = Block::encode(&updates)?;
    let event = CrdtEvent::create(CrdtEntry { delta: delta.cid }, parents.to_vec())?;
    let cid = event.cid;
    Ok((vec![delta, event], cid))
}

/// Updates of every event reachable from `head` and not from `since`, in
/// clock order.
async fn updates_since<F: BlockFetcher + ?Sized>(
    fetcher: &F,
    head: &[Cid],
    since: &[Cid],
) -> Result<Vec<DocUpdate>> {
    let mut updates = Vec::new();
    for link in sorted_events_since(fetcher, head, since).await? {
        let event: CrdtEvent = require_block(fetcher, &link.cid).await?.decode()?;
        let delta: Vec<DocUpdate> = require_block(fetcher, &event.data.delta).await?.decode()?;
        updates.extend(delta);
    }
    Ok(updates)
}

/// Document state at `head`.
pub async fn all_entries<F: BlockFetcher + ?Sized>(
    fetcher: &F,
    head: &[Cid],
) -> Result<BTreeMap<String, Value>> {
    let mut state = BTreeMap::new();
    for update in updates_since(fetcher, head, &[]).await? {
        match update.value {
            Some(value) => {
                state.insert(update.id, value);
            }
            None => {
                state.remove(&update.id);
            }
        }
    }
    Ok(state)
}

/// One document at `head`.
pub async fn get_doc<F: BlockFetcher + ?Sized>(
    fetcher: &F,
    head: &[Cid],
    id: &str,
) -> Result<Option<Value>> {
    Ok(all_entries(fetcher, head).await?.remove(id))
}

/// Materialize the state at `head` and diff it against `prior`.
///
/// With no prior root, or a prior root block the fetcher no longer holds,
/// every state block is an addition.
pub async fn root<F: BlockFetcher + ?Sized>(
    fetcher: &F,
    head: &[Cid],
    prior: Option<&Cid>,
) -> Result<RootResult> {
    let state = all_entries(fetcher, head).await?;

    let mut blocks = Vec::with_capacity(state.len() + 1);
    let mut node = RootNode::default();
    for (id, value) in state {
        let entry = Block::encode(&DocEntry {
            id: id.clone(),
            value,
        })?;
        node.entries.insert(id, entry.cid);
        blocks.push(entry);
    }
    let root_block = Block::encode(&node)?;
    let root_cid = root_block.cid;
    blocks.push(root_block);

    let prior_node = match prior {
        Some(cid) => match fetcher.get_block(cid).await? {
            Some(block) => Some((*cid, block.decode::<RootNode>()?)),
            None => None,
        },
        None => None,
    };
    let Some((prior_cid, prior_node)) = prior_node else {
        return Ok(RootResult {
            root: root_cid,
            additions: blocks,
            removals: Vec::new(),
        });
    };

    let previous: HashSet<Cid> = prior_node
        .entries
        .values()
        .copied()
        .chain(std::iter::once(prior_cid))
        .collect();
    let current: HashSet<Cid> = blocks.iter().map(|b| b.cid).collect();

    let mut removals = Vec::new();
    for cid in previous.iter().filter(|c| !current.contains(*c)) {
        if let Some(block) = fetcher.get_block(cid).await? {
            removals.push(block);
        }
    }
    removals.sort_by_key(|b| b.cid);

    Ok(RootResult {
        root: root_cid,
        additions: blocks
            .into_iter()
            .filter(|b| !previous.contains(&b.cid))
            .collect(),
        removals,
    })
}

/// Updates introduced by events reachable from `head` but not from `since`.
///
/// Oldest first; a document updated more than once appears once, at the
/// position of its last update, with that update's value.
pub async fn changes_since<F: BlockFetcher + ?Sized>(
    fetcher: &F,
    head: &[Cid],
    since: &[Cid],
) -> Result<Vec<DocUpdate>> {
    let updates = updates_since(fetcher, head, since).await?;
    let mut seen = HashSet::new();
    let mut latest: Vec<DocUpdate> = updates
        .into_iter()
        .rev()
        .filter(|u| seen.insert(u.id.clone()))
        .collect();
    latest.reverse();
    Ok(latest)
}

/// Advance `head` by every CID of `events`, in order.
pub async fn merge_heads<F: BlockFetcher + ?Sized>(
    fetcher: &F,
    head: &[Cid],
    events: &[Cid],
) -> Result<ClockHead> {
    let mut merged = head.to_vec();
    for cid in events {
        merged = advance(fetcher, &merged, *cid).await?;
    }
    Ok(merged)
}
