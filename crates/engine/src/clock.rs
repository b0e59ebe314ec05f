//! Merkle clock
//!
//! Events are structured blocks `{parents, data}` linked into a DAG by their
//! parent CIDs. A head is the sorted set of events with no known children.
//!
//! All traversal goes through a [`BlockFetcher`]; a block that cannot be
//! fetched fails with `Error::MissingBlock`.
//!
//! # Ordering
//!
//! Where a total order over events is needed (root materialization, change
//! feeds, common ancestors) events are sorted topologically, parents first,
//! with ties broken by CID order. The order depends only on the set of
//! events, never on the order in which they were merged.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use ember_core::{sort_head, Block, Cid, ClockHead, Result};
use ember_storage::{require_block, BlockFetcher};

/// A clock event: parents plus a payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventBlock<T> {
    /// Events this one causally follows
    pub parents: Vec<Cid>,
    /// Event payload
    pub data: T,
}

impl<T: Serialize> EventBlock<T> {
    /// Event over `parents` (sorted) carrying `data`.
    pub fn new(data: T, parents: Vec<Cid>) -> Self {
        Self {
            parents: sort_head(parents),
            data,
        }
    }

    /// Encode as a structured block.
    pub fn to_block(&self) -> Result<Block> {
        Block::encode(self)
    }

    /// Build and encode an event in one step.
    pub fn create(data: T, parents: Vec<Cid>) -> Result<Block> {
        Self::new(data, parents).to_block()
    }
}

impl<T: DeserializeOwned> EventBlock<T> {
    /// Decode an event block.
    pub fn decode(block: &Block) -> Result<Self> {
        block.decode()
    }
}

#[derive(Deserialize)]
struct EventHeader {
    #[serde(default)]
    parents: Vec<Cid>,
}

/// An event's identity and parents, without its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventLink {
    /// Event CID
    pub cid: Cid,
    /// Parent CIDs
    pub parents: Vec<Cid>,
}

/// Fetch an event and read its parents.
pub async fn fetch_event<F: BlockFetcher + ?Sized>(fetcher: &F, cid: &Cid) -> Result<EventLink> {
    let block = require_block(fetcher, cid).await?;
    let header: EventHeader = block.decode()?;
    Ok(EventLink {
        cid: *cid,
        parents: header.parents,
    })
}

/// Advance `head` by `event`.
///
/// - an event already in the head leaves it unchanged
/// - head members the event descends from are replaced by the event
/// - an event some head member already descends from leaves it unchanged
/// - otherwise the event joins the head
///
/// The result is sorted, so advancing by the same events in any order
/// yields the same head.
pub async fn advance<F: BlockFetcher + ?Sized>(
    fetcher: &F,
    head: &[Cid],
    event: Cid,
) -> Result<ClockHead> {
    if head.contains(&event) {
        return Ok(sort_head(head.to_vec()));
    }

    let link = fetch_event(fetcher, &event).await?;
    for parent in &link.parents {
        require_block(fetcher, parent).await?;
    }

    let mut kept = Vec::with_capacity(head.len() + 1);
    let mut replaced = false;
    for member in head {
        if contains(fetcher, &event, member).await? {
            replaced = true;
        } else {
            kept.push(*member);
        }
    }
    if replaced {
        kept.push(event);
        debug!(target: "ember::clock", event = %event, head = kept.len(), "Head advanced");
        return Ok(sort_head(kept));
    }

    for member in head {
        if contains(fetcher, member, &event).await? {
            return Ok(sort_head(head.to_vec()));
        }
    }

    let mut next = head.to_vec();
    next.push(event);
    debug!(target: "ember::clock", event = %event, head = next.len(), "Head forked");
    Ok(sort_head(next))
}

/// True if `b` is `a` or one of its ancestors.
pub async fn contains<F: BlockFetcher + ?Sized>(fetcher: &F, a: &Cid, b: &Cid) -> Result<bool> {
    if a == b {
        return Ok(true);
    }
    let mut seen = HashSet::new();
    let mut queue = VecDeque::from([*a]);
    while let Some(cid) = queue.pop_front() {
        let link = fetch_event(fetcher, &cid).await?;
        for parent in link.parents {
            if parent == *b {
                return Ok(true);
            }
            if seen.insert(parent) {
                queue.push_back(parent);
            }
        }
    }
    Ok(false)
}

/// Every event reachable from `roots` (inclusive), mapped to its parents.
///
/// Traversal stops at any CID in `stop`.
pub async fn collect_events<F: BlockFetcher + ?Sized>(
    fetcher: &F,
    roots: &[Cid],
    stop: &HashSet<Cid>,
) -> Result<HashMap<Cid, Vec<Cid>>> {
    let mut events = HashMap::new();
    let mut queue: VecDeque<Cid> = roots.iter().filter(|c| !stop.contains(*c)).copied().collect();
    while let Some(cid) = queue.pop_front() {
        if events.contains_key(&cid) {
            continue;
        }
        let link = fetch_event(fetcher, &cid).await?;
        for parent in &link.parents {
            if !stop.contains(parent) && !events.contains_key(parent) {
                queue.push_back(*parent);
            }
        }
        events.insert(cid, link.parents);
    }
    Ok(events)
}

/// Topological order of `events`, parents first, ties by CID.
///
/// Parents outside the map are ignored.
pub fn topological_order(events: &HashMap<Cid, Vec<Cid>>) -> Vec<Cid> {
    let mut pending: BTreeMap<Cid, usize> = BTreeMap::new();
    let mut children: HashMap<Cid, Vec<Cid>> = HashMap::new();
    for (cid, parents) in events {
        let known: BTreeSet<&Cid> = parents.iter().filter(|p| events.contains_key(*p)).collect();
        pending.insert(*cid, known.len());
        for parent in known {
            children.entry(*parent).or_default().push(*cid);
        }
    }

    let mut ready: BTreeSet<Cid> = pending
        .iter()
        .filter(|(_, n)| **n == 0)
        .map(|(cid, _)| *cid)
        .collect();
    let mut order = Vec::with_capacity(events.len());
    while let Some(cid) = ready.pop_first() {
        order.push(cid);
        for child in children.get(&cid).into_iter().flatten() {
            if let Some(n) = pending.get_mut(child) {
                *n -= 1;
                if *n == 0 {
                    ready.insert(*child);
                }
            }
        }
    }
    order
}

/// Events reachable from `head` but not from `since`, oldest first.
pub async fn sorted_events_since<F: BlockFetcher + ?Sized>(
    fetcher: &F,
    head: &[Cid],
    since: &[Cid],
) -> Result<Vec<EventLink>> {
    let excluded: HashSet<Cid> = collect_events(fetcher, since, &HashSet::new())
        .await?
        .into_keys()
        .collect();
    let mut events = collect_events(fetcher, head, &excluded).await?;
    let order = topological_order(&events);
    Ok(order
        .into_iter()
        .filter_map(|cid| {
            events
                .remove(&cid)
                .map(|parents| EventLink { cid, parents })
        })
        .collect())
}

/// The most recent event every member of `heads` descends from.
///
/// `None` when the heads share no history or `heads` is empty.
pub async fn find_common_ancestor<F: BlockFetcher + ?Sized>(
    fetcher: &F,
    heads: &[Cid],
) -> Result<Option<Cid>> {
    let mut common: Option<HashSet<Cid>> = None;
    let mut union: HashMap<Cid, Vec<Cid>> = HashMap::new();
    for head in heads {
        let events = collect_events(fetcher, &[*head], &HashSet::new()).await?;
        let keys: HashSet<Cid> = events.keys().copied().collect();
        common = Some(match common {
            Some(acc) => acc.intersection(&keys).copied().collect(),
            None => keys,
        });
        union.extend(events);
    }
    let Some(common) = common else {
        return Ok(None);
    };
    Ok(topological_order(&union)
        .into_iter()
        .rev()
        .find(|cid| common.contains(cid)))
}

/// DOT rendering of every event reachable from `head`.
pub async fn vis<F: BlockFetcher + ?Sized>(fetcher: &F, head: &[Cid]) -> Result<Vec<String>> {
    let events = collect_events(fetcher, head, &HashSet::new()).await?;
    let mut lines = vec![
        "digraph clock {".to_string(),
        "  node [shape=point fontname=\"Courier\"]; head;".to_string(),
    ];
    for cid in head {
        lines.push(format!("  head -> \"{}\";", cid));
    }
    for cid in topological_order(&events) {
        let text = cid.to_string();
        let short = &text[text.len().saturating_sub(7)..];
        lines.push(format!("  \"{}\" [shape=oval fontname=\"Courier\" label=\"{}\"];", cid, short));
        for parent in events.get(&cid).into_iter().flatten() {
            lines.push(format!("  \"{}\" -> \"{}\";", cid, parent));
        }
    }
    lines.push("}".to_string());
    Ok(lines)
}
