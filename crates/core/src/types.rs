//! Core types shared by every layer
//!
//! - ClockHead: the causal frontier of the Merkle clock
//! - DocUpdate: one document mutation carried by a CRDT delta
//! - TransactionMeta: the head a committed transaction makes durable

use crate::cid::Cid;
use serde::{Deserialize, Serialize};

/// Event CIDs with no known children, kept sorted.
pub type ClockHead = Vec<Cid>;

/// Sort and deduplicate a head so that equal sets compare equal.
pub fn sort_head(mut head: ClockHead) -> ClockHead {
    head.sort();
    head.dedup();
    head
}

/// Compare two heads as sets.
pub fn heads_equal(a: &[Cid], b: &[Cid]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    sort_head(a.to_vec()) == sort_head(b.to_vec())
}

/// A single document mutation.
///
/// `value: None` deletes the document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocUpdate {
    /// Document identifier
    pub id: String,
    /// New document body, or `None` for a delete
    #[serde(default)]
    pub value: Option<serde_json::Value>,
}

impl DocUpdate {
    /// Write `value` under `id`.
    pub fn put(id: impl Into<String>, value: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            value: Some(value),
        }
    }

    /// Delete `id`.
    pub fn delete(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            value: None,
        }
    }

    /// True if this update removes the document.
    pub fn is_delete(&self) -> bool {
        self.value.is_none()
    }
}

/// Metadata committed alongside a transaction's blocks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionMeta {
    /// Clock head after the transaction
    pub head: ClockHead,
}

impl TransactionMeta {
    /// Meta for `head`.
    pub fn new(head: ClockHead) -> Self {
        Self {
            head: sort_head(head),
        }
    }

    /// True when no head is recorded (e.g. a no-op compaction).
    pub fn is_empty(&self) -> bool {
        self.head.is_empty()
    }
}
