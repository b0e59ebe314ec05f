//! Core types for Ember
//!
//! This crate defines the foundational types used throughout the system:
//! - Cid: content identifier (codec tag + SHA-256 digest)
//! - Block: immutable `(cid, bytes)` pair
//! - ClockHead: causal frontier of the Merkle clock
//! - DocUpdate: document mutation carried by CRDT deltas
//! - TransactionMeta: head recorded with each committed transaction
//! - Error: error type hierarchy

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod block;
pub mod cid;
pub mod error;
pub mod types;

pub use block::{bytes_serde, Block};
pub use cid::{Cid, CidParseError, Codec, CID_BYTES_LEN};
pub use error::{Error, Result};
pub use types::{heads_equal, sort_head, ClockHead, DocUpdate, TransactionMeta};
