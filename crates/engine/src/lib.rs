//! Database engine for Ember
//!
//! This crate orchestrates all lower layers:
//! - Merkle clock: event blocks, head advance, causal queries
//! - Root: folding CRDT deltas into document state
//! - CRDT clock: head application through the apply-head queue
//! - Loader: CAR log, local reload, remote sync through the WAL
//! - Compaction: pluggable strategies behind a registry
//! - Crdt: the database handle with put/get/delete/changes
//!
//! The engine is the only component that knows about:
//! - Which blocks make up a transaction
//! - How local writes and remote metas reach the same head

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod clock;
pub mod compaction;
pub mod config;
pub mod crdt;
pub mod crdt_clock;
pub mod loader;
pub mod root;

pub use clock::{advance, EventBlock, EventLink};
pub use compaction::{
    CompactStrategy, CompactStrategyRegistry, CompactionContext, CompactionReport,
    FireproofStrategy, FullStrategy, NoopStrategy,
};
pub use config::{EngineConfig, CONFIG_FILE_NAME};
pub use crdt::{Crdt, CrdtOptions};
pub use crdt_clock::{CommitHook, CrdtClock};
pub use loader::{LoadedState, Loader, RemoteStore, StoreUrls};
pub use root::{CrdtEntry, CrdtEvent, RootNode, RootResult};
