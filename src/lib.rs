//! EmberDB - embedded local-first document store
//!
//! Documents live in a content-addressed block log; every write is an
//! event of a Merkle clock, so replicas that exchange metas through a
//! shared gateway converge without coordination.
//!
//! # Quick Start
//!
//! ```ignore
//! use emberdb::{Crdt, CrdtOptions, EngineConfig};
//! use serde_json::json;
//!
//! let db = Crdt::open(EngineConfig::default(), CrdtOptions::memory("notes")?).await?;
//! db.put("note:1", json!({"title": "hello"})).await?;
//! let note = db.get("note:1").await?;
//! ```
//!
//! # Architecture
//!
//! - [`core`]: CIDs, blocks, errors
//! - [`storage`]: transactional block store, block codecs, key bag
//! - [`durability`]: envelopes, CARs, metas, WAL, gateways
//! - [`concurrency`]: write queue, apply-head queue, task manager
//! - [`engine`]: clock, CRDT, loader, compaction, the [`Crdt`] handle

pub use ember_concurrency as concurrency;
pub use ember_core as core;
pub use ember_durability as durability;
pub use ember_engine as engine;
pub use ember_storage as storage;

pub use ember_core::{Block, Cid, ClockHead, Codec, DocUpdate, Error, Result};
pub use ember_durability::{
    FileGateway, Gateway, InterceptorGateway, MemoryGateway, UriInterceptor,
};
pub use ember_engine::{
    CompactStrategy, CompactStrategyRegistry, CompactionReport, Crdt, CrdtOptions, EngineConfig,
};
pub use ember_storage::KeyBag;
