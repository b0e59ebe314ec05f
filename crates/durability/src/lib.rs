//! Durability layer for Ember
//!
//! This crate handles everything that crosses the storage/network boundary:
//!
//! - Envelope: typed `car | file | meta | wal` wrapper, the only wire format
//! - CAR archives: framed block lists with roots, one per committed transaction
//! - Meta records: `DbMeta` naming the CARs of a head, and its wire form
//! - WAL: pending uploads persisted through a gateway
//! - Gateways: memory and file backends, interceptor chain, URL rewriting

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod car;
pub mod envelope;
pub mod gateway;
pub mod meta;
pub mod wal;

pub use car::{CarArchive, CarError};
pub use envelope::{Envelope, EnvelopeError, EnvelopeType};
pub use gateway::{
    FileGateway, Gateway, GatewayError, GatewayInterceptor, GatewayResult, Interception,
    InterceptorGateway, MemoryGateway, PassThroughInterceptor, Subscription, UriInterceptor,
};
pub use meta::{DbMeta, DbMetaEvent, SerializedMeta};
pub use wal::{FileOperation, WalSink, WalState, WriteAheadLog};
