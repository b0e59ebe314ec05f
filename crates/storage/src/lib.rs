//! Storage layer for Ember
//!
//! This crate implements block storage and the encryption seam:
//! - TransactionalBlockStore: content-addressed blocks with a pending overlay
//! - BlockFetcher: async lookup seam shared by clock, root and compaction code
//! - BlockCodec: identity and ChaCha20-Poly1305 block codecs
//! - KeyBag: named encryption keys with memory and file providers

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod fetcher;
pub mod keybag;
pub mod transaction;

pub use codec::{get_codec, BlockCodec, CodecError, EncryptedCodec, IdentityCodec, NonceSource};
pub use fetcher::{require_block, BlockFetcher};
pub use keybag::{KeyBag, KeyBagError, KeysByFingerprint};
pub use transaction::{Entries, TransactionalBlockStore};
