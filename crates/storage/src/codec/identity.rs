//! Identity codec (no transformation).
//!
//! Blocks pass through unchanged, CID included. Used when encryption is
//! disabled.

use super::traits::{BlockCodec, CodecError};
use ember_core::Block;

/// Identity codec - no transformation.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityCodec;

impl BlockCodec for IdentityCodec {
    fn encode(&self, block: &Block) -> Result<Block, CodecError> {
        Ok(block.clone())
    }

    fn decode(&self, block: &Block) -> Result<Block, CodecError> {
        Ok(block.clone())
    }

    fn codec_id(&self) -> &str {
        "identity"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_keeps_cid() {
        let block = Block::raw(vec![1, 2, 3, 4, 5]);
        let encoded = IdentityCodec.encode(&block).unwrap();
        assert_eq!(encoded, block);
        assert_eq!(IdentityCodec.decode(&encoded).unwrap(), block);
    }

    #[test]
    fn test_codec_id() {
        assert_eq!(IdentityCodec.codec_id(), "identity");
    }

    #[test]
    fn test_identity_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<IdentityCodec>();
    }
}
