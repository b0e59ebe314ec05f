//! Block codec trait definitions.

use ember_core::Block;

/// Block codec trait.
///
/// Every block leaving the engine for a gateway passes through the codec,
/// and every block arriving from a gateway is decoded by it. The codec
/// returns a new block whose CID addresses the encoded bytes.
///
/// # Thread Safety
///
/// Codecs must be `Send + Sync`; the loader shares one codec across tasks.
pub trait BlockCodec: Send + Sync {
    /// Encode a block for storage.
    fn encode(&self, block: &Block) -> Result<Block, CodecError>;

    /// Reverse [`BlockCodec::encode`].
    ///
    /// Fails for wrong keys, tampered bytes, or a block this codec did not
    /// produce.
    fn decode(&self, block: &Block) -> Result<Block, CodecError>;

    /// Unique codec identifier.
    fn codec_id(&self) -> &str;
}

/// Codec errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// Authenticated decryption failed (wrong key or tampered bytes).
    #[error("Decrypt error: {0}")]
    Decrypt(String),

    /// Encryption failed.
    #[error("Encrypt error: {0}")]
    Encrypt(String),

    /// Bytes do not have the expected frame layout.
    #[error("Malformed frame: {0}")]
    Malformed(String),

    /// Unknown codec identifier.
    #[error("Unknown codec: {0}")]
    UnknownCodec(String),

    /// Codec needs a key and none was supplied.
    #[error("Codec {0} requires a key")]
    MissingKey(String),
}

impl From<CodecError> for ember_core::Error {
    fn from(e: CodecError) -> Self {
        ember_core::Error::CodecError(e.to_string())
    }
}
