//! Block codec abstraction.
//!
//! Blocks cross the gateway boundary through a codec. Two codecs exist:
//!
//! - `IdentityCodec`: pass-through, CID unchanged
//! - `EncryptedCodec`: ChaCha20-Poly1305, CID recomputed over ciphertext
//!
//! # Usage
//!
//! ```ignore
//! use ember_storage::codec::{get_codec, NonceSource};
//!
//! let codec = get_codec("chacha20-poly1305", Some((key, NonceSource::Convergent)))?;
//! let sealed = codec.encode(&block)?;
//! assert_eq!(codec.decode(&sealed)?, block);
//! ```

mod encrypted;
mod identity;
mod traits;

pub use encrypted::{
    decrypt, encrypt, EncryptedBlock, EncryptedCodec, NonceSource, KEY_LEN, NONCE_LEN,
};
pub use identity::IdentityCodec;
pub use traits::{BlockCodec, CodecError};

/// Get a codec by its identifier.
///
/// # Known Codecs
///
/// - `"identity"`: No-op codec (pass-through); the key is ignored
/// - `"chacha20-poly1305"`: requires a key
pub fn get_codec(
    codec_id: &str,
    key: Option<([u8; KEY_LEN], NonceSource)>,
) -> Result<Box<dyn BlockCodec>, CodecError> {
    match codec_id {
        "identity" => Ok(Box::new(IdentityCodec)),
        "chacha20-poly1305" => {
            let (key, nonce_source) =
                key.ok_or_else(|| CodecError::MissingKey(codec_id.to_string()))?;
            Ok(Box::new(EncryptedCodec::new(key, nonce_source)))
        }
        _ => Err(CodecError::UnknownCodec(codec_id.to_string())),
    }
}
