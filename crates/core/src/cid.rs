//! Content identifiers
//!
//! A `Cid` addresses a block by the SHA-256 digest of its bytes, tagged with
//! the codec that produced those bytes. The string form is multibase-style:
//! a `b` prefix followed by lowercase, unpadded base32 of the binary form
//! `[version, codec, hash-code, digest-len, digest..]`.

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

const CID_VERSION: u8 = 0x01;
const SHA2_256: u8 = 0x12;
const DIGEST_LEN: u8 = 0x20;

/// Length of the binary CID form.
pub const CID_BYTES_LEN: usize = 4 + 32;

/// Codec tag carried inside a CID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Codec {
    /// Opaque bytes
    Raw,
    /// MessagePack-encoded structured value (events, deltas, root nodes)
    Structured,
    /// Ciphertext produced by the encrypted block codec
    Encrypted,
}

impl Codec {
    /// Numeric code written into the binary form.
    pub fn code(&self) -> u8 {
        match self {
            Codec::Raw => 0x55,
            Codec::Structured => 0x71,
            Codec::Encrypted => 0x39,
        }
    }

    /// Resolve a numeric code.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x55 => Some(Codec::Raw),
            0x71 => Some(Codec::Structured),
            0x39 => Some(Codec::Encrypted),
            _ => None,
        }
    }
}

/// Error parsing a CID from text or bytes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CidParseError {
    /// Missing `b` multibase prefix
    #[error("unsupported multibase prefix in {0:?}")]
    Prefix(String),
    /// Base32 body did not decode
    #[error("invalid base32: {0}")]
    Encoding(String),
    /// Binary form has the wrong shape
    #[error("invalid cid bytes: {0}")]
    Malformed(String),
}

/// Content identifier: codec tag + SHA-256 digest.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Cid {
    codec: Codec,
    digest: [u8; 32],
}

impl Cid {
    /// Hash `bytes` and tag the result with `codec`.
    pub fn hash(codec: Codec, bytes: &[u8]) -> Self {
        let digest: [u8; 32] = Sha256::digest(bytes).into();
        Self { codec, digest }
    }

    /// Build a CID from an already computed digest.
    pub const fn from_digest(codec: Codec, digest: [u8; 32]) -> Self {
        Self { codec, digest }
    }

    /// Codec tag.
    pub fn codec(&self) -> Codec {
        self.codec
    }

    /// Raw SHA-256 digest.
    pub fn digest(&self) -> &[u8; 32] {
        &self.digest
    }

    /// Binary form.
    pub fn to_bytes(&self) -> [u8; CID_BYTES_LEN] {
        let mut out = [0u8; CID_BYTES_LEN];
        out[0] = CID_VERSION;
        out[1] = self.codec.code();
        out[2] = SHA2_256;
        out[3] = DIGEST_LEN;
        out[4..].copy_from_slice(&self.digest);
        out
    }

    /// Parse the binary form.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CidParseError> {
        if bytes.len() != CID_BYTES_LEN {
            return Err(CidParseError::Malformed(format!(
                "expected {} bytes, got {}",
                CID_BYTES_LEN,
                bytes.len()
            )));
        }
        if bytes[0] != CID_VERSION || bytes[2] != SHA2_256 || bytes[3] != DIGEST_LEN {
            return Err(CidParseError::Malformed("unsupported version or hash".into()));
        }
        let codec = Codec::from_code(bytes[1])
            .ok_or_else(|| CidParseError::Malformed(format!("unknown codec 0x{:02x}", bytes[1])))?;
        let mut digest = [0u8; 32];
        digest.copy_from_slice(&bytes[4..]);
        Ok(Self { codec, digest })
    }

    /// True if `bytes` hash to this CID's digest.
    pub fn matches(&self, bytes: &[u8]) -> bool {
        let digest: [u8; 32] = Sha256::digest(bytes).into();
        digest == self.digest
    }
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let body = data_encoding::BASE32_NOPAD.encode(&self.to_bytes());
        write!(f, "b{}", body.to_ascii_lowercase())
    }
}

impl fmt::Debug for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cid({})", self)
    }
}

impl FromStr for Cid {
    type Err = CidParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let body = s
            .strip_prefix('b')
            .ok_or_else(|| CidParseError::Prefix(s.to_string()))?;
        let bytes = data_encoding::BASE32_NOPAD
            .decode(body.to_ascii_uppercase().as_bytes())
            .map_err(|e| CidParseError::Encoding(e.to_string()))?;
        Cid::from_bytes(&bytes)
    }
}

impl Serialize for Cid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Cid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}
