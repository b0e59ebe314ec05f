//! Immutable content-addressed blocks

use crate::cid::{Cid, Codec};
use crate::error::Result;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// An immutable `(cid, bytes)` pair, the unit of storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Address of `bytes`
    pub cid: Cid,
    /// Block payload
    #[serde(with = "bytes_serde")]
    pub bytes: Vec<u8>,
}

impl Block {
    /// Pair an address with its bytes without re-hashing.
    ///
    /// Use [`Block::verify`] when the pair comes from an untrusted source.
    pub fn new(cid: Cid, bytes: Vec<u8>) -> Self {
        Self { cid, bytes }
    }

    /// Address opaque bytes with the `Raw` codec.
    pub fn raw(bytes: impl Into<Vec<u8>>) -> Self {
        let bytes = bytes.into();
        Self {
            cid: Cid::hash(Codec::Raw, &bytes),
            bytes,
        }
    }

    /// Encode a structured value as MessagePack and address it.
    pub fn encode<T: Serialize>(value: &T) -> Result<Self> {
        let bytes = rmp_serde::to_vec_named(value)?;
        Ok(Self {
            cid: Cid::hash(Codec::Structured, &bytes),
            bytes,
        })
    }

    /// Decode the payload of a structured block.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(rmp_serde::from_slice(&self.bytes)?)
    }

    /// True if the bytes hash to the CID.
    pub fn verify(&self) -> bool {
        self.cid.matches(&self.bytes)
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// True for an empty payload.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// `#[serde(with)]` helper writing `Vec<u8>` as a MessagePack bin rather
/// than an array of integers.
pub mod bytes_serde {
    use serde::{Deserializer, Serializer};

    /// Serialize as bytes.
    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(bytes)
    }

    /// Deserialize from bytes (or a sequence of integers).
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        struct BytesVisitor;

        impl<'de> serde::de::Visitor<'de> for BytesVisitor {
            type Value = Vec<u8>;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str("a byte buffer")
            }

            fn visit_bytes<E: serde::de::Error>(self, v: &[u8]) -> Result<Vec<u8>, E> {
                Ok(v.to_vec())
            }

            fn visit_byte_buf<E: serde::de::Error>(self, v: Vec<u8>) -> Result<Vec<u8>, E> {
                Ok(v)
            }

            fn visit_seq<A: serde::de::SeqAccess<'de>>(
                self,
                mut seq: A,
            ) -> Result<Vec<u8>, A::Error> {
                let mut out = Vec::with_capacity(seq.size_hint().unwrap_or(0));
                while let Some(b) = seq.next_element::<u8>()? {
                    out.push(b);
                }
                Ok(out)
            }
        }

        deserializer.deserialize_byte_buf(BytesVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        name: String,
        count: u32,
    }

    #[test]
    fn test_raw_block_verifies() {
        let block = Block::raw(b"hello".to_vec());
        assert_eq!(block.cid.codec(), Codec::Raw);
        assert!(block.verify());
        assert_eq!(block.len(), 5);
    }

    #[test]
    fn test_tampered_block_fails_verify() {
        let mut block = Block::raw(b"hello".to_vec());
        block.bytes[0] ^= 0xff;
        assert!(!block.verify());
    }

    #[test]
    fn test_structured_block() {
        let value = Sample {
            name: "doc".into(),
            count: 7,
        };
        let block = Block::encode(&value).unwrap();
        assert_eq!(block.cid.codec(), Codec::Structured);
        let back: Sample = block.decode().unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn test_equal_values_share_cid() {
        let a = Block::encode(&Sample { name: "x".into(), count: 1 }).unwrap();
        let b = Block::encode(&Sample { name: "x".into(), count: 1 }).unwrap();
        assert_eq!(a.cid, b.cid);
    }

    #[test]
    fn test_block_serializes_bytes_as_bin() {
        let block = Block::raw(vec![1u8, 2, 3]);
        let encoded = rmp_serde::to_vec_named(&block).unwrap();
        let back: Block = rmp_serde::from_slice(&encoded).unwrap();
        assert_eq!(back, block);
    }
}
