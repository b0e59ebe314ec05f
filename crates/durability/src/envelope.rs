//! Typed envelopes exchanged with gateways
//!
//! An envelope is a MessagePack map `{type, payload}` where `type` is one of
//! `car`, `file`, `meta`, `wal`. A whole buffer is one envelope.
//!
//! Decoding validates in order and reports the first failure:
//! 1. the value is a map (`NotStructured`)
//! 2. `type` is present and a string (`TypeNotString`)
//! 3. `type` is a known kind (`UnknownType`)
//! 4. `type` is in the accepted set, when one is given (`UnexpectedType`)
//! 5. `payload` matches the kind's schema (`InvalidPayload`)

use std::fmt;
use std::str::FromStr;

use serde::de::{self, Deserializer, IgnoredAny, MapAccess, SeqAccess, Visitor};
use serde::{Deserialize, Serialize};

use crate::meta::SerializedMeta;
use crate::wal::WalState;
use ember_core::bytes_serde;

/// Envelope kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnvelopeType {
    /// Encoded CAR archive
    Car,
    /// Opaque file bytes
    File,
    /// Meta records
    Meta,
    /// Write-ahead log state
    Wal,
}

impl EnvelopeType {
    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvelopeType::Car => "car",
            EnvelopeType::File => "file",
            EnvelopeType::Meta => "meta",
            EnvelopeType::Wal => "wal",
        }
    }
}

impl fmt::Display for EnvelopeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EnvelopeType {
    type Err = EnvelopeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "car" => Ok(EnvelopeType::Car),
            "file" => Ok(EnvelopeType::File),
            "meta" => Ok(EnvelopeType::Meta),
            "wal" => Ok(EnvelopeType::Wal),
            other => Err(EnvelopeError::UnknownType(other.to_string())),
        }
    }
}

/// Envelope validation errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnvelopeError {
    /// Bytes are not a MessagePack map
    #[error("Envelope is not a structured map: {0}")]
    NotStructured(String),

    /// `type` is missing or not a string
    #[error("Envelope type is missing or not a string")]
    TypeNotString,

    /// `type` is not a known kind
    #[error("Unknown envelope type: {0}")]
    UnknownType(String),

    /// `type` is known but not accepted here
    #[error("Unexpected envelope type {actual}, expected one of [{expected}]")]
    UnexpectedType {
        /// Type found in the envelope
        actual: EnvelopeType,
        /// Accepted types, comma separated
        expected: String,
    },

    /// `payload` does not match the schema of its type
    #[error("Invalid {kind} payload: {reason}")]
    InvalidPayload {
        /// Envelope type
        kind: EnvelopeType,
        /// Decoder message
        reason: String,
    },

    /// Envelope could not be encoded
    #[error("Envelope encode error: {0}")]
    Encode(String),
}

impl From<EnvelopeError> for ember_core::Error {
    fn from(e: EnvelopeError) -> Self {
        ember_core::Error::SerializationError(e.to_string())
    }
}

/// A value crossing the gateway boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "lowercase")]
pub enum Envelope {
    /// Encoded CAR archive bytes
    Car(#[serde(with = "bytes_serde")] Vec<u8>),
    /// Opaque file bytes
    File(#[serde(with = "bytes_serde")] Vec<u8>),
    /// Meta records
    Meta(Vec<SerializedMeta>),
    /// Write-ahead log state
    Wal(WalState),
}

impl Envelope {
    /// Kind of this envelope.
    pub fn kind(&self) -> EnvelopeType {
        match self {
            Envelope::Car(_) => EnvelopeType::Car,
            Envelope::File(_) => EnvelopeType::File,
            Envelope::Meta(_) => EnvelopeType::Meta,
            Envelope::Wal(_) => EnvelopeType::Wal,
        }
    }

    /// Encode as a MessagePack map.
    pub fn encode(&self) -> Result<Vec<u8>, EnvelopeError> {
        rmp_serde::to_vec_named(self).map_err(|e| EnvelopeError::Encode(e.to_string()))
    }

    /// Validate and decode an envelope.
    ///
    /// An empty `accepted` slice accepts every kind.
    pub fn decode(bytes: &[u8], accepted: &[EnvelopeType]) -> Result<Self, EnvelopeError> {
        let header: Header = rmp_serde::from_slice(bytes)
            .map_err(|e| EnvelopeError::NotStructured(e.to_string()))?;
        let kind = match header.kind {
            Some(Probe::Str(s)) => s.parse::<EnvelopeType>()?,
            _ => return Err(EnvelopeError::TypeNotString),
        };
        if !accepted.is_empty() && !accepted.contains(&kind) {
            let expected = accepted
                .iter()
                .map(EnvelopeType::as_str)
                .collect::<Vec<_>>()
                .join(", ");
            return Err(EnvelopeError::UnexpectedType {
                actual: kind,
                expected,
            });
        }
        rmp_serde::from_slice(bytes).map_err(|e| EnvelopeError::InvalidPayload {
            kind,
            reason: e.to_string(),
        })
    }

    /// Payload of a `car` envelope.
    pub fn into_car(self) -> Result<Vec<u8>, EnvelopeError> {
        match self {
            Envelope::Car(bytes) => Ok(bytes),
            other => Err(other.unexpected(EnvelopeType::Car)),
        }
    }

    /// Payload of a `meta` envelope.
    pub fn into_meta(self) -> Result<Vec<SerializedMeta>, EnvelopeError> {
        match self {
            Envelope::Meta(metas) => Ok(metas),
            other => Err(other.unexpected(EnvelopeType::Meta)),
        }
    }

    /// Payload of a `wal` envelope.
    pub fn into_wal(self) -> Result<WalState, EnvelopeError> {
        match self {
            Envelope::Wal(state) => Ok(state),
            other => Err(other.unexpected(EnvelopeType::Wal)),
        }
    }

    fn unexpected(&self, expected: EnvelopeType) -> EnvelopeError {
        EnvelopeError::UnexpectedType {
            actual: self.kind(),
            expected: expected.as_str().to_string(),
        }
    }
}

/// Just enough of an envelope to read its `type`.
struct Header {
    kind: Option<Probe>,
}

/// A value that is either a string or something else.
enum Probe {
    Str(String),
    Other,
}

impl<'de> Deserialize<'de> for Header {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct HeaderVisitor;

        impl<'de> Visitor<'de> for HeaderVisitor {
            type Value = Header;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("an envelope map")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Header, A::Error> {
                let mut kind = None;
                while let Some(key) = map.next_key::<Probe>()? {
                    match key {
                        Probe::Str(k) if k == "type" => kind = Some(map.next_value::<Probe>()?),
                        _ => {
                            map.next_value::<IgnoredAny>()?;
                        }
                    }
                }
                Ok(Header { kind })
            }
        }

        deserializer.deserialize_map(HeaderVisitor)
    }
}

impl<'de> Deserialize<'de> for Probe {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ProbeVisitor;

        impl<'de> Visitor<'de> for ProbeVisitor {
            type Value = Probe;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("any value")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Probe, E> {
                Ok(Probe::Str(v.to_string()))
            }

            fn visit_string<E: de::Error>(self, v: String) -> Result<Probe, E> {
                Ok(Probe::Str(v))
            }

            fn visit_bool<E: de::Error>(self, _: bool) -> Result<Probe, E> {
                Ok(Probe::Other)
            }

            fn visit_i64<E: de::Error>(self, _: i64) -> Result<Probe, E> {
                Ok(Probe::Other)
            }

            fn visit_u64<E: de::Error>(self, _: u64) -> Result<Probe, E> {
                Ok(Probe::Other)
            }

            fn visit_f64<E: de::Error>(self, _: f64) -> Result<Probe, E> {
                Ok(Probe::Other)
            }

            fn visit_bytes<E: de::Error>(self, _: &[u8]) -> Result<Probe, E> {
                Ok(Probe::Other)
            }

            fn visit_none<E: de::Error>(self) -> Result<Probe, E> {
                Ok(Probe::Other)
            }

            fn visit_unit<E: de::Error>(self) -> Result<Probe, E> {
                Ok(Probe::Other)
            }

            fn visit_some<D: Deserializer<'de>>(self, d: D) -> Result<Probe, D::Error> {
                Probe::deserialize(d)
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Probe, A::Error> {
                while seq.next_element::<IgnoredAny>()?.is_some() {}
                Ok(Probe::Other)
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Probe, A::Error> {
                while map.next_entry::<IgnoredAny, IgnoredAny>()?.is_some() {}
                Ok(Probe::Other)
            }
        }

        deserializer.deserialize_any(ProbeVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::DbMeta;
    use ember_core::Block;
    use proptest::prelude::*;
    use std::collections::BTreeMap;

    #[derive(serde::Serialize)]
    #[serde(untagged)]
    enum Value {
        Str(&'static str),
        Int(i64),
        List(Vec<i64>),
    }

    fn encode_map(entries: BTreeMap<&str, Value>) -> Vec<u8> {
        rmp_serde::to_vec_named(&entries).unwrap()
    }

    #[test]
    fn test_car_envelope() {
        let env = Envelope::Car(vec![1, 2, 3]);
        let bytes = env.encode().unwrap();
        let back = Envelope::decode(&bytes, &[EnvelopeType::Car]).unwrap();
        assert_eq!(back, env);
        assert_eq!(back.into_car().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_meta_envelope() {
        let meta = DbMeta {
            cars: vec![Block::raw(b"car".to_vec()).cid],
        };
        let record = SerializedMeta::from_meta(&meta, Vec::new(), "cid".into()).unwrap();
        let env = Envelope::Meta(vec![record]);
        let bytes = env.encode().unwrap();
        let back = Envelope::decode(&bytes, &[]).unwrap();
        assert_eq!(back.kind(), EnvelopeType::Meta);
        assert_eq!(back.into_meta().unwrap()[0].to_db_meta().unwrap(), meta);
    }

    #[test]
    fn test_rejects_non_map() {
        let bytes = rmp_serde::to_vec(&vec![1, 2, 3]).unwrap();
        assert!(matches!(
            Envelope::decode(&bytes, &[]),
            Err(EnvelopeError::NotStructured(_))
        ));
        let bytes = rmp_serde::to_vec(&"car").unwrap();
        assert!(matches!(
            Envelope::decode(&bytes, &[]),
            Err(EnvelopeError::NotStructured(_))
        ));
    }

    #[test]
    fn test_rejects_non_string_type() {
        let mut m = BTreeMap::new();
        m.insert("type", Value::Int(7));
        m.insert("payload", Value::List(vec![1]));
        assert_eq!(
            Envelope::decode(&encode_map(m), &[]),
            Err(EnvelopeError::TypeNotString)
        );
    }

    #[test]
    fn test_rejects_missing_type() {
        let mut m = BTreeMap::new();
        m.insert("payload", Value::List(vec![1]));
        assert_eq!(
            Envelope::decode(&encode_map(m), &[]),
            Err(EnvelopeError::TypeNotString)
        );
    }

    #[test]
    fn test_rejects_unknown_type() {
        let mut m = BTreeMap::new();
        m.insert("type", Value::Str("blob"));
        assert_eq!(
            Envelope::decode(&encode_map(m), &[]),
            Err(EnvelopeError::UnknownType("blob".into()))
        );
    }

    #[test]
    fn test_rejects_unexpected_type() {
        let bytes = Envelope::Car(vec![0]).encode().unwrap();
        let err = Envelope::decode(&bytes, &[EnvelopeType::Meta, EnvelopeType::Wal]).unwrap_err();
        assert_eq!(
            err,
            EnvelopeError::UnexpectedType {
                actual: EnvelopeType::Car,
                expected: "meta, wal".into()
            }
        );
    }

    #[test]
    fn test_rejects_bad_payload() {
        let mut m = BTreeMap::new();
        m.insert("type", Value::Str("wal"));
        m.insert("payload", Value::Str("not a wal"));
        assert!(matches!(
            Envelope::decode(&encode_map(m), &[]),
            Err(EnvelopeError::InvalidPayload {
                kind: EnvelopeType::Wal,
                ..
            })
        ));
    }

    #[test]
    fn test_into_wrong_kind() {
        let env = Envelope::File(vec![9]);
        assert!(matches!(
            env.into_meta(),
            Err(EnvelopeError::UnexpectedType { .. })
        ));
    }

    proptest! {
        #[test]
        fn prop_decode_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..256)) {
            let _ = Envelope::decode(&bytes, &[]);
        }
    }
}
