//! Meta records
//!
//! A `DbMeta` names the CARs that reproduce a head. Metas are exchanged as
//! events of their own small clock: a `DbMetaEvent` is encoded as a
//! structured block `{parents, data}` and serialized for the wire as
//! `{data: base64pad(msgpack(DbMeta)), parents, cid}`.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use ember_core::{Block, Cid, Error, Result};

/// The CARs that together reproduce a head.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DbMeta {
    /// CAR CIDs, oldest first
    pub cars: Vec<Cid>,
}

impl DbMeta {
    /// Meta naming `cars`.
    pub fn new(cars: Vec<Cid>) -> Self {
        Self { cars }
    }
}

/// Body of a meta event block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct MetaEventBody {
    parents: Vec<Cid>,
    data: DbMeta,
}

/// A meta together with its position in the meta clock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbMetaEvent {
    /// CID of the event block
    pub event_cid: Cid,
    /// Parent meta events
    pub parents: Vec<Cid>,
    /// The meta
    pub meta: DbMeta,
}

impl DbMetaEvent {
    /// Create a meta event, returning it with its encoded block.
    pub fn create(meta: DbMeta, parents: Vec<Cid>) -> Result<(Self, Block)> {
        let block = Block::encode(&MetaEventBody {
            parents: parents.clone(),
            data: meta.clone(),
        })?;
        Ok((
            Self {
                event_cid: block.cid,
                parents,
                meta,
            },
            block,
        ))
    }

    /// Read a meta event back from its block.
    pub fn from_block(block: &Block) -> Result<Self> {
        let body: MetaEventBody = block.decode()?;
        Ok(Self {
            event_cid: block.cid,
            parents: body.parents,
            meta: body.data,
        })
    }

    /// The event block.
    pub fn to_block(&self) -> Result<Block> {
        Block::encode(&MetaEventBody {
            parents: self.parents.clone(),
            data: self.meta.clone(),
        })
    }

    /// Wire form.
    pub fn to_serialized(&self) -> Result<SerializedMeta> {
        SerializedMeta::from_meta(
            &self.meta,
            self.parents.iter().map(Cid::to_string).collect(),
            self.event_cid.to_string(),
        )
    }
}

/// Wire form of a meta event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedMeta {
    /// base64 (padded) of the MessagePack-encoded `DbMeta`
    pub data: String,
    /// Parent event CIDs as strings
    #[serde(default)]
    pub parents: Vec<String>,
    /// Event CID as a string
    pub cid: String,
}

impl SerializedMeta {
    /// Serialize `meta` with the given parents and event CID.
    pub fn from_meta(meta: &DbMeta, parents: Vec<String>, cid: String) -> Result<Self> {
        let bytes = rmp_serde::to_vec_named(meta)?;
        Ok(Self {
            data: STANDARD.encode(bytes),
            parents,
            cid,
        })
    }

    /// Decode the `data` field.
    pub fn to_db_meta(&self) -> Result<DbMeta> {
        let bytes = STANDARD
            .decode(&self.data)
            .map_err(|e| Error::SerializationError(format!("meta data is not base64: {}", e)))?;
        Ok(rmp_serde::from_slice(&bytes)?)
    }

    /// Parse into a `DbMetaEvent`.
    ///
    /// The event CID is recomputed from the parents and meta and must match
    /// `cid`; a mismatch is reported as corruption.
    pub fn to_event(&self) -> Result<DbMetaEvent> {
        let meta = self.to_db_meta()?;
        let parents = self
            .parents
            .iter()
            .map(|p| p.parse::<Cid>())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::SerializationError(format!("bad parent cid: {}", e)))?;
        let claimed: Cid = self
            .cid
            .parse()
            .map_err(|e| Error::SerializationError(format!("bad meta cid: {}", e)))?;
        let (event, _) = DbMetaEvent::create(meta, parents)?;
        if event.event_cid != claimed {
            return Err(Error::Corruption(format!(
                "meta event {} does not match its content ({})",
                claimed, event.event_cid
            )));
        }
        Ok(event)
    }
}
