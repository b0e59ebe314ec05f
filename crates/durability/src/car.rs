//! CAR archives
//!
//! A CAR is the unit of upload: the blocks of one committed transaction
//! plus the roots that name them (the transaction meta block first).
//!
//! Binary layout, all lengths little-endian `u32`:
//!
//! ```text
//! header_len || msgpack(roots) || { frame_len || cid(36) || bytes }*
//! ```
//!
//! `frame_len` covers the CID and the bytes. Decoding verifies every block
//! against its CID.

use std::io::{Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use ember_core::{Block, Cid, CID_BYTES_LEN};

/// Largest header or frame accepted by the decoder.
pub const MAX_FRAME: usize = 16 * 1024 * 1024;

/// CAR decoding errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CarError {
    /// Input ended inside a header or frame
    #[error("Truncated archive: {0}")]
    Truncated(String),

    /// Header or frame length exceeds `MAX_FRAME`
    #[error("Frame too large: {0} bytes")]
    TooLarge(usize),

    /// Roots could not be decoded
    #[error("Invalid header: {0}")]
    Header(String),

    /// Frame is shorter than a CID or the CID is malformed
    #[error("Invalid frame: {0}")]
    Frame(String),

    /// A block does not hash to its CID
    #[error("Block hash mismatch for {0}")]
    HashMismatch(Cid),
}

impl From<CarError> for ember_core::Error {
    fn from(e: CarError) -> Self {
        match e {
            CarError::HashMismatch(_) => ember_core::Error::Corruption(e.to_string()),
            other => ember_core::Error::SerializationError(other.to_string()),
        }
    }
}

/// Roots plus blocks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CarArchive {
    /// Root CIDs
    pub roots: Vec<Cid>,
    /// Blocks, in write order
    pub blocks: Vec<Block>,
}

impl CarArchive {
    /// Archive with the given roots and blocks.
    pub fn new(roots: Vec<Cid>, blocks: Vec<Block>) -> Self {
        Self { roots, blocks }
    }

    /// Look up a block by CID.
    pub fn get(&self, cid: &Cid) -> Option<&Block> {
        self.blocks.iter().find(|b| b.cid == *cid)
    }

    /// Encode to bytes.
    pub fn encode(&self) -> Result<Vec<u8>, CarError> {
        let header =
            rmp_serde::to_vec_named(&self.roots).map_err(|e| CarError::Header(e.to_string()))?;
        let body: usize = self
            .blocks
            .iter()
            .map(|b| 4 + CID_BYTES_LEN + b.bytes.len())
            .sum();
        let mut out = Vec::with_capacity(4 + header.len() + body);
        write_len(&mut out, header.len())?;
        out.extend_from_slice(&header);
        for block in &self.blocks {
            write_len(&mut out, CID_BYTES_LEN + block.bytes.len())?;
            out.extend_from_slice(&block.cid.to_bytes());
            out.extend_from_slice(&block.bytes);
        }
        Ok(out)
    }

    /// Encode and address the archive as a raw block.
    pub fn to_block(&self) -> Result<Block, CarError> {
        Ok(Block::raw(self.encode()?))
    }

    /// Decode bytes produced by [`CarArchive::encode`].
    pub fn decode(bytes: &[u8]) -> Result<Self, CarError> {
        let mut cursor = Cursor::new(bytes);
        let header = read_frame(&mut cursor)?
            .ok_or_else(|| CarError::Truncated("missing header".into()))?;
        let roots: Vec<Cid> =
            rmp_serde::from_slice(&header).map_err(|e| CarError::Header(e.to_string()))?;

        let mut blocks = Vec::new();
        while let Some(frame) = read_frame(&mut cursor)? {
            if frame.len() < CID_BYTES_LEN {
                return Err(CarError::Frame(format!(
                    "frame of {} bytes is shorter than a cid",
                    frame.len()
                )));
            }
            let cid = Cid::from_bytes(&frame[..CID_BYTES_LEN])
                .map_err(|e| CarError::Frame(e.to_string()))?;
            let block = Block::new(cid, frame[CID_BYTES_LEN..].to_vec());
            if !block.verify() {
                return Err(CarError::HashMismatch(cid));
            }
            blocks.push(block);
        }
        Ok(Self { roots, blocks })
    }
}

fn write_len(out: &mut Vec<u8>, len: usize) -> Result<(), CarError> {
    let len = u32::try_from(len).map_err(|_| CarError::TooLarge(len))?;
    out.write_u32::<LittleEndian>(len)
        .map_err(|e| CarError::Frame(e.to_string()))
}

/// Read one length-prefixed frame; `None` at a clean end of input.
fn read_frame(cursor: &mut Cursor<&[u8]>) -> Result<Option<Vec<u8>>, CarError> {
    let remaining = cursor.get_ref().len() as u64 - cursor.position();
    if remaining == 0 {
        return Ok(None);
    }
    let len = cursor
        .read_u32::<LittleEndian>()
        .map_err(|_| CarError::Truncated("incomplete length prefix".into()))? as usize;
    if len > MAX_FRAME {
        return Err(CarError::TooLarge(len));
    }
    let mut buf = vec![0u8; len];
    cursor
        .read_exact(&mut buf)
        .map_err(|_| CarError::Truncated(format!("frame of {} bytes cut short", len)))?;
    Ok(Some(buf))
}
