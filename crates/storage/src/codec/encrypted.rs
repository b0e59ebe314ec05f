//! ChaCha20-Poly1305 block encryption.
//!
//! Plaintext frame: `len32le(cid) || cid || payload`, where `cid` is the
//! binary form of the plaintext block's CID. Encoded bytes are
//! `nonce(12) || ciphertext+tag`; the encrypted block's CID hashes those
//! bytes, so addressing is over ciphertext.
//!
//! With [`NonceSource::Convergent`] the nonce is derived from
//! `sha256(key || cid || payload)`, so the same plaintext under the same key
//! always encrypts to the same bytes and the same CID.

use byteorder::{ByteOrder, LittleEndian};
use chacha20poly1305::aead::Aead;
use chacha20poly1305::{ChaCha20Poly1305, Key, KeyInit, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

use super::traits::{BlockCodec, CodecError};
use ember_core::{Block, Cid, Codec, CID_BYTES_LEN};

/// Nonce length in bytes (96 bits).
pub const NONCE_LEN: usize = 12;

/// Key length in bytes (256 bits).
pub const KEY_LEN: usize = 32;

/// Where the per-block nonce comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NonceSource {
    /// Fresh OS randomness per call. CIDs differ across calls.
    Random,
    /// Derived from key, CID and payload. Stable CIDs across peers.
    #[default]
    Convergent,
}

impl NonceSource {
    fn nonce(&self, key: &[u8; KEY_LEN], cid: &Cid, payload: &[u8]) -> [u8; NONCE_LEN] {
        let mut nonce = [0u8; NONCE_LEN];
        match self {
            NonceSource::Random => OsRng.fill_bytes(&mut nonce),
            NonceSource::Convergent => {
                let mut hasher = Sha256::new();
                hasher.update(key);
                hasher.update(cid.to_bytes());
                hasher.update(payload);
                let digest = hasher.finalize();
                nonce.copy_from_slice(&digest[..NONCE_LEN]);
            }
        }
        nonce
    }
}

/// Ciphertext plus the nonce it was sealed with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedBlock {
    /// Ciphertext with the 16-byte Poly1305 tag appended
    pub cipher: Vec<u8>,
    /// 96-bit nonce
    pub nonce: [u8; NONCE_LEN],
}

impl EncryptedBlock {
    /// `nonce || cipher`
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(NONCE_LEN + self.cipher.len());
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.cipher);
        out
    }

    /// Split encoded bytes into nonce and ciphertext.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.len() < NONCE_LEN {
            return Err(CodecError::Malformed(format!(
                "encrypted block shorter than nonce ({} bytes)",
                bytes.len()
            )));
        }
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&bytes[..NONCE_LEN]);
        Ok(Self {
            cipher: bytes[NONCE_LEN..].to_vec(),
            nonce,
        })
    }
}

fn frame(cid: &Cid, payload: &[u8]) -> Vec<u8> {
    let cid_bytes = cid.to_bytes();
    let mut out = Vec::with_capacity(4 + CID_BYTES_LEN + payload.len());
    let mut len = [0u8; 4];
    LittleEndian::write_u32(&mut len, CID_BYTES_LEN as u32);
    out.extend_from_slice(&len);
    out.extend_from_slice(&cid_bytes);
    out.extend_from_slice(payload);
    out
}

fn unframe(plain: &[u8]) -> Result<(Cid, Vec<u8>), CodecError> {
    if plain.len() < 4 {
        return Err(CodecError::Malformed("frame shorter than length prefix".into()));
    }
    let cid_len = LittleEndian::read_u32(&plain[..4]) as usize;
    let rest = &plain[4..];
    if rest.len() < cid_len {
        return Err(CodecError::Malformed(format!(
            "cid length {} exceeds frame ({} bytes)",
            cid_len,
            rest.len()
        )));
    }
    let cid = Cid::from_bytes(&rest[..cid_len]).map_err(|e| CodecError::Malformed(e.to_string()))?;
    Ok((cid, rest[cid_len..].to_vec()))
}

/// Seal `payload` (addressed by `cid`) under `key`.
pub fn encrypt(
    key: &[u8; KEY_LEN],
    cid: &Cid,
    payload: &[u8],
    nonce_source: NonceSource,
) -> Result<EncryptedBlock, CodecError> {
    let nonce = nonce_source.nonce(key, cid, payload);
    let aead = ChaCha20Poly1305::new(Key::from_slice(key));
    let cipher = aead
        .encrypt(Nonce::from_slice(&nonce), frame(cid, payload).as_slice())
        .map_err(|e| CodecError::Encrypt(e.to_string()))?;
    Ok(EncryptedBlock { cipher, nonce })
}

/// Open an [`EncryptedBlock`], returning the plaintext CID and payload.
pub fn decrypt(key: &[u8; KEY_LEN], block: &EncryptedBlock) -> Result<(Cid, Vec<u8>), CodecError> {
    let aead = ChaCha20Poly1305::new(Key::from_slice(key));
    let plain = aead
        .decrypt(Nonce::from_slice(&block.nonce), block.cipher.as_slice())
        .map_err(|_| CodecError::Decrypt("authentication failed".into()))?;
    unframe(&plain)
}

/// Codec that seals every block with ChaCha20-Poly1305.
#[derive(Clone)]
pub struct EncryptedCodec {
    key: [u8; KEY_LEN],
    nonce_source: NonceSource,
}

impl EncryptedCodec {
    /// Codec for `key` with the given nonce policy.
    pub fn new(key: [u8; KEY_LEN], nonce_source: NonceSource) -> Self {
        Self { key, nonce_source }
    }

    /// Nonce policy in use.
    pub fn nonce_source(&self) -> NonceSource {
        self.nonce_source
    }
}

impl std::fmt::Debug for EncryptedCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptedCodec")
            .field("nonce_source", &self.nonce_source)
            .finish_non_exhaustive()
    }
}

impl BlockCodec for EncryptedCodec {
    fn encode(&self, block: &Block) -> Result<Block, CodecError> {
        let sealed = encrypt(&self.key, &block.cid, &block.bytes, self.nonce_source)?;
        let bytes = sealed.to_bytes();
        Ok(Block::new(Cid::hash(Codec::Encrypted, &bytes), bytes))
    }

    fn decode(&self, block: &Block) -> Result<Block, CodecError> {
        if block.cid.codec() != Codec::Encrypted {
            return Err(CodecError::Malformed(format!(
                "{} is not an encrypted block",
                block.cid
            )));
        }
        let sealed = EncryptedBlock::from_bytes(&block.bytes)?;
        let (cid, payload) = decrypt(&self.key, &sealed)?;
        if !cid.matches(&payload) {
            return Err(CodecError::Malformed(format!(
                "decrypted payload does not hash to {}",
                cid
            )));
        }
        Ok(Block::new(cid, payload))
    }

    fn codec_id(&self) -> &str {
        "chacha20-poly1305"
    }
}
