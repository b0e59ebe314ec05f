//! Named encryption keys
//!
//! A key bag maps a name (usually a store name) to a set of 32-byte keys
//! indexed by fingerprint, exactly one of which is the default. The
//! fingerprint is the lowercase base32 SHA-256 of the key material.
//!
//! Loading a set repairs stored fingerprints that do not match their key and
//! makes sure exactly one key is the default; a repaired set is written back.

mod provider;

pub use provider::{FileKeyBagProvider, KeyBagProvider, KeysItem, MemoryKeyBagProvider, StoredKey};

use std::collections::BTreeMap;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::codec::KEY_LEN;

/// Key bag errors.
#[derive(Debug, thiserror::Error)]
pub enum KeyBagError {
    /// Named key set does not exist and creation was not requested
    #[error("Key set not found: {0}")]
    NotFound(String),

    /// Key material could not be decoded or has the wrong length
    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    /// Provider I/O failure
    #[error("Key bag I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Persistence record could not be (de)serialized
    #[error("Key bag serialization error: {0}")]
    Serialization(String),
}

impl From<KeyBagError> for ember_core::Error {
    fn from(e: KeyBagError) -> Self {
        match e {
            KeyBagError::Io(io) => ember_core::Error::IoError(io),
            other => ember_core::Error::CodecError(other.to_string()),
        }
    }
}

/// Fingerprint of key material.
pub fn fingerprint(material: &[u8]) -> String {
    data_encoding::BASE32_NOPAD
        .encode(&Sha256::digest(material))
        .to_ascii_lowercase()
}

/// A key together with its fingerprint.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyWithFingerprint {
    material: [u8; KEY_LEN],
    fingerprint: String,
    default: bool,
}

impl KeyWithFingerprint {
    fn new(material: [u8; KEY_LEN], default: bool) -> Self {
        Self {
            fingerprint: fingerprint(&material),
            material,
            default,
        }
    }

    /// Raw key material.
    pub fn material(&self) -> &[u8; KEY_LEN] {
        &self.material
    }

    /// Fingerprint of the material.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// True for the default key of its set.
    pub fn is_default(&self) -> bool {
        self.default
    }

    fn to_stored(&self) -> StoredKey {
        StoredKey {
            key: STANDARD.encode(self.material),
            fingerprint: self.fingerprint.clone(),
            default: self.default,
        }
    }
}

impl std::fmt::Debug for KeyWithFingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyWithFingerprint")
            .field("fingerprint", &self.fingerprint)
            .field("default", &self.default)
            .finish_non_exhaustive()
    }
}

/// Decode base64 key material.
pub fn decode_material(encoded: &str) -> Result<[u8; KEY_LEN], KeyBagError> {
    let bytes = STANDARD
        .decode(encoded)
        .map_err(|e| KeyBagError::InvalidKey(e.to_string()))?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| KeyBagError::InvalidKey(format!("expected {} bytes, got {}", KEY_LEN, bytes.len())))
}

/// Result of [`KeysByFingerprint::upsert`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpsertResult {
    /// True if the set changed
    pub modified: bool,
    /// Fingerprint of the upserted key
    pub fingerprint: String,
}

/// The keys stored under one name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeysByFingerprint {
    name: String,
    keys: BTreeMap<String, KeyWithFingerprint>,
}

impl KeysByFingerprint {
    fn empty(name: &str) -> Self {
        Self {
            name: name.to_string(),
            keys: BTreeMap::new(),
        }
    }

    /// Rebuild a set from its record. Returns the set and whether it needed
    /// repair.
    fn from_item(item: &KeysItem) -> Result<(Self, bool), KeyBagError> {
        let mut set = Self::empty(&item.name);
        let mut modified = false;
        for (fp, stored) in &item.keys {
            let material = decode_material(&stored.key)?;
            let key = KeyWithFingerprint::new(material, stored.default);
            if key.fingerprint != *fp || key.fingerprint != stored.fingerprint {
                warn!(
                    target: "ember::store",
                    name = %item.name,
                    stored = %stored.fingerprint,
                    calculated = %key.fingerprint,
                    "Key fingerprint mismatch repaired"
                );
                modified = true;
            }
            set.keys.insert(key.fingerprint.clone(), key);
        }
        modified |= set.ensure_single_default();
        Ok((set, modified))
    }

    /// Keep the first default in fingerprint order; promote the first key
    /// when none is marked.
    fn ensure_single_default(&mut self) -> bool {
        let mut modified = false;
        let mut seen = false;
        for key in self.keys.values_mut() {
            if key.default {
                if seen {
                    key.default = false;
                    modified = true;
                }
                seen = true;
            }
        }
        if !seen {
            if let Some(first) = self.keys.values_mut().next() {
                first.default = true;
                modified = true;
            }
        }
        modified
    }

    /// Set name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of keys.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// True if the set holds no keys.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Look up a key; `None` or `"*"` selects the default.
    pub fn get(&self, fingerprint: Option<&str>) -> Option<&KeyWithFingerprint> {
        match fingerprint {
            None | Some("*") => self.default_key(),
            Some(fp) => {
                let found = self.keys.get(fp);
                if found.is_none() {
                    warn!(target: "ember::store", name = %self.name, fingerprint = fp, "Key not found");
                }
                found
            }
        }
    }

    /// The default key.
    pub fn default_key(&self) -> Option<&KeyWithFingerprint> {
        self.keys.values().find(|k| k.default)
    }

    /// Add a key, or change whether an existing key is the default.
    ///
    /// Making a key the default clears the previous default. The first key
    /// of an empty set always becomes the default.
    pub fn upsert(&mut self, material: [u8; KEY_LEN], default: bool) -> UpsertResult {
        let key = KeyWithFingerprint::new(material, default);
        let fp = key.fingerprint.clone();
        if let Some(found) = self.keys.get(&fp) {
            if found.default || !default {
                return UpsertResult {
                    modified: false,
                    fingerprint: fp,
                };
            }
        }
        let make_default = default || self.keys.is_empty();
        if make_default {
            for existing in self.keys.values_mut() {
                existing.default = false;
            }
        }
        let mut key = key;
        key.default = make_default;
        self.keys.insert(fp.clone(), key);
        UpsertResult {
            modified: true,
            fingerprint: fp,
        }
    }

    /// Persistence record.
    pub fn to_item(&self) -> KeysItem {
        KeysItem {
            name: self.name.clone(),
            keys: self
                .keys
                .iter()
                .map(|(fp, k)| (fp.clone(), k.to_stored()))
                .collect(),
        }
    }
}

/// Named key sets over a [`KeyBagProvider`].
#[derive(Clone)]
pub struct KeyBag {
    provider: Arc<dyn KeyBagProvider>,
}

impl KeyBag {
    /// Key bag over `provider`.
    pub fn new(provider: Arc<dyn KeyBagProvider>) -> Self {
        Self { provider }
    }

    /// Key bag that lives in memory only.
    pub fn memory() -> Self {
        Self::new(Arc::new(MemoryKeyBagProvider::new()))
    }

    /// Load the set stored under `name`.
    ///
    /// A missing set fails with `KeyBagError::NotFound` when
    /// `fail_if_missing`, otherwise a set holding one fresh random default
    /// key is created and stored.
    pub fn get_named_key(
        &self,
        name: &str,
        fail_if_missing: bool,
    ) -> Result<KeysByFingerprint, KeyBagError> {
        match self.provider.get(name)? {
            Some(item) => {
                let (set, modified) = KeysByFingerprint::from_item(&item)?;
                if modified {
                    self.provider.set(&set.to_item())?;
                }
                Ok(set)
            }
            None if fail_if_missing => Err(KeyBagError::NotFound(name.to_string())),
            None => {
                let mut material = [0u8; KEY_LEN];
                OsRng.fill_bytes(&mut material);
                let mut set = KeysByFingerprint::empty(name);
                let result = set.upsert(material, true);
                self.provider.set(&set.to_item())?;
                debug!(target: "ember::store", name, fingerprint = %result.fingerprint, "Key set created");
                Ok(set)
            }
        }
    }

    /// Add `material` to the set `name` (created if missing) and persist.
    pub fn upsert(
        &self,
        name: &str,
        material: [u8; KEY_LEN],
        default: bool,
    ) -> Result<UpsertResult, KeyBagError> {
        let mut set = match self.provider.get(name)? {
            Some(item) => KeysByFingerprint::from_item(&item)?.0,
            None => KeysByFingerprint::empty(name),
        };
        let result = set.upsert(material, default);
        if result.modified {
            self.provider.set(&set.to_item())?;
        }
        Ok(result)
    }

    /// Drop the set `name`.
    pub fn remove(&self, name: &str) -> Result<(), KeyBagError> {
        self.provider.del(name)
    }
}

impl std::fmt::Debug for KeyBag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyBag").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_fingerprint_is_deterministic() {
        assert_eq!(fingerprint(&[1u8; 32]), fingerprint(&[1u8; 32]));
        assert_ne!(fingerprint(&[1u8; 32]), fingerprint(&[2u8; 32]));
        let fp = fingerprint(&[1u8; 32]);
        assert_eq!(fp, fp.to_ascii_lowercase());
    }

    #[test]
    fn test_get_named_key_creates_default() {
        let bag = KeyBag::memory();
        let set = bag.get_named_key("db", false).unwrap();
        assert_eq!(set.len(), 1);
        let default = set.default_key().unwrap();
        assert_eq!(set.get(Some("*")), Some(default));

        let again = bag.get_named_key("db", true).unwrap();
        assert_eq!(again, set);
    }

    #[test]
    fn test_get_named_key_fail_if_missing() {
        let bag = KeyBag::memory();
        assert!(matches!(
            bag.get_named_key("missing", true),
            Err(KeyBagError::NotFound(_))
        ));
    }

    #[test]
    fn test_upsert_default_clears_previous() {
        let bag = KeyBag::memory();
        let first = bag.upsert("db", [1u8; 32], false).unwrap();
        assert!(first.modified);
        let second = bag.upsert("db", [2u8; 32], true).unwrap();

        let set = bag.get_named_key("db", true).unwrap();
        assert_eq!(set.len(), 2);
        assert_eq!(set.default_key().unwrap().fingerprint(), second.fingerprint);
        assert!(!set.get(Some(&first.fingerprint)).unwrap().is_default());
    }

    #[test]
    fn test_first_key_becomes_default() {
        let mut set = KeysByFingerprint::empty("db");
        let result = set.upsert([5u8; 32], false);
        assert!(set.get(Some(&result.fingerprint)).unwrap().is_default());
    }

    #[test]
    fn test_upsert_same_key_unmodified() {
        let mut set = KeysByFingerprint::empty("db");
        set.upsert([5u8; 32], true);
        assert!(!set.upsert([5u8; 32], true).modified);
        assert!(!set.upsert([5u8; 32], false).modified);
    }

    #[test]
    fn test_load_repairs_fingerprint_and_default() {
        let provider = Arc::new(MemoryKeyBagProvider::new());
        let material = [3u8; 32];
        let mut keys = BTreeMap::new();
        keys.insert(
            "wrong".to_string(),
            StoredKey {
                key: STANDARD.encode(material),
                fingerprint: "wrong".into(),
                default: false,
            },
        );
        provider
            .set(&KeysItem {
                name: "db".into(),
                keys,
            })
            .unwrap();

        let bag = KeyBag::new(provider.clone());
        let set = bag.get_named_key("db", true).unwrap();
        let key = set.default_key().unwrap();
        assert_eq!(key.fingerprint(), fingerprint(&material));

        let stored = provider.get("db").unwrap().unwrap();
        assert!(stored.keys.contains_key(&fingerprint(&material)));
        assert!(!stored.keys.contains_key("wrong"));
    }

    #[test]
    fn test_invalid_material_rejected() {
        assert!(matches!(
            decode_material("AAAA"),
            Err(KeyBagError::InvalidKey(_))
        ));
    }

    #[test]
    fn test_file_key_bag_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let bag = KeyBag::new(Arc::new(FileKeyBagProvider::new(dir.path())));
        let created = bag.get_named_key("db", false).unwrap();

        let reopened = KeyBag::new(Arc::new(FileKeyBagProvider::new(dir.path())));
        let loaded = reopened.get_named_key("db", true).unwrap();
        assert_eq!(
            loaded.default_key().unwrap().material(),
            created.default_key().unwrap().material()
        );
    }
}
