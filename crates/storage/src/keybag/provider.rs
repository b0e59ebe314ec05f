//! Key bag persistence backends

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::KeyBagError;

/// One persisted key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredKey {
    /// Base64 key material
    pub key: String,
    /// Fingerprint as stored; repaired on load if it does not match `key`
    pub fingerprint: String,
    /// Default key for the name
    #[serde(default)]
    pub default: bool,
}

/// Persistence record for one named key set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeysItem {
    /// Key set name
    pub name: String,
    /// Keys by fingerprint
    #[serde(default)]
    pub keys: BTreeMap<String, StoredKey>,
}

/// Storage backend for key sets.
pub trait KeyBagProvider: Send + Sync {
    /// Load a key set, `None` if never stored.
    fn get(&self, name: &str) -> Result<Option<KeysItem>, KeyBagError>;

    /// Store a key set, replacing any previous record.
    fn set(&self, item: &KeysItem) -> Result<(), KeyBagError>;

    /// Remove a key set.
    fn del(&self, name: &str) -> Result<(), KeyBagError>;
}

/// In-memory provider, lost on drop.
#[derive(Debug, Default)]
pub struct MemoryKeyBagProvider {
    items: Mutex<HashMap<String, KeysItem>>,
}

impl MemoryKeyBagProvider {
    /// Create an empty provider
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyBagProvider for MemoryKeyBagProvider {
    fn get(&self, name: &str) -> Result<Option<KeysItem>, KeyBagError> {
        Ok(self.items.lock().get(name).cloned())
    }

    fn set(&self, item: &KeysItem) -> Result<(), KeyBagError> {
        self.items.lock().insert(item.name.clone(), item.clone());
        Ok(())
    }

    fn del(&self, name: &str) -> Result<(), KeyBagError> {
        self.items.lock().remove(name);
        Ok(())
    }
}

/// One pretty-printed JSON file per key set under a directory.
#[derive(Debug, Clone)]
pub struct FileKeyBagProvider {
    dir: PathBuf,
}

impl FileKeyBagProvider {
    /// Provider rooted at `dir`; the directory is created on first write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory holding the key files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, name: &str) -> PathBuf {
        let file: String = name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.json", file))
    }
}

impl KeyBagProvider for FileKeyBagProvider {
    fn get(&self, name: &str) -> Result<Option<KeysItem>, KeyBagError> {
        let path = self.path_for(name);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)?;
        let item = serde_json::from_str(&content)
            .map_err(|e| KeyBagError::Serialization(format!("{}: {}", path.display(), e)))?;
        Ok(Some(item))
    }

    fn set(&self, item: &KeysItem) -> Result<(), KeyBagError> {
        fs::create_dir_all(&self.dir)?;
        let content = serde_json::to_string_pretty(item)
            .map_err(|e| KeyBagError::Serialization(e.to_string()))?;
        fs::write(self.path_for(&item.name), content)?;
        Ok(())
    }

    fn del(&self, name: &str) -> Result<(), KeyBagError> {
        let path = self.path_for(name);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn item(name: &str) -> KeysItem {
        let mut keys = BTreeMap::new();
        keys.insert(
            "fp".to_string(),
            StoredKey {
                key: "a2V5".into(),
                fingerprint: "fp".into(),
                default: true,
            },
        );
        KeysItem {
            name: name.into(),
            keys,
        }
    }

    #[test]
    fn test_memory_provider() {
        let provider = MemoryKeyBagProvider::new();
        assert!(provider.get("db").unwrap().is_none());
        provider.set(&item("db")).unwrap();
        assert_eq!(provider.get("db").unwrap(), Some(item("db")));
        provider.del("db").unwrap();
        assert!(provider.get("db").unwrap().is_none());
    }

    #[test]
    fn test_file_provider_persists() {
        let dir = TempDir::new().unwrap();
        let provider = FileKeyBagProvider::new(dir.path().join("keys"));
        provider.set(&item("@db/main")).unwrap();

        let reopened = FileKeyBagProvider::new(dir.path().join("keys"));
        assert_eq!(reopened.get("@db/main").unwrap(), Some(item("@db/main")));

        reopened.del("@db/main").unwrap();
        assert!(reopened.get("@db/main").unwrap().is_none());
    }

    #[test]
    fn test_file_provider_rejects_garbage() {
        let dir = TempDir::new().unwrap();
        let provider = FileKeyBagProvider::new(dir.path());
        fs::write(dir.path().join("db.json"), "not json").unwrap();
        assert!(matches!(
            provider.get("db"),
            Err(KeyBagError::Serialization(_))
        ));
    }
}
