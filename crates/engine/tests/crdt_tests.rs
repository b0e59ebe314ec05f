//! Database lifecycle tests
//!
//! Reopening from disk, encryption at rest, files, configuration.

use std::sync::Arc;

use ember_core::{Codec, DocUpdate, Error};
use ember_durability::{FileGateway, Gateway, MemoryGateway};
use ember_engine::{Crdt, CrdtOptions, EngineConfig, CONFIG_FILE_NAME};
use ember_storage::keybag::FileKeyBagProvider;
use ember_storage::KeyBag;
use serde_json::json;
use tempfile::TempDir;
use url::Url;

fn dir_url(dir: &TempDir) -> Url {
    Url::from_directory_path(dir.path().join("db")).unwrap()
}

fn file_options(dir: &TempDir) -> CrdtOptions {
    CrdtOptions::new(Arc::new(FileGateway::new()), dir_url(dir))
}

fn encrypted() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.encryption.enabled = true;
    config
}

// ============================================================================
// Persistence
// ============================================================================

#[tokio::test]
async fn test_reopen_from_disk() {
    let dir = TempDir::new().unwrap();
    {
        let db = Crdt::open(EngineConfig::default(), file_options(&dir))
            .await
            .unwrap();
        db.put("a", json!("hello")).await.unwrap();
        db.put("b", json!("world")).await.unwrap();
        db.delete("b").await.unwrap();
        db.close().await;
    }

    let db = Crdt::open(EngineConfig::default(), file_options(&dir))
        .await
        .unwrap();
    assert_eq!(db.get("a").await.unwrap(), Some(json!("hello")));
    assert_eq!(db.get("b").await.unwrap(), None);
    assert_eq!(db.loader().car_log().len(), 3);

    db.put("c", json!(3)).await.unwrap();
    assert_eq!(db.all_docs().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_compacted_database_reopens() {
    let dir = TempDir::new().unwrap();
    let head = {
        let db = Crdt::open(EngineConfig::default(), file_options(&dir))
            .await
            .unwrap();
        for i in 0..5 {
            db.put(format!("k{}", i), json!(i)).await.unwrap();
        }
        db.compact().await.unwrap();
        db.head()
    };

    let db = Crdt::open(EngineConfig::default(), file_options(&dir))
        .await
        .unwrap();
    assert_eq!(db.head(), head);
    assert_eq!(db.all_docs().await.unwrap().len(), 5);
    assert_eq!(db.loader().car_log().len(), 1);
}

// ============================================================================
// Encryption
// ============================================================================

#[tokio::test]
async fn test_encrypted_database_reopens_with_same_keys() {
    let dir = TempDir::new().unwrap();
    let keys = || KeyBag::new(Arc::new(FileKeyBagProvider::new(dir.path().join("keys"))));

    {
        let db = Crdt::open(encrypted(), file_options(&dir).with_keybag(keys()))
            .await
            .unwrap();
        db.put("secret", json!({"pin": 1234})).await.unwrap();
    }

    let db = Crdt::open(encrypted(), file_options(&dir).with_keybag(keys()))
        .await
        .unwrap();
    assert_eq!(db.get("secret").await.unwrap(), Some(json!({"pin": 1234})));
}

#[tokio::test]
async fn test_encrypted_database_rejects_other_keys() {
    let gateway = MemoryGateway::new();
    let url = Url::parse("memory://ember/locked").unwrap();
    {
        let db = Crdt::open(
            encrypted(),
            CrdtOptions::new(Arc::new(gateway.clone()), url.clone()),
        )
        .await
        .unwrap();
        db.put("secret", json!("value")).await.unwrap();
    }

    // a fresh in-memory key bag holds a different random key
    let result = Crdt::open(encrypted(), CrdtOptions::new(Arc::new(gateway), url)).await;
    assert!(matches!(result, Err(Error::CodecError(_))));
}

#[tokio::test]
async fn test_convergent_nonce_gives_stable_cars() {
    let keybag = KeyBag::memory();
    let mut cars = Vec::new();
    for name in ["one", "two"] {
        let db = Crdt::open(
            encrypted(),
            CrdtOptions::memory(name).unwrap().with_keybag(keybag.clone()),
        )
        .await
        .unwrap();
        db.put("same", json!("content")).await.unwrap();
        cars.push(db.loader().car_log());
    }
    assert_eq!(cars[0], cars[1]);
}

// ============================================================================
// Files
// ============================================================================

#[tokio::test]
async fn test_files_are_encrypted_unless_public() {
    let db = Crdt::open(encrypted(), CrdtOptions::memory("files").unwrap())
        .await
        .unwrap();
    let private = db.put_file(b"attachment".to_vec(), false).await.unwrap();
    let public = db.put_file(b"avatar".to_vec(), true).await.unwrap();
    assert_eq!(private.codec(), Codec::Encrypted);
    assert_eq!(public.codec(), Codec::Raw);
    assert_eq!(db.get_file(&private).await.unwrap(), b"attachment".to_vec());
    assert_eq!(db.get_file(&public).await.unwrap(), b"avatar".to_vec());
}

// ============================================================================
// Configuration
// ============================================================================

#[tokio::test]
async fn test_open_with_config_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join(CONFIG_FILE_NAME);
    EngineConfig::write_default_if_missing(&path).unwrap();

    let mut config = EngineConfig::from_file(&path).unwrap();
    assert_eq!(config, EngineConfig::default());
    config.write_queue.chunk_size = 1;
    config.compaction.strategy = "No-Op".to_string();
    config.write_to_file(&path).unwrap();

    let config = EngineConfig::from_file(&path).unwrap();
    let db = Crdt::open(config, CrdtOptions::memory("configured").unwrap())
        .await
        .unwrap();
    db.bulk(vec![DocUpdate::put("x", json!(1))]).await.unwrap();
    let report = db.compact().await.unwrap();
    assert!(!report.replaced);
}

#[tokio::test]
async fn test_destroyed_gateway_starts_empty() {
    let dir = TempDir::new().unwrap();
    {
        let db = Crdt::open(EngineConfig::default(), file_options(&dir))
            .await
            .unwrap();
        db.put("gone", json!(true)).await.unwrap();
    }
    FileGateway::new().destroy(&dir_url(&dir)).await.unwrap();

    let db = Crdt::open(EngineConfig::default(), file_options(&dir))
        .await
        .unwrap();
    assert!(db.head().is_empty());
    assert_eq!(db.get("gone").await.unwrap(), None);
}
