//! Shared test utilities for the integration suites.
//!
//! Import via `#[path = "../common/mod.rs"] mod common;` from a suite's main.rs.

#![allow(dead_code)]

use std::future::Future;
use std::sync::{Arc, Once};
use std::time::Duration;

use emberdb::{Crdt, CrdtOptions, EngineConfig, Gateway, MemoryGateway};
use url::Url;

static INIT_TRACING: Once = Once::new();

/// Install a test subscriber honoring `RUST_LOG`.
pub fn init_tracing() {
    INIT_TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// URL of the shared remote.
pub fn remote_url() -> Url {
    Url::parse("memory://remote/shared").unwrap()
}

/// Open a replica named `name` on its own local memory gateway, synced
/// through `remote`.
pub async fn replica(name: &str, remote: Arc<dyn Gateway>) -> Crdt {
    replica_at(name, remote, remote_url()).await
}

/// Like [`replica`], with the remote rooted at `url`.
pub async fn replica_at(name: &str, remote: Arc<dyn Gateway>, url: Url) -> Crdt {
    init_tracing();
    let options = CrdtOptions::memory(name).unwrap().with_remote(remote, url);
    Crdt::open(EngineConfig::default(), options).await.unwrap()
}

/// A fresh shared remote.
pub fn shared_remote() -> MemoryGateway {
    MemoryGateway::new()
}

/// Poll `check` until it returns true or two seconds pass.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
