//! In-memory gateway
//!
//! Envelopes are stored encoded, keyed by URL without query. Clones share
//! the same map, so several engines can sync through one `MemoryGateway`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;
use url::Url;

use super::{accepted_types, storage_key, Gateway, GatewayError, GatewayResult, Subscription};
use crate::envelope::Envelope;

type Subscribers = HashMap<String, Vec<(u64, mpsc::UnboundedSender<Envelope>)>>;

#[derive(Debug, Default)]
struct Shared {
    data: Mutex<HashMap<String, Vec<u8>>>,
    subscribers: Mutex<Subscribers>,
    next_id: AtomicU64,
}

/// Gateway backed by a shared in-memory map.
#[derive(Debug, Clone, Default)]
pub struct MemoryGateway {
    shared: Arc<Shared>,
}

impl MemoryGateway {
    /// Create an empty gateway
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored values.
    pub fn len(&self) -> usize {
        self.shared.data.lock().len()
    }

    /// True if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stored keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.shared.data.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Number of live subscriptions on `url`.
    pub fn subscriber_count(&self, url: &Url) -> usize {
        self.shared
            .subscribers
            .lock()
            .get(&storage_key(url))
            .map_or(0, Vec::len)
    }

    fn notify(&self, key: &str, envelope: &Envelope) {
        let mut subscribers = self.shared.subscribers.lock();
        if let Some(list) = subscribers.get_mut(key) {
            list.retain(|(_, tx)| tx.send(envelope.clone()).is_ok());
            debug!(target: "ember::gateway", key, subscribers = list.len(), "Meta delivered");
        }
    }
}

fn unsubscribe(shared: Weak<Shared>, key: String, id: u64) {
    if let Some(shared) = shared.upgrade() {
        let mut subscribers = shared.subscribers.lock();
        if let Some(list) = subscribers.get_mut(&key) {
            list.retain(|(sid, _)| *sid != id);
            if list.is_empty() {
                subscribers.remove(&key);
            }
        }
    }
}

#[async_trait]
impl Gateway for MemoryGateway {
    async fn start(&self, url: &Url) -> GatewayResult<Url> {
        Ok(url.clone())
    }

    async fn close(&self, _url: &Url) -> GatewayResult<()> {
        Ok(())
    }

    async fn delete(&self, url: &Url) -> GatewayResult<()> {
        self.shared.data.lock().remove(&storage_key(url));
        Ok(())
    }

    async fn destroy(&self, url: &Url) -> GatewayResult<()> {
        let prefix = storage_key(url);
        let mut data = self.shared.data.lock();
        let before = data.len();
        data.retain(|k, _| !k.starts_with(&prefix));
        debug!(target: "ember::gateway", prefix = %prefix, removed = before - data.len(), "Destroyed");
        Ok(())
    }

    async fn put(&self, url: &Url, envelope: Envelope) -> GatewayResult<()> {
        let key = storage_key(url);
        let bytes = envelope.encode()?;
        debug!(target: "ember::gateway", key = %key, kind = %envelope.kind(), bytes = bytes.len(), "put");
        self.shared.data.lock().insert(key.clone(), bytes);
        if matches!(envelope, Envelope::Meta(_)) {
            self.notify(&key, &envelope);
        }
        Ok(())
    }

    async fn get(&self, url: &Url) -> GatewayResult<Envelope> {
        let key = storage_key(url);
        let bytes = self
            .shared
            .data
            .lock()
            .get(&key)
            .cloned()
            .ok_or_else(|| GatewayError::NotFound(key.clone()))?;
        Ok(Envelope::decode(&bytes, &accepted_types(url))?)
    }

    async fn subscribe(&self, url: &Url) -> GatewayResult<Subscription> {
        let key = storage_key(url);
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared
            .subscribers
            .lock()
            .entry(key.clone())
            .or_default()
            .push((id, tx));
        let weak = Arc::downgrade(&self.shared);
        Ok(Subscription::new(rx, move || unsubscribe(weak, key, id)))
    }
}
