//! A remote that refuses writes never blocks local writes; the WAL keeps
//! the uploads until the remote is back.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use emberdb::durability::{
    Envelope, GatewayError, GatewayInterceptor, GatewayResult, Interception,
};
use emberdb::{Gateway, InterceptorGateway};
use serde_json::json;
use url::Url;

use crate::common::{eventually, replica, shared_remote};

#[derive(Default)]
struct Outage {
    down: AtomicBool,
}

#[async_trait]
impl GatewayInterceptor for Outage {
    async fn put(
        &self,
        url: Url,
        envelope: Envelope,
    ) -> GatewayResult<Interception<(Url, Envelope), ()>> {
        if self.down.load(Ordering::SeqCst) {
            return Err(GatewayError::Rejected("remote offline".into()));
        }
        Ok(Interception::Continue((url, envelope)))
    }
}

#[tokio::test]
async fn test_writes_survive_remote_outage() {
    let remote = shared_remote();
    let outage = Arc::new(Outage::default());
    let flaky: Arc<dyn Gateway> =
        Arc::new(InterceptorGateway::new(Arc::new(remote.clone()), outage.clone()));

    let alice = replica("alice", flaky).await;
    let bob = replica("bob", Arc::new(remote.clone())).await;

    outage.down.store(true, Ordering::SeqCst);
    alice.put("queued", json!("while offline")).await.unwrap();
    assert_eq!(alice.get("queued").await.unwrap(), Some(json!("while offline")));
    assert!(alice.loader().wal_len() > 0);
    assert!(alice.sync_remote().await.is_err());

    outage.down.store(false, Ordering::SeqCst);
    alice.sync_remote().await.unwrap();
    assert_eq!(alice.loader().wal_len(), 0);

    let reader = &bob;
    let arrived =
        eventually(|| async move { reader.get("queued").await.unwrap().is_some() }).await;
    assert!(arrived);
}
