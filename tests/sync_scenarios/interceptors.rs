//! Remotes reached through an interceptor chain.

use std::sync::Arc;

use emberdb::durability::GatewayError;
use emberdb::{Gateway, InterceptorGateway, UriInterceptor};
use serde_json::json;
use url::Url;

use crate::common::{eventually, replica, replica_at, shared_remote};

/// Route `memory://logical/...` to the shared remote host and tag every
/// request with an auth token.
fn routed(inner: Arc<dyn Gateway>) -> Arc<dyn Gateway> {
    let interceptor = UriInterceptor::new()
        .with_mapper(|mut url: Url| {
            if url.host_str() == Some("logical") {
                url.set_host(Some("remote"))
                    .map_err(|e| GatewayError::InvalidUrl(e.to_string()))?;
            }
            Ok(url)
        })
        .with_mapper(|mut url: Url| {
            url.query_pairs_mut().append_pair("token", "secret");
            Ok(url)
        });
    Arc::new(InterceptorGateway::new(inner, Arc::new(interceptor)))
}

#[tokio::test]
async fn test_replicas_sync_through_uri_interceptor() {
    let remote = shared_remote();
    let logical = Url::parse("memory://logical/shared").unwrap();
    let alice = replica_at("alice", routed(Arc::new(remote.clone())), logical).await;
    let bob = replica("bob", Arc::new(remote.clone())).await;

    alice.put("routed", json!(true)).await.unwrap();
    let reader = &bob;
    let arrived =
        eventually(|| async move { reader.get("routed").await.unwrap().is_some() }).await;
    assert!(arrived);
    assert!(!remote.is_empty());
    assert!(remote
        .keys()
        .iter()
        .all(|key| key.starts_with("memory://remote/shared/")));
}
