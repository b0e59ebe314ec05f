//! Replicas writing concurrently end up with the same head and documents.

use std::sync::Arc;

use emberdb::DocUpdate;
use serde_json::json;

use crate::common::{eventually, replica, shared_remote};

// ============================================================================
// Two replicas
// ============================================================================

#[tokio::test]
async fn test_two_replicas_converge() {
    let remote = Arc::new(shared_remote());
    let alice = replica("alice", remote.clone()).await;
    let bob = replica("bob", remote.clone()).await;

    alice.put("from-alice", json!("a")).await.unwrap();
    bob.put("from-bob", json!("b")).await.unwrap();

    let (a, b) = (&alice, &bob);
    let converged = eventually(|| async move {
        a.get("from-bob").await.unwrap().is_some()
            && b.get("from-alice").await.unwrap().is_some()
            && a.head() == b.head()
    })
    .await;
    assert!(converged, "alice {:?} bob {:?}", alice.head(), bob.head());
    assert_eq!(
        alice.all_docs().await.unwrap(),
        bob.all_docs().await.unwrap()
    );
}

#[tokio::test]
async fn test_conflicting_writes_resolve_identically() {
    let remote = Arc::new(shared_remote());
    let alice = replica("alice", remote.clone()).await;
    let bob = replica("bob", remote.clone()).await;

    alice.put("shared", json!({"by": "alice"})).await.unwrap();
    bob.put("shared", json!({"by": "bob"})).await.unwrap();

    let (a, b) = (&alice, &bob);
    let converged =
        eventually(|| async move { a.head() == b.head() && !a.head().is_empty() }).await;
    assert!(converged);
    let resolved = alice.get("shared").await.unwrap();
    assert!(resolved.is_some());
    assert_eq!(resolved, bob.get("shared").await.unwrap());
}

#[tokio::test]
async fn test_watchers_see_remote_documents() {
    let remote = Arc::new(shared_remote());
    let alice = replica("alice", remote.clone()).await;
    let bob = replica("bob", remote.clone()).await;
    let mut updates = bob.subscribe();

    alice
        .bulk(vec![
            DocUpdate::put("x", json!(1)),
            DocUpdate::put("y", json!(2)),
        ])
        .await
        .unwrap();

    let received = tokio::time::timeout(std::time::Duration::from_secs(2), updates.recv())
        .await
        .unwrap()
        .unwrap();
    let mut ids: Vec<String> = received.into_iter().map(|u| u.id).collect();
    ids.sort();
    assert_eq!(ids, vec!["x".to_string(), "y".to_string()]);
}

// ============================================================================
// Late joiners
// ============================================================================

#[tokio::test]
async fn test_late_replica_catches_up_on_open() {
    let remote = Arc::new(shared_remote());
    let alice = replica("alice", remote.clone()).await;
    for i in 0..4 {
        alice.put(format!("doc-{}", i), json!(i)).await.unwrap();
    }
    alice.delete("doc-0").await.unwrap();

    let carol = replica("carol", remote.clone()).await;
    assert_eq!(carol.head(), alice.head());
    assert_eq!(carol.all_docs().await.unwrap().len(), 3);
    assert_eq!(carol.get("doc-0").await.unwrap(), None);
}

#[tokio::test]
async fn test_late_replica_after_compaction() {
    let remote = Arc::new(shared_remote());
    let alice = replica("alice", remote.clone()).await;
    for i in 0..4 {
        alice.put(format!("doc-{}", i), json!(i)).await.unwrap();
    }
    alice.compact().await.unwrap();

    let carol = replica("carol", remote.clone()).await;
    assert_eq!(carol.head(), alice.head());
    assert_eq!(carol.all_docs().await.unwrap().len(), 4);
}
