use crate::helpers::*;
use peerlog::access::WriteAccess;
use peerlog::database::{Database, DatabaseEvent, DatabaseOptions};
use peerlog::pubsub::{MemoryPubSub, PubSubNetwork};
use peerlog::storage::{MemoryBlockService, MemoryStorage, Storage};
use serde_json::json;
use std::sync::Arc;

#[tokio::test]
async fn test_broadcast_replicates_writes() {
    init_tracing();
    let pubsub = PubSubNetwork::new();
    let blocks = MemoryBlockService::new();
    let alice = open_database("db", "alice", &pubsub, &blocks).await;
    let bob = open_database("db", "bob", &pubsub, &blocks).await;
    let mut bob_events = bob.subscribe();

    let entry = alice.add_operation(json!({"op": "ADD", "value": 1})).await.unwrap();

    match next_entry_event(&mut bob_events).await {
        DatabaseEvent::Sync(synced) => assert_eq!(synced.hash(), entry.hash()),
        other => panic!("expected sync, got {other:?}"),
    }
    match next_entry_event(&mut bob_events).await {
        DatabaseEvent::Update(updated) => assert_eq!(updated.hash(), entry.hash()),
        other => panic!("expected update, got {other:?}"),
    }
    assert_eq!(bob.log().values().await, alice.log().values().await);
}

#[tokio::test]
async fn test_both_peers_converge_on_concurrent_writes() {
    let pubsub = PubSubNetwork::new();
    let blocks = MemoryBlockService::new();
    let alice = open_database("db", "alice", &pubsub, &blocks).await;
    let bob = open_database("db", "bob", &pubsub, &blocks).await;

    for i in 0..5 {
        alice.add_operation(json!(format!("a{i}"))).await.unwrap();
        bob.add_operation(json!(format!("b{i}"))).await.unwrap();
    }

    wait_for_len(alice.log(), 10).await;
    wait_for_len(bob.log(), 10).await;
    assert_eq!(alice.log().values().await, bob.log().values().await);
}

#[tokio::test]
async fn test_unauthorized_remote_entry_becomes_error_event() {
    let pubsub = PubSubNetwork::new();
    let owner = identity();
    let guarded = Database::open(
        DatabaseOptions::new(
            "guarded",
            owner.clone(),
            Arc::new(MemoryPubSub::new("owner", &pubsub)),
        )
        .access(Arc::new(WriteAccess::owner_only(owner.id()))),
    )
    .await
    .unwrap();
    let mut events = guarded.subscribe();

    let intruder = Database::open(DatabaseOptions::new(
        "guarded",
        identity(),
        Arc::new(MemoryPubSub::new("intruder", &pubsub)),
    ))
    .await
    .unwrap();
    intruder.add_operation(json!("spam")).await.unwrap();

    match next_entry_event(&mut events).await {
        DatabaseEvent::Error(error) => {
            assert!(matches!(*error, peerlog::Error::PermissionDenied(_)))
        }
        other => panic!("expected error, got {other:?}"),
    }
    assert!(guarded.log().is_empty().await);

    // The owner can still write
    guarded.add_operation(json!("legit")).await.unwrap();
    assert_eq!(guarded.log().len().await, 1);
}

#[tokio::test]
async fn test_local_write_errors_propagate() {
    let pubsub = PubSubNetwork::new();
    let db = Database::open(
        DatabaseOptions::new(
            "locked",
            identity(),
            Arc::new(MemoryPubSub::new("alice", &pubsub)),
        )
        .access(Arc::new(WriteAccess::owner_only("someone-else"))),
    )
    .await
    .unwrap();

    assert!(matches!(
        db.add_operation(json!("x")).await,
        Err(peerlog::Error::PermissionDenied(_))
    ));
}

#[tokio::test]
async fn test_reopen_keeps_entries_and_heads_records() {
    let pubsub = PubSubNetwork::new();
    let writer = identity();
    let entries: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
    let heads: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
    let cache: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
    let options = DatabaseOptions::new(
        "db",
        writer,
        Arc::new(MemoryPubSub::new("alice", &pubsub)),
    )
    .entries(entries)
    .heads(heads)
    .cache(cache);

    let db = Database::open(options.clone()).await.unwrap();
    let mut events = db.subscribe();
    let entry = db.add_operation(json!("kept")).await.unwrap();
    db.close().await.unwrap();
    assert!(matches!(next_entry_event(&mut events).await, DatabaseEvent::Update(_)));
    assert!(matches!(next_entry_event(&mut events).await, DatabaseEvent::Closed));

    let reopened = Database::open(options).await.unwrap();
    assert_eq!(reopened.log().len().await, 1);
    let offered = reopened.exchange_heads().await.unwrap();
    assert_eq!(offered.len(), 1);
    assert_eq!(offered[0].hash(), entry.hash());
}

#[tokio::test]
async fn test_destroy_removes_everything() {
    let pubsub = PubSubNetwork::new();
    let cache = Arc::new(MemoryStorage::new());
    let db = Database::open(
        DatabaseOptions::new(
            "db",
            identity(),
            Arc::new(MemoryPubSub::new("alice", &pubsub)),
        )
        .cache(cache.clone()),
    )
    .await
    .unwrap();
    let mut events = db.subscribe();
    db.add_operation(json!("gone")).await.unwrap();

    db.destroy().await.unwrap();
    assert!(db.log().is_empty().await);
    assert!(cache.is_empty().unwrap());
    assert!(matches!(next_entry_event(&mut events).await, DatabaseEvent::Update(_)));
    assert!(matches!(next_entry_event(&mut events).await, DatabaseEvent::Dropped));
    assert!(pubsub.peers("db").await.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_syncs_record_every_remote_head() {
    let pubsub = PubSubNetwork::new();
    let cache = Arc::new(MemoryStorage::new());
    let db = Database::open(
        DatabaseOptions::new(
            "db",
            identity(),
            Arc::new(MemoryPubSub::new("alice", &pubsub)),
        )
        .cache(cache.clone()),
    )
    .await
    .unwrap();

    let mut remote = Vec::new();
    for i in 0..8 {
        let writer = log_with_entries("db", &format!("writer{i}"), 1).await;
        remote.push(writer.heads().await.remove(0));
    }
    let mut expected: Vec<String> = remote.iter().map(|entry| entry.hash().clone()).collect();
    expected.sort();

    let tasks: Vec<_> = remote
        .into_iter()
        .map(|entry| {
            let db = db.clone();
            tokio::spawn(async move { db.sync_entry(entry).await })
        })
        .collect();
    for task in tasks {
        assert_eq!(task.await.unwrap().len(), 1);
    }

    let record = cache.get("db/_remoteHeads").await.unwrap().unwrap();
    let mut recorded: Vec<String> = serde_json::from_slice(&record).unwrap();
    recorded.sort();
    assert_eq!(recorded, expected);
    assert_eq!(db.log().heads().await.len(), 8);
}
