use crate::helpers::*;
use peerlog::database::{Database, DatabaseOptions};
use peerlog::exchange::{DirectNetwork, HeadsExchange, HeadsMessage, MemoryTransport, PeerTransport};
use peerlog::log::{Log, LogOptions};
use peerlog::pubsub::{MemoryPubSub, PubSubNetwork};
use peerlog::storage::{MemoryBlockService, MemoryStorage, Storage};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

async fn start_exchange(peer: &str, direct: &DirectNetwork) -> HeadsExchange {
    let transport = MemoryTransport::new(peer, direct).await;
    HeadsExchange::start(Arc::new(transport))
}

#[tokio::test]
async fn test_late_peer_catches_up_through_heads() {
    init_tracing();
    let pubsub = PubSubNetwork::new();
    let blocks = MemoryBlockService::new();
    let direct = DirectNetwork::new();

    let alice = open_database("db", "alice", &pubsub, &blocks).await;
    for i in 0..5 {
        alice.add_operation(json!(i)).await.unwrap();
    }
    let alice_exchange = start_exchange("alice", &direct).await;
    alice_exchange.register(alice.clone()).await;

    // Bob was not subscribed while Alice wrote, so only the exchange can catch Bob up
    let bob = open_database("db", "bob", &pubsub, &blocks).await;
    let bob_exchange = start_exchange("bob", &direct).await;
    bob_exchange.register(bob.clone()).await;

    wait_for_len(bob.log(), 5).await;
    assert_eq!(bob.log().values().await, alice.log().values().await);

    // Broadcast keeps working afterwards
    bob.add_operation(json!("from bob")).await.unwrap();
    wait_for_len(alice.log(), 6).await;

    alice_exchange.shutdown();
    bob_exchange.shutdown();
}

#[tokio::test]
async fn test_both_sides_receive_offline_history() {
    let pubsub = PubSubNetwork::new();
    let blocks = MemoryBlockService::new();
    let direct = DirectNetwork::new();

    let alice = open_database("db", "alice", &pubsub, &blocks).await;
    for i in 0..3 {
        alice.add_operation(json!(format!("alice-{i}"))).await.unwrap();
    }
    let alice_exchange = start_exchange("alice", &direct).await;
    alice_exchange.register(alice.clone()).await;

    // Bob's history is written before Bob ever joins the topic
    let bob_identity = identity();
    let bob_entries = networked_storage(&blocks);
    let bob_heads: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
    let offline = Log::open(
        bob_identity.clone(),
        LogOptions::new()
            .id("db")
            .entries(bob_entries.clone())
            .heads(bob_heads.clone()),
    )
    .await
    .unwrap();
    for i in 0..4 {
        offline.append(json!(format!("bob-{i}"))).await.unwrap();
    }
    offline.close().await.unwrap();

    let bob = Database::open(
        DatabaseOptions::new(
            "db",
            bob_identity,
            Arc::new(MemoryPubSub::new("bob", &pubsub)),
        )
        .entries(bob_entries)
        .heads(bob_heads),
    )
    .await
    .unwrap();
    let bob_exchange = start_exchange("bob", &direct).await;
    bob_exchange.register(bob.clone()).await;

    wait_for_len(alice.log(), 7).await;
    wait_for_len(bob.log(), 7).await;
    assert_eq!(alice.log().values().await, bob.log().values().await);
    assert_eq!(alice.log().heads().await.len(), 2);
}

#[tokio::test]
async fn test_failed_exchange_is_retried() {
    let pubsub = PubSubNetwork::new();
    let blocks = MemoryBlockService::new();
    let direct = DirectNetwork::new();

    let alice = open_database("db", "alice", &pubsub, &blocks).await;
    alice.add_operation(json!("history")).await.unwrap();
    let alice_exchange = start_exchange("alice", &direct).await;
    alice_exchange.register(alice.clone()).await;

    // Bob joins the topic before being reachable directly, so Alice's offer fails
    let bob = open_database("db", "bob", &pubsub, &blocks).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(bob.log().is_empty().await);

    // Once Bob is reachable, Bob's own offer makes Alice answer
    let bob_exchange = start_exchange("bob", &direct).await;
    bob_exchange.register(bob.clone()).await;
    wait_for_len(bob.log(), 1).await;
}

#[tokio::test]
async fn test_unknown_address_is_ignored() {
    let direct = DirectNetwork::new();
    let pubsub = PubSubNetwork::new();
    let blocks = MemoryBlockService::new();

    let alice = open_database("db", "alice", &pubsub, &blocks).await;
    let alice_exchange = start_exchange("alice", &direct).await;
    alice_exchange.register(alice.clone()).await;
    let stranger = MemoryTransport::new("stranger", &direct).await;

    let message = HeadsMessage {
        address: "elsewhere".to_string(),
        heads: Vec::new(),
    };
    stranger
        .send("alice", message.encode().unwrap())
        .await
        .unwrap();
    stranger.send("alice", b"garbage".to_vec()).await.unwrap();

    // Neither message gets an answer
    assert!(stranger_inbox_is_empty(&stranger).await);
    assert!(alice.log().is_empty().await);
}

async fn stranger_inbox_is_empty(transport: &MemoryTransport) -> bool {
    tokio::time::timeout(Duration::from_millis(20), transport.recv())
        .await
        .is_err()
}

#[tokio::test]
async fn test_unregister_stops_exchanges() {
    let pubsub = PubSubNetwork::new();
    let blocks = MemoryBlockService::new();
    let direct = DirectNetwork::new();

    let alice = open_database("db", "alice", &pubsub, &blocks).await;
    alice.add_operation(json!("history")).await.unwrap();
    let alice_exchange = start_exchange("alice", &direct).await;
    alice_exchange.register(alice.clone()).await;
    alice_exchange.unregister("db").await;

    let bob = open_database("db", "bob", &pubsub, &blocks).await;
    let bob_exchange = start_exchange("bob", &direct).await;
    bob_exchange.register(bob.clone()).await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(bob.log().is_empty().await);
}
