use crate::helpers::*;
use peerlog::Error;
use peerlog::access::WriteAccess;
use peerlog::entry::Entry;
use peerlog::log::{AppendOptions, Log};
use peerlog::storage::MemoryStorage;
use serde_json::json;
use std::sync::Arc;

fn payloads(entries: &[Entry]) -> Vec<serde_json::Value> {
    entries.iter().map(|entry| entry.payload().clone()).collect()
}

#[tokio::test]
async fn test_two_writers_converge() {
    init_tracing();
    let log1 = log_with_entries("shared", "hello1", 10).await;
    let log2 = log_with_entries("shared", "hello2", 10).await;

    log1.join(&log2).await.unwrap();
    log2.join(&log1).await.unwrap();

    let values1 = log1.values().await;
    let values2 = log2.values().await;
    assert_eq!(values1.len(), 20);
    assert_eq!(values1, values2);

    // Each writer's own entries keep their relative order
    let own: Vec<_> = payloads(&values1)
        .into_iter()
        .filter(|payload| payload.as_str().is_some_and(|s| s.starts_with("hello1")))
        .collect();
    let expected: Vec<_> = (0..10).map(|i| json!(format!("hello1-{i}"))).collect();
    assert_eq!(own, expected);
}

#[tokio::test]
async fn test_order_is_independent_of_arrival() {
    let writer = identity();
    let source = open_log("shared", writer.clone()).await;
    let a = source.append(json!("a")).await.unwrap();
    let other = log_with_entries("shared", "b", 1).await;
    let b = other.heads().await.remove(0);
    let c = log_with_entries("shared", "c", 1).await.heads().await.remove(0);

    let forward = open_log("shared", identity()).await;
    let backward = open_log("shared", identity()).await;
    for entry in [&a, &b, &c] {
        forward.join_entry(entry.clone()).await.unwrap();
    }
    for entry in [&c, &b, &a] {
        backward.join_entry(entry.clone()).await.unwrap();
    }

    assert_eq!(forward.values().await, backward.values().await);
}

#[tokio::test]
async fn test_join_is_idempotent() {
    let log1 = log_with_entries("shared", "x", 5).await;
    let log2 = open_log("shared", identity()).await;

    let first = log2.join(&log1).await.unwrap();
    let second = log2.join(&log1).await.unwrap();
    assert_eq!(first.len(), 5);
    assert!(second.is_empty());
    assert_eq!(log2.values().await, log1.values().await);
}

#[tokio::test]
async fn test_denied_writer_fails_join() {
    let owner = identity();
    let log1 = open_log_with_access(
        "shared",
        owner.clone(),
        Arc::new(WriteAccess::owner_only(owner.id())),
    )
    .await;
    log1.append(json!("mine")).await.unwrap();

    let log2 = log_with_entries("shared", "intruder", 3).await;
    let before = log1.values().await;

    let err = log1.join(&log2).await.unwrap_err();
    assert!(matches!(err, Error::PermissionDenied(_)));
    assert_eq!(log1.values().await, before);
}

#[tokio::test]
async fn test_denied_local_append_leaves_log_unchanged() {
    let storage = Arc::new(MemoryStorage::new());
    let log = Log::open(
        identity(),
        peerlog::log::LogOptions::new()
            .id("locked")
            .access(Arc::new(WriteAccess::owner_only("somebody-else")))
            .entries(storage.clone()),
    )
    .await
    .unwrap();

    let err = log.append(json!("nope")).await.unwrap_err();
    assert!(matches!(err, Error::PermissionDenied(_)));
    assert!(log.is_empty().await);
    assert!(storage.is_empty().unwrap());
}

#[tokio::test]
async fn test_tampered_entry_fails_join() {
    let source = log_with_entries("shared", "data", 2).await;
    let head = source.heads().await.remove(0);
    let sibling = source.values().await.remove(0);

    let mut value = serde_json::to_value(&head).unwrap();
    value["sig"] = json!(sibling.signature());
    let tampered = Entry::decode(&serde_json::to_vec(&value).unwrap()).unwrap();

    let target = open_log("shared", identity()).await;
    let err = target
        .join_entries(vec![tampered], source.storage().as_ref())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidSignature));
    assert!(target.is_empty().await);
}

#[tokio::test]
async fn test_local_appends_keep_a_single_head() {
    let log = log_with_entries("solo", "n", 7).await;
    assert_eq!(log.heads().await.len(), 1);
}

#[tokio::test]
async fn test_concurrent_heads_until_next_append() {
    let left = log_with_entries("shared", "left", 1).await;
    let right = log_with_entries("shared", "right", 1).await;
    let third = open_log("shared", identity()).await;

    third.join(&left).await.unwrap();
    third.join(&right).await.unwrap();
    assert_eq!(third.heads().await.len(), 2);

    let merged = third.append(json!("merge")).await.unwrap();
    assert_eq!(merged.next().len(), 2);
    assert_eq!(merged.clock().time, 2);
    assert_eq!(third.heads().await.len(), 1);
}

#[tokio::test]
async fn test_reference_count_is_logarithmic() {
    let log = open_log("refs", identity()).await;
    let pointer_count = 16;
    for i in 0..40usize {
        let entry = log
            .append_with(
                json!(i),
                AppendOptions {
                    pointer_count: Some(pointer_count),
                },
            )
            .await
            .unwrap();
        let expected = if i == 0 {
            0
        } else {
            pointer_count.min(i).ilog2() as usize
        };
        assert_eq!(entry.refs().len(), expected, "entry {i}");
    }
}

#[tokio::test]
async fn test_traverse_follows_both_branches() {
    let left = log_with_entries("shared", "left", 3).await;
    let right = log_with_entries("shared", "right", 2).await;
    left.join(&right).await.unwrap();

    let walked = left.traverse(&[], None).await;
    assert_eq!(walked.len(), 5);
    let mut expected = left.values().await;
    expected.reverse();
    assert_eq!(walked, expected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_append_and_join_keep_consistent_heads() {
    let local = Arc::new(open_log("shared", identity()).await);
    let remote = log_with_entries("shared", "remote", 20).await;
    let remote_entries = remote.values().await;
    let source = remote.storage().clone();

    let writer = {
        let local = Arc::clone(&local);
        tokio::spawn(async move {
            for i in 0..20 {
                local.append(json!(format!("local-{i}"))).await.unwrap();
            }
        })
    };
    let joiner = {
        let local = Arc::clone(&local);
        tokio::spawn(async move {
            for entry in remote_entries {
                local
                    .join_entries(vec![entry], source.as_ref())
                    .await
                    .unwrap();
            }
        })
    };
    writer.await.unwrap();
    joiner.await.unwrap();

    // Heads are exactly the entries nothing else points at
    let values = local.values().await;
    assert_eq!(values.len(), 40);
    let referenced: std::collections::HashSet<_> =
        values.iter().flat_map(|entry| entry.next()).collect();
    let mut expected: Vec<_> = values
        .iter()
        .filter(|entry| !referenced.contains(entry.hash()))
        .map(|entry| entry.hash().clone())
        .collect();
    expected.sort();
    let mut heads: Vec<_> = local
        .heads()
        .await
        .iter()
        .map(|entry| entry.hash().clone())
        .collect();
    heads.sort();
    assert_eq!(heads, expected);

    let merged = local.append(json!("merge")).await.unwrap();
    let mut next = merged.next().to_vec();
    next.sort();
    assert_eq!(next, heads);
    assert_eq!(local.heads().await, vec![merged]);
}
