//! Exercises the optimization accelerators — the heartbeat batcher and the
//! scripted join/heartbeat — against a real Redis-compatible server. Gated
//! behind the `integration` feature and a `REDIS_TEST_URL` env var:
//!
//! ```sh
//! REDIS_TEST_URL=redis://127.0.0.1:6379 cargo test -p pulsemesh-optim --features integration
//! ```

#![cfg(feature = "integration")]
#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::time::Duration;

use pulsemesh_events::EventBus;
use pulsemesh_optim::{HeartbeatBatcher, ScriptedOps};
use pulsemesh_presence::PresenceService;
use pulsemesh_registry::{ConnectionRegistry, RoomIndex};
use pulsemesh_store::SharedStore;
use serde_json::json;

fn redis_test_url() -> Option<String> {
    std::env::var("REDIS_TEST_URL").ok()
}

async fn connect(prefix: &str) -> SharedStore {
    let url = redis_test_url().expect("caller already checked REDIS_TEST_URL");
    SharedStore::connect(&url, prefix).await.expect("connect to redis")
}

#[tokio::test]
async fn heartbeat_batcher_coalesces_concurrent_calls() {
    if redis_test_url().is_none() {
        eprintln!("skipping: REDIS_TEST_URL not set");
        return;
    }
    let store = connect("prs-it-optim-batch").await;
    let registry = ConnectionRegistry::new(store.clone());
    let rooms = RoomIndex::new(store.clone());
    let bus = EventBus::new(store.clone());

    let presence = PresenceService::new(registry.clone(), rooms.clone(), bus.clone(), 30_000);
    let joined = presence
        .join("it-room-batch", "it-user-batch", "it-conn-batch", json!({}))
        .await
        .expect("seed connection via join");

    let batcher = HeartbeatBatcher::new(registry, rooms, bus, 30_000, 50, 16);

    let a = batcher.heartbeat("it-conn-batch", Some(json!({"mic": true})), Some(joined.self_epoch));
    let b = batcher.heartbeat("it-conn-batch", Some(json!({"camera": true})), Some(joined.self_epoch));
    let (a, b) = tokio::join!(a, b);
    assert!(a.expect("first heartbeat"));
    assert!(b.expect("second heartbeat"));

    let snapshot = presence.fetch_room_snapshot("it-room-batch").await.expect("snapshot");
    assert_eq!(snapshot[0].state, json!({"mic": true, "camera": true}));

    presence.leave("it-conn-batch").await.expect("cleanup leave");
    batcher.dispose().await;
}

#[tokio::test]
async fn heartbeat_batcher_rejects_stale_epoch() {
    if redis_test_url().is_none() {
        eprintln!("skipping: REDIS_TEST_URL not set");
        return;
    }
    let store = connect("prs-it-optim-stale").await;
    let registry = ConnectionRegistry::new(store.clone());
    let rooms = RoomIndex::new(store.clone());
    let bus = EventBus::new(store.clone());

    let presence = PresenceService::new(registry.clone(), rooms.clone(), bus.clone(), 30_000);
    let first = presence
        .join("it-room-stale", "it-user-stale", "it-conn-stale", json!({}))
        .await
        .expect("first join");
    let second = presence
        .join("it-room-stale", "it-user-stale", "it-conn-stale", json!({}))
        .await
        .expect("second join bumps epoch");
    assert!(second.self_epoch > first.self_epoch);

    let batcher = HeartbeatBatcher::new(registry, rooms, bus, 30_000, 50, 16);
    let outcome = batcher
        .heartbeat("it-conn-stale", Some(json!({"mic": true})), Some(first.self_epoch))
        .await;
    assert!(matches!(outcome, Err(pulsemesh_common::EngineError::StaleEpoch)));

    presence.leave("it-conn-stale").await.expect("cleanup leave");
    batcher.dispose().await;
}

#[tokio::test]
async fn scripted_join_then_scripted_heartbeat_round_trips() {
    if redis_test_url().is_none() {
        eprintln!("skipping: REDIS_TEST_URL not set");
        return;
    }
    let store = connect("prs-it-optim-scripted").await;
    let ops = ScriptedOps::new(store);

    let epoch = ops
        .join("it-room-scripted", "it-user-scripted", "it-conn-scripted", 30_000, &json!({"mic": false}))
        .await
        .expect("scripted join");

    let outcome = ops
        .heartbeat("it-conn-scripted", Some(&json!({"mic": true})), Some(epoch), 30_000)
        .await
        .expect("scripted heartbeat");

    assert!(outcome.found);
    assert!(!outcome.stale);
    assert!(outcome.changed);
    assert_eq!(outcome.epoch, epoch);
    assert_eq!(outcome.state, Some(json!({"mic": true})));

    tokio::time::sleep(Duration::from_millis(10)).await;
}
