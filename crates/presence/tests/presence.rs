//! End-to-end presence lifecycle against a real Redis-compatible server.
//! Gated behind the `integration` feature and a `REDIS_TEST_URL` env var:
//!
//! ```sh
//! REDIS_TEST_URL=redis://127.0.0.1:6379 cargo test -p pulsemesh-presence --features integration
//! ```

#![cfg(feature = "integration")]
#![allow(clippy::unwrap_used, clippy::expect_used)]

use pulsemesh_events::EventBus;
use pulsemesh_presence::PresenceService;
use pulsemesh_registry::{ConnectionRegistry, RoomIndex};
use pulsemesh_store::SharedStore;
use serde_json::json;

fn redis_test_url() -> Option<String> {
    std::env::var("REDIS_TEST_URL").ok()
}

async fn service(prefix: &str) -> PresenceService {
    let url = redis_test_url().expect("caller already checked REDIS_TEST_URL");
    let store = SharedStore::connect(&url, prefix).await.expect("connect to redis");
    let registry = ConnectionRegistry::new(store.clone());
    let rooms = RoomIndex::new(store.clone());
    let bus = EventBus::new(store);
    PresenceService::new(registry, rooms, bus, 30_000)
}

#[tokio::test]
async fn join_then_heartbeat_then_leave_round_trips() {
    if redis_test_url().is_none() {
        eprintln!("skipping: REDIS_TEST_URL not set");
        return;
    }
    let presence = service("prs-it-presence").await;
    let room = "it-room-1";
    let user = "it-user-1";
    let conn = "it-conn-1";

    let joined = presence
        .join(room, user, conn, json!({"mic": false}))
        .await
        .expect("join");
    assert_eq!(joined.self_conn_id, conn);
    assert_eq!(joined.snapshot.len(), 1);
    assert_eq!(joined.snapshot[0].state, json!({"mic": false}));

    let changed = presence
        .heartbeat(conn, Some(json!({"mic": true})), Some(joined.self_epoch))
        .await
        .expect("heartbeat");
    assert!(changed);

    let snapshot = presence.fetch_room_snapshot(room).await.expect("snapshot");
    assert_eq!(snapshot[0].state, json!({"mic": true}));

    let left = presence.leave(conn).await.expect("leave").expect("was present");
    assert_eq!(left.room_id, room);
    assert_eq!(left.user_id, user);

    let snapshot_after = presence.fetch_room_snapshot(room).await.expect("snapshot after leave");
    assert!(snapshot_after.is_empty());
}

#[tokio::test]
async fn stale_epoch_heartbeat_is_rejected_without_a_trace() {
    if redis_test_url().is_none() {
        eprintln!("skipping: REDIS_TEST_URL not set");
        return;
    }
    let presence = service("prs-it-stale").await;
    let room = "it-room-2";
    let user = "it-user-2";
    let conn = "it-conn-2";

    let first = presence.join(room, user, conn, json!({})).await.expect("first join");
    // A second join on the same connId bumps the epoch past the first.
    let second = presence.join(room, user, conn, json!({})).await.expect("second join");
    assert!(second.self_epoch > first.self_epoch);

    // A heartbeat carrying the now-superseded first epoch must be rejected
    // and must not touch the stored state.
    let changed = presence
        .heartbeat(conn, Some(json!({"mic": true})), Some(first.self_epoch))
        .await
        .expect("heartbeat with stale epoch");
    assert!(!changed);

    let snapshot = presence.fetch_room_snapshot(room).await.expect("snapshot");
    assert_eq!(snapshot[0].state, json!({}));

    presence.leave(conn).await.expect("cleanup leave");
}
