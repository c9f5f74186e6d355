//! Exercises `SharedStore` against a real Redis-compatible server. Gated
//! behind the `integration` feature and a `REDIS_TEST_URL` env var; run with:
//!
//! ```sh
//! REDIS_TEST_URL=redis://127.0.0.1:6379 cargo test -p pulsemesh-store --features integration
//! ```

#![cfg(feature = "integration")]
#![allow(clippy::unwrap_used, clippy::expect_used)]

use pulsemesh_store::SharedStore;
use redis::AsyncCommands;

fn redis_test_url() -> Option<String> {
    std::env::var("REDIS_TEST_URL").ok()
}

#[tokio::test]
async fn connects_and_round_trips_a_value() {
    let Some(url) = redis_test_url() else {
        eprintln!("skipping: REDIS_TEST_URL not set");
        return;
    };

    let store = SharedStore::connect(&url, "prs-it")
        .await
        .expect("connect to redis");

    let key = store.keys().conn("integration-test-conn");
    let mut conn = store.connection();
    let _: () = conn.set(&key, "hello").await.expect("set");
    let value: String = conn.get(&key).await.expect("get");
    assert_eq!(value, "hello");
    let _: () = conn.del(&key).await.expect("del");
}

#[tokio::test]
async fn publish_reaches_a_pubsub_subscriber() {
    use futures::StreamExt;

    let Some(url) = redis_test_url() else {
        eprintln!("skipping: REDIS_TEST_URL not set");
        return;
    };

    let store = SharedStore::connect(&url, "prs-it")
        .await
        .expect("connect to redis");
    let channel = store.keys().room_events("integration-room");

    let mut pubsub = store.open_pubsub().await.expect("open pubsub");
    pubsub.subscribe(&channel).await.expect("subscribe");
    let mut stream = pubsub.into_on_message();

    store.publish(&channel, "ping").await.expect("publish");

    let msg = tokio::time::timeout(std::time::Duration::from_secs(2), stream.next())
        .await
        .expect("timed out waiting for message")
        .expect("stream ended");
    let payload: String = msg.get_payload().expect("payload");
    assert_eq!(payload, "ping");
}
