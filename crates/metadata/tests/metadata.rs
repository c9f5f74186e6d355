//! Exercises `MetadataStore`'s set/update/remove/get cycle, both
//! concurrency variants, against a real Redis-compatible server. Gated
//! behind the `integration` feature and a `REDIS_TEST_URL` env var:
//!
//! ```sh
//! REDIS_TEST_URL=redis://127.0.0.1:6379 cargo test -p pulsemesh-metadata --features integration
//! ```

#![cfg(feature = "integration")]
#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::HashMap;

use pulsemesh_common::{EngineError, PreconditionCode};
use pulsemesh_events::EventBus;
use pulsemesh_metadata::{GetParams, ItemPatch, MetadataOptions, MetadataStore, RemoveParams, SetParams, UpdateParams};
use pulsemesh_store::SharedStore;

fn redis_test_url() -> Option<String> {
    std::env::var("REDIS_TEST_URL").ok()
}

async fn store(prefix: &str, transactional: bool) -> MetadataStore {
    let url = redis_test_url().expect("caller already checked REDIS_TEST_URL");
    let shared = SharedStore::connect(&url, prefix).await.expect("connect to redis");
    let bus = EventBus::new(shared.clone());
    MetadataStore::new(shared, bus, transactional)
}

fn set_params(channel_name: &str, key: &str, value: &str) -> SetParams {
    let mut data = HashMap::new();
    data.insert(key.to_string(), value.to_string());
    SetParams {
        channel_type: "room".to_string(),
        channel_name: channel_name.to_string(),
        data,
        options: MetadataOptions::default(),
        actor_user_id: None,
    }
}

#[tokio::test]
async fn set_then_get_round_trips_and_starts_at_revision_one() {
    if redis_test_url().is_none() {
        eprintln!("skipping: REDIS_TEST_URL not set");
        return;
    }
    let metadata = store("prs-it-meta-default", false).await;
    let channel = "it-channel-1";

    let set = metadata.set(set_params(channel, "topic", "hello")).await.expect("set");
    assert_eq!(set.major_revision, 1);

    let got = metadata
        .get(GetParams {
            channel_type: "room".to_string(),
            channel_name: channel.to_string(),
        })
        .await
        .expect("get");
    assert_eq!(got.metadata.get("topic").map(|i| i.value.as_str()), Some("hello"));
}

#[tokio::test]
async fn update_rejects_per_item_revision_conflict() {
    if redis_test_url().is_none() {
        eprintln!("skipping: REDIS_TEST_URL not set");
        return;
    }
    let metadata = store("prs-it-meta-cas", false).await;
    let channel = "it-channel-2";
    metadata.set(set_params(channel, "topic", "a")).await.expect("set");

    let mut patch = HashMap::new();
    patch.insert(
        "topic".to_string(),
        ItemPatch {
            value: "b".to_string(),
            expected_revision: Some(99),
        },
    );
    let result = metadata
        .update(UpdateParams {
            channel_type: "room".to_string(),
            channel_name: channel.to_string(),
            data: patch,
            options: MetadataOptions::default(),
            actor_user_id: None,
        })
        .await;
    assert!(matches!(
        result,
        Err(EngineError::Precondition {
            code: PreconditionCode::MetadataConflict,
            ..
        })
    ));
}

#[tokio::test]
async fn remove_without_keys_clears_the_channel() {
    if redis_test_url().is_none() {
        eprintln!("skipping: REDIS_TEST_URL not set");
        return;
    }
    let metadata = store("prs-it-meta-remove", false).await;
    let channel = "it-channel-3";
    metadata.set(set_params(channel, "topic", "a")).await.expect("set");

    let removed = metadata
        .remove(RemoveParams {
            channel_type: "room".to_string(),
            channel_name: channel.to_string(),
            keys: None,
            options: MetadataOptions::default(),
            actor_user_id: None,
        })
        .await
        .expect("remove");
    assert!(removed.metadata.is_empty());
}

#[tokio::test]
async fn transactional_variant_also_round_trips() {
    if redis_test_url().is_none() {
        eprintln!("skipping: REDIS_TEST_URL not set");
        return;
    }
    let metadata = store("prs-it-meta-txn", true).await;
    let channel = "it-channel-4";

    metadata.set(set_params(channel, "topic", "txn")).await.expect("set");
    let got = metadata
        .get(GetParams {
            channel_type: "room".to_string(),
            channel_name: channel.to_string(),
        })
        .await
        .expect("get");
    assert_eq!(got.metadata.get("topic").map(|i| i.value.as_str()), Some("txn"));
}
