use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::StreamExt;
use pulsemesh_common::{EngineError, MetadataEvent, PresenceEvent, Subscriber};
use pulsemesh_store::SharedStore;
use tracing::{debug, warn};

#[derive(Clone, Copy, PartialEq, Eq)]
enum Kind {
    Presence,
    Metadata,
}

struct Inner {
    store: SharedStore,
    next_id: AtomicU64,
    presence_subs: Mutex<HashMap<u64, Arc<dyn Subscriber>>>,
    metadata_subs: Mutex<HashMap<u64, Arc<dyn Subscriber>>>,
    listener: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

/// Publishes engine events and fans incoming ones out to local subscribers.
///
/// A single dedicated (non-multiplexed) pub/sub connection is opened lazily
/// on the first subscription and torn down once the last subscriber
/// disposes, mirroring the corpus's rationale that pub/sub connections
/// cannot be pooled/multiplexed like ordinary commands.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

/// Dropping this removes the subscriber and, if it was the last one, tears
/// down the shared pub/sub listener.
pub struct Disposer {
    inner: Arc<Inner>,
    id: u64,
    kind: Kind,
}

impl Drop for Disposer {
    fn drop(&mut self) {
        match self.kind {
            Kind::Presence => {
                self.inner.lock_presence().remove(&self.id);
            },
            Kind::Metadata => {
                self.inner.lock_metadata().remove(&self.id);
            },
        }
        self.inner.teardown_if_idle();
    }
}

impl Inner {
    fn lock_presence(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Arc<dyn Subscriber>>> {
        self.presence_subs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_metadata(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Arc<dyn Subscriber>>> {
        self.metadata_subs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn teardown_if_idle(&self) {
        if self.lock_presence().is_empty() && self.lock_metadata().is_empty() {
            let handle = self
                .listener
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .take();
            if let Some(handle) = handle {
                handle.abort();
                debug!("event bus listener torn down, no subscribers remain");
            }
        }
    }
}

impl EventBus {
    pub fn new(store: SharedStore) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                next_id: AtomicU64::new(1),
                presence_subs: Mutex::new(HashMap::new()),
                metadata_subs: Mutex::new(HashMap::new()),
                listener: Mutex::new(None),
            }),
        }
    }

    pub async fn publish_presence(&self, event: &PresenceEvent) -> Result<(), EngineError> {
        let payload = serde_json::to_string(event)
            .map_err(|e| EngineError::Store(format!("serialize presence event: {e}")))?;
        self.inner
            .store
            .publish(&self.inner.store.keys().room_events(&event.room_id), &payload)
            .await
            .map_err(EngineError::from)?;
        Ok(())
    }

    pub async fn publish_metadata(&self, event: &MetadataEvent) -> Result<(), EngineError> {
        let payload = serde_json::to_string(event)
            .map_err(|e| EngineError::Store(format!("serialize metadata event: {e}")))?;
        self.inner
            .store
            .publish(
                &self
                    .inner
                    .store
                    .keys()
                    .chan_meta_events(&event.channel_type, &event.channel_name),
                &payload,
            )
            .await
            .map_err(EngineError::from)?;
        Ok(())
    }

    pub fn subscribe(&self, handler: Arc<dyn Subscriber>) -> Disposer {
        self.ensure_listener();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.lock_presence().insert(id, handler);
        Disposer {
            inner: self.inner.clone(),
            id,
            kind: Kind::Presence,
        }
    }

    pub fn subscribe_metadata(&self, handler: Arc<dyn Subscriber>) -> Disposer {
        self.ensure_listener();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.lock_metadata().insert(id, handler);
        Disposer {
            inner: self.inner.clone(),
            id,
            kind: Kind::Metadata,
        }
    }

    fn ensure_listener(&self) {
        let mut guard = self
            .inner
            .listener
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if guard.is_some() {
            return;
        }
        let inner = self.inner.clone();
        *guard = Some(tokio::spawn(run_listener(inner)));
    }
}

async fn run_listener(inner: Arc<Inner>) {
    let mut pubsub = match inner.store.open_pubsub().await {
        Ok(p) => p,
        Err(e) => {
            warn!(error = %e, "event bus: failed to open pub/sub connection");
            return;
        },
    };

    let room_pattern = inner.store.keys().room_events_pattern();
    let meta_pattern = inner.store.keys().chan_meta_events_pattern();
    if let Err(e) = pubsub.psubscribe(&room_pattern).await {
        warn!(error = %e, pattern = %room_pattern, "event bus: psubscribe failed");
        return;
    }
    if let Err(e) = pubsub.psubscribe(&meta_pattern).await {
        warn!(error = %e, pattern = %meta_pattern, "event bus: psubscribe failed");
        return;
    }

    let mut stream = pubsub.on_message();
    while let Some(msg) = stream.next().await {
        let channel = msg.get_channel_name().to_string();
        let payload: String = match msg.get_payload() {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, channel, "event bus: non-string payload");
                continue;
            },
        };

        if channel.ends_with(":meta_events") {
            let handlers: Vec<_> = inner.lock_metadata().values().cloned().collect();
            dispatch(&handlers, &channel, &payload).await;
        } else if channel.ends_with(":events") {
            let handlers: Vec<_> = inner.lock_presence().values().cloned().collect();
            dispatch(&handlers, &channel, &payload).await;
        }
    }
}

/// Takes a snapshot of the handler list rather than the lock itself — a
/// `std::sync::MutexGuard` held across `.await` would make this future
/// non-`Send` and break `tokio::spawn`.
async fn dispatch(handlers: &[Arc<dyn Subscriber>], channel: &str, payload: &str) {
    let value: serde_json::Value = match serde_json::from_str(payload) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, channel, "event bus: malformed event payload");
            return;
        },
    };
    for handler in handlers {
        if let Err(e) = handler.handle(channel, "event", value.clone()).await {
            warn!(error = %e, channel, "event bus: subscriber handler failed");
        }
    }
}
