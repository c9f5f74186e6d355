//! Heartbeat batcher (spec §4.H): coalesces concurrent heartbeats from the
//! same instance into one pipeline per flush instead of one round-trip per
//! call.
//!
//! Buffer shape and the oneshot-per-waiter resolution pattern follow
//! `crates/gateway/src/state.rs`'s `PendingInvoke`/`DedupeCache` — a
//! `HashMap` behind a lock holding pending work, each entry resolved later
//! by a background task rather than at call time.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use pulsemesh_common::{EngineError, PresenceEvent, PresenceEventKind, now_ms};
use pulsemesh_events::EventBus;
use pulsemesh_presence::{decide_heartbeat_epoch, is_empty_patch, merge_state, EpochDecision};
use pulsemesh_registry::{ConnectionRegistry, RoomIndex};
use serde_json::Value;
use tokio::sync::{oneshot, Mutex, Notify};
use tracing::warn;

/// A heartbeat call buffered for the next flush. A later call for the same
/// `connId` overwrites `patch_state`/`requested_epoch` in place — "latest
/// state wins" — but keeps accumulating waiters, so every caller's future
/// resolves with the single outcome the flush computes for that connection.
struct Pending {
    patch_state: Option<Value>,
    requested_epoch: Option<i64>,
    waiters: Vec<oneshot::Sender<Result<bool, EngineError>>>,
}

struct Inner {
    registry: ConnectionRegistry,
    rooms: RoomIndex,
    bus: EventBus,
    connection_ttl_ms: u64,
    window: Duration,
    max_batch_size: usize,
    buffer: Mutex<HashMap<String, Pending>>,
    wake: Notify,
    disposed: AtomicBool,
}

/// Coalesces heartbeats. When enabled, this is the single writer path for
/// heartbeat updates from its instance (spec §5) — direct calls to
/// `PresenceService::heartbeat` are not used alongside it.
#[derive(Clone)]
pub struct HeartbeatBatcher {
    inner: Arc<Inner>,
}

impl HeartbeatBatcher {
    pub fn new(
        registry: ConnectionRegistry,
        rooms: RoomIndex,
        bus: EventBus,
        connection_ttl_ms: u64,
        window_ms: u64,
        max_batch_size: usize,
    ) -> Self {
        let inner = Arc::new(Inner {
            registry,
            rooms,
            bus,
            connection_ttl_ms,
            window: Duration::from_millis(window_ms.max(1)),
            max_batch_size: max_batch_size.max(1),
            buffer: Mutex::new(HashMap::new()),
            wake: Notify::new(),
            disposed: AtomicBool::new(false),
        });
        tokio::spawn(run_loop(inner.clone()));
        Self { inner }
    }

    /// Enqueues a heartbeat and awaits the outcome of whichever flush
    /// eventually processes it. Matches `PresenceService::heartbeat`'s
    /// contract (`changed` boolean) except that a stale-epoch heartbeat is
    /// surfaced as `Err(EngineError::StaleEpoch)` rather than a silent
    /// `false`, per spec §7: "a structured error in the batched path, to
    /// preserve the contract that failed heartbeats reject their promise."
    pub async fn heartbeat(
        &self,
        conn_id: &str,
        patch_state: Option<Value>,
        requested_epoch: Option<i64>,
    ) -> Result<bool, EngineError> {
        if self.inner.disposed.load(Ordering::SeqCst) {
            return Err(EngineError::Store("heartbeat batcher is disposed".to_string()));
        }

        let (tx, rx) = oneshot::channel();
        let should_wake = {
            let mut buffer = self.inner.buffer.lock().await;
            let entry = buffer.entry(conn_id.to_string()).or_insert_with(|| Pending {
                patch_state: None,
                requested_epoch: None,
                waiters: Vec::new(),
            });
            entry.patch_state = patch_state;
            entry.requested_epoch = requested_epoch;
            entry.waiters.push(tx);
            buffer.len() == 1 || buffer.len() >= self.inner.max_batch_size
        };
        if should_wake {
            self.inner.wake.notify_one();
        }

        rx.await
            .unwrap_or_else(|_| Err(EngineError::Store("heartbeat batcher dropped the request".to_string())))
    }

    /// Rejects every pending entry and stops the flush loop. Further calls
    /// to `heartbeat` fail immediately.
    pub async fn dispose(&self) {
        self.inner.disposed.store(true, Ordering::SeqCst);
        self.inner.wake.notify_one();
        let mut buffer = self.inner.buffer.lock().await;
        for (_, pending) in buffer.drain() {
            for waiter in pending.waiters {
                let _ = waiter.send(Err(EngineError::Store("heartbeat batcher disposed".to_string())));
            }
        }
    }
}

async fn run_loop(inner: Arc<Inner>) {
    loop {
        if inner.disposed.load(Ordering::SeqCst) {
            return;
        }

        // Wait until there is at least one buffered entry.
        loop {
            if inner.disposed.load(Ordering::SeqCst) {
                return;
            }
            if !inner.buffer.lock().await.is_empty() {
                break;
            }
            inner.wake.notified().await;
        }

        tokio::select! {
            _ = tokio::time::sleep(inner.window) => {},
            _ = inner.wake.notified() => {},
        }

        if inner.disposed.load(Ordering::SeqCst) {
            return;
        }
        flush(&inner).await;
    }
}

async fn flush(inner: &Arc<Inner>) {
    let batch: HashMap<String, Pending> = {
        let mut buffer = inner.buffer.lock().await;
        std::mem::take(&mut *buffer)
    };
    if batch.is_empty() {
        return;
    }

    let now = now_ms();
    for (conn_id, pending) in batch {
        let outcome = apply_one(inner, &conn_id, pending.patch_state, pending.requested_epoch, now).await;
        for waiter in pending.waiters {
            let _ = waiter.send(outcome.clone());
        }
    }
}

/// Reproduces `PresenceService::heartbeat`'s logic for a single buffered
/// entry: read, epoch-fence, merge, write, publish iff changed. Kept
/// sequential per connection within a flush for simplicity; the records
/// this touches are disjoint across connections so there is no contention
/// between them.
async fn apply_one(
    inner: &Arc<Inner>,
    conn_id: &str,
    patch_state: Option<Value>,
    requested_epoch: Option<i64>,
    now: u64,
) -> Result<bool, EngineError> {
    let Some(mut record) = inner.registry.read(conn_id).await.map_err(EngineError::from)? else {
        return Ok(false);
    };

    let decision = decide_heartbeat_epoch(record.epoch, requested_epoch);
    if decision == EpochDecision::Stale {
        return Err(EngineError::StaleEpoch);
    }

    let epoch_advanced = matches!(decision, EpochDecision::Advance(_));
    if let EpochDecision::Advance(new_epoch) = decision {
        record.epoch = new_epoch;
    }

    let previous_state = record.state.clone();
    if let Some(patch) = &patch_state {
        if !is_empty_patch(patch) {
            merge_state(&mut record.state, patch);
        }
    }
    let state_changed = record.state != previous_state;

    record.last_seen_ms = now;
    inner
        .registry
        .write_initial(&record, inner.connection_ttl_ms)
        .await
        .map_err(EngineError::from)?;
    inner
        .rooms
        .update_lastseen(&record.room_id, conn_id, now)
        .await
        .map_err(EngineError::from)?;
    if epoch_advanced {
        inner
            .rooms
            .record_user_for_conn(&record.room_id, conn_id, &record.user_id, record.epoch)
            .await
            .map_err(EngineError::from)?;
    }

    if state_changed {
        let event = PresenceEvent {
            kind: PresenceEventKind::Update,
            room_id: record.room_id.clone(),
            user_id: record.user_id.clone(),
            conn_id: conn_id.to_string(),
            state: Some(record.state.clone()),
            ts_ms: now,
            epoch: Some(record.epoch),
        };
        if let Err(e) = inner.bus.publish_presence(&event).await {
            warn!(error = %e, conn_id, "heartbeat batcher: event publish failed (best-effort)");
        }
    }

    Ok(state_changed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_keeps_latest_patch_and_all_waiters() {
        let (tx1, _rx1) = oneshot::channel();
        let (tx2, _rx2) = oneshot::channel();
        let mut pending = Pending {
            patch_state: Some(serde_json::json!({"mic": true})),
            requested_epoch: None,
            waiters: vec![tx1],
        };
        pending.patch_state = Some(serde_json::json!({"mic": false}));
        pending.waiters.push(tx2);
        assert_eq!(pending.patch_state, Some(serde_json::json!({"mic": false})));
        assert_eq!(pending.waiters.len(), 2);
    }
}
