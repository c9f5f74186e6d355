use std::sync::Arc;

use pulsemesh_common::{EngineError, PresenceEvent, PresenceEventKind, Subscriber, now_ms};
use pulsemesh_events::{Disposer, EventBus};
use pulsemesh_registry::{ConnectionRecord, ConnectionRegistry, RoomIndex};
use pulsemesh_store::{Keys, StoreError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::epoch::{EpochDecision, decide_heartbeat_epoch, next_join_epoch};

/// One entry of `fetch_room_snapshot`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SnapshotEntry {
    pub conn_id: String,
    pub user_id: String,
    pub state: Value,
    pub last_seen_ms: u64,
    pub epoch: i64,
}

/// What `join` hands back to the caller: the room's live membership and the
/// caller's own `{connId, epoch}` so a client knows which epoch it now owns.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JoinResult {
    pub snapshot: Vec<SnapshotEntry>,
    pub self_conn_id: String,
    pub self_epoch: i64,
}

/// `leave`'s return value: which room and user the departed connection
/// belonged to, so the transport layer can update its own bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LeftConnection {
    pub room_id: String,
    pub user_id: String,
}

/// The presence service (spec §4.D): join/heartbeat/leave/snapshot with the
/// ordering and epoch-fencing rules, plus the subscribe/subscribe_metadata
/// passthrough onto the event bus.
#[derive(Clone)]
pub struct PresenceService {
    registry: ConnectionRegistry,
    rooms: RoomIndex,
    bus: EventBus,
    connection_ttl_ms: u64,
}

impl PresenceService {
    pub fn new(
        registry: ConnectionRegistry,
        rooms: RoomIndex,
        bus: EventBus,
        connection_ttl_ms: u64,
    ) -> Self {
        Self {
            registry,
            rooms,
            bus,
            connection_ttl_ms,
        }
    }

    /// Rejects ids that would escape their hash-tag slot, per §4.A.
    fn validate_ids(room_id: &str, user_id: Option<&str>) -> Result<(), EngineError> {
        Keys::validate_id(room_id).map_err(to_validation)?;
        if let Some(user_id) = user_id {
            Keys::validate_id(user_id).map_err(to_validation)?;
        }
        Ok(())
    }

    /// Join a room, fencing against a pending-cleanup prior socket via the
    /// epoch rule in spec §3.
    pub async fn join(
        &self,
        room_id: &str,
        user_id: &str,
        conn_id: &str,
        state: Value,
    ) -> Result<JoinResult, EngineError> {
        Self::validate_ids(room_id, Some(user_id))?;

        let prior_epoch = self.registry.read(conn_id).await?.map(|r| r.epoch);
        let now = now_ms();
        let epoch = next_join_epoch(prior_epoch, now);

        let record = ConnectionRecord {
            conn_id: conn_id.to_string(),
            user_id: user_id.to_string(),
            room_id: room_id.to_string(),
            last_seen_ms: now,
            epoch,
            state: state.clone(),
        };
        self.registry
            .write_initial(&record, self.connection_ttl_ms)
            .await?;

        if let Err(e) = self
            .rooms
            .add_connection(room_id, user_id, conn_id, epoch, now)
            .await
        {
            // Indexing failed: the connection record must not leak.
            let _ = self.registry.delete(conn_id).await;
            return Err(e.into());
        }

        let event = PresenceEvent {
            kind: PresenceEventKind::Join,
            room_id: room_id.to_string(),
            user_id: user_id.to_string(),
            conn_id: conn_id.to_string(),
            state: Some(state),
            ts_ms: now,
            epoch: Some(epoch),
        };
        self.publish_best_effort(&event).await;

        let snapshot = self.fetch_room_snapshot(room_id).await?;
        Ok(JoinResult {
            snapshot,
            self_conn_id: conn_id.to_string(),
            self_epoch: epoch,
        })
    }

    /// Heartbeat: touch-only when `patch_state` is absent/empty, otherwise
    /// merge it last-write-wins into the stored state. Returns whether the
    /// stored state actually changed.
    pub async fn heartbeat(
        &self,
        conn_id: &str,
        patch_state: Option<Value>,
        requested_epoch: Option<i64>,
    ) -> Result<bool, EngineError> {
        let Some(mut record) = self.registry.read(conn_id).await? else {
            // Not-found is not an error for heartbeat (spec §7): a benign
            // false, matching the absent/absent self-loop in the state
            // machine.
            return Ok(false);
        };

        let decision = decide_heartbeat_epoch(record.epoch, requested_epoch);
        if decision == EpochDecision::Stale {
            // No state write, no event, no TTL refresh — the stale socket's
            // heartbeat must leave no trace on the winning epoch's record.
            return Ok(false);
        }

        let now = now_ms();
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
        self.registry
            .write_initial(&record, self.connection_ttl_ms)
            .await?;
        self.rooms
            .update_lastseen(&record.room_id, conn_id, now)
            .await?;
        if epoch_advanced {
            self.rooms
                .record_user_for_conn(&record.room_id, conn_id, &record.user_id, record.epoch)
                .await?;
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
            self.publish_best_effort(&event).await;
        }

        Ok(state_changed)
    }

    /// Leave: tear down every index, then the connection record itself, then
    /// publish — in that order, so a crashed publish never leaves stale
    /// indexes behind.
    pub async fn leave(&self, conn_id: &str) -> Result<Option<LeftConnection>, EngineError> {
        let Some(record) = self.registry.read(conn_id).await? else {
            return Ok(None);
        };

        self.rooms
            .remove_connection(&record.room_id, &record.user_id, conn_id)
            .await?;
        self.registry.delete(conn_id).await?;

        let event = PresenceEvent {
            kind: PresenceEventKind::Leave,
            room_id: record.room_id.clone(),
            user_id: record.user_id.clone(),
            conn_id: conn_id.to_string(),
            state: None,
            ts_ms: now_ms(),
            epoch: Some(record.epoch),
        };
        self.publish_best_effort(&event).await;

        Ok(Some(LeftConnection {
            room_id: record.room_id,
            user_id: record.user_id,
        }))
    }

    /// Reads the room's connection set, then batch-reads each connection
    /// record; entries that have since vanished are dropped (races are
    /// acceptable per spec §4.D).
    pub async fn fetch_room_snapshot(
        &self,
        room_id: &str,
    ) -> Result<Vec<SnapshotEntry>, EngineError> {
        Self::validate_ids(room_id, None)?;
        let conn_ids = self.rooms.list_connections(room_id).await?;
        let mut snapshot = Vec::with_capacity(conn_ids.len());
        for conn_id in conn_ids {
            if let Some(record) = self.registry.read(&conn_id).await? {
                snapshot.push(SnapshotEntry {
                    conn_id: record.conn_id,
                    user_id: record.user_id,
                    state: record.state,
                    last_seen_ms: record.last_seen_ms,
                    epoch: record.epoch,
                });
            }
        }
        Ok(snapshot)
    }

    /// Subscribe to presence events. Delegates to the event bus, which owns
    /// the lazily-opened pub/sub listener.
    pub fn subscribe(&self, handler: Arc<dyn Subscriber>) -> Disposer {
        self.bus.subscribe(handler)
    }

    /// Subscribe to channel-metadata events on the same bus instance.
    pub fn subscribe_metadata(&self, handler: Arc<dyn Subscriber>) -> Disposer {
        self.bus.subscribe_metadata(handler)
    }

    async fn publish_best_effort(&self, event: &PresenceEvent) {
        if let Err(e) = self.bus.publish_presence(event).await {
            warn!(error = %e, conn_id = %event.conn_id, "presence: event publish failed (best-effort)");
        }
    }
}

/// `true` for a patch that carries no state at all — a heartbeat with one
/// of these is touch-only (TTL/last-seen refresh, no `update` event).
pub fn is_empty_patch(patch: &Value) -> bool {
    match patch {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

/// Shallow last-write-wins merge, matching `pulsemesh_registry`'s semantics.
/// Exposed so the scripted/batched heartbeat accelerators in
/// `pulsemesh-optim` compute the exact same state diff as this default path.
pub fn merge_state(base: &mut Value, patch: &Value) {
    match (base.as_object_mut(), patch.as_object()) {
        (Some(base_obj), Some(patch_obj)) => {
            for (k, v) in patch_obj {
                base_obj.insert(k.clone(), v.clone());
            }
        },
        _ => *base = patch.clone(),
    }
}

fn to_validation(err: StoreError) -> EngineError {
    EngineError::Validation(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_patch_is_touch_only() {
        assert!(is_empty_patch(&Value::Null));
        assert!(is_empty_patch(&serde_json::json!({})));
        assert!(!is_empty_patch(&serde_json::json!({"mic": true})));
    }

    #[test]
    fn merge_is_idempotent_on_identical_patch() {
        let mut state = serde_json::json!({"mic": true});
        let before = state.clone();
        merge_state(&mut state, &serde_json::json!({"mic": true}));
        assert_eq!(state, before);
    }
}
