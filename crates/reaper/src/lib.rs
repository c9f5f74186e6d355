//! Reaper (spec §4.E): the periodic sweep that converts TTL-expired
//! connection records into cluster-visible `leave` events. The shared
//! store's own TTL eviction is silent — this task is the only path by
//! which peer instances ever learn a crashed client is gone.

use std::time::Duration;

use pulsemesh_common::{PresenceEvent, PresenceEventKind, now_ms};
use pulsemesh_events::EventBus;
use pulsemesh_registry::{ConnectionRegistry, RoomIndex};
use pulsemesh_store::StoreError;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy)]
pub struct ReaperConfig {
    pub interval_ms: u64,
    pub lookback_ms: u64,
}

#[derive(Clone)]
pub struct Reaper {
    registry: ConnectionRegistry,
    rooms: RoomIndex,
    bus: EventBus,
    config: ReaperConfig,
}

impl Reaper {
    pub fn new(
        registry: ConnectionRegistry,
        rooms: RoomIndex,
        bus: EventBus,
        config: ReaperConfig,
    ) -> Self {
        Self {
            registry,
            rooms,
            bus,
            config,
        }
    }

    /// Spawns the periodic sweep as a background task. The returned handle
    /// can be aborted to stop the reaper; dropping it does not stop the task
    /// (matches the teacher's `tokio::spawn` + detached-interval-loop idiom).
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(self.config.interval_ms));
            loop {
                interval.tick().await;
                if let Err(e) = self.tick().await {
                    warn!(error = %e, "reaper: sweep tick failed");
                }
            }
        })
    }

    /// Runs exactly one sweep. Exposed directly for tests and for a
    /// caller-driven scheduling loop.
    pub async fn tick(&self) -> Result<(), StoreError> {
        let cutoff_ms = now_ms().saturating_sub(self.config.lookback_ms);
        let active_rooms = self.rooms.active_rooms().await?;
        for room_id in active_rooms {
            if let Err(e) = self.sweep_room(&room_id, cutoff_ms).await {
                warn!(error = %e, room_id, "reaper: room sweep failed");
            }
        }
        Ok(())
    }

    async fn sweep_room(&self, room_id: &str, cutoff_ms: u64) -> Result<(), StoreError> {
        let stale = self.rooms.list_stale_connections(room_id, cutoff_ms).await?;
        for conn_id in stale {
            self.reap_connection(room_id, &conn_id).await?;
        }
        // The per-connection cleanup above already prunes `active_rooms`
        // when a room's connection set empties out; this is a defensive
        // final check per spec step (4) of the sweep.
        self.rooms.prune_active_room_if_empty(room_id).await?;
        Ok(())
    }

    async fn reap_connection(&self, room_id: &str, conn_id: &str) -> Result<(), StoreError> {
        if self.registry.read(conn_id).await?.is_some() {
            // The record itself hasn't expired yet: TTL will fire soon, or
            // another instance already owns it. Not our job this tick.
            return Ok(());
        }

        match self.rooms.read_user_for_conn(room_id, conn_id).await? {
            Some(meta) => {
                self.rooms
                    .remove_connection(room_id, &meta.user_id, conn_id)
                    .await?;
                let event = PresenceEvent {
                    kind: PresenceEventKind::Leave,
                    room_id: room_id.to_string(),
                    user_id: meta.user_id,
                    conn_id: conn_id.to_string(),
                    state: None,
                    ts_ms: now_ms(),
                    epoch: Some(meta.epoch),
                };
                if let Err(e) = self.bus.publish_presence(&event).await {
                    warn!(error = %e, conn_id, "reaper: leave publish failed (best-effort)");
                }
                debug!(room_id, conn_id, "reaper: reclaimed expired connection");
            },
            None => {
                // conn→metadata entry is also gone (e.g. a racing explicit
                // leave partly completed) — clean indexes, emit nothing.
                self.rooms.remove_stale_connection(room_id, conn_id).await?;
            },
        }
        Ok(())
    }
}
