use redis::AsyncCommands;
use serde::{Deserialize, Serialize};

use pulsemesh_store::{SharedStore, StoreError};

/// What the reaper needs to resolve a stale connId once its own record has
/// already expired: who it belonged to, and at what epoch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnMeta {
    pub user_id: String,
    pub epoch: i64,
}

#[derive(Clone)]
pub struct RoomIndex {
    store: SharedStore,
}

impl RoomIndex {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    pub async fn add_connection(
        &self,
        room_id: &str,
        user_id: &str,
        conn_id: &str,
        epoch: i64,
        last_seen_ms: u64,
    ) -> Result<(), StoreError> {
        let k = self.store.keys();
        let meta = serde_json::to_string(&ConnMeta {
            user_id: user_id.to_string(),
            epoch,
        })
        .map_err(|e| StoreError::Malformed {
            key: k.room_conn_meta(room_id),
            reason: e.to_string(),
        })?;

        let mut conn = self.store.connection();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .sadd(k.room_conns(room_id), conn_id)
            .ignore()
            .sadd(k.room_members(room_id), user_id)
            .ignore()
            .zadd(k.room_lastseen(room_id), conn_id, last_seen_ms)
            .ignore()
            .hset(k.room_conn_meta(room_id), conn_id, meta)
            .ignore()
            .sadd(k.active_rooms(), room_id)
            .ignore()
            .sadd(k.user_conns(user_id), conn_id)
            .ignore();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    pub async fn remove_connection(
        &self,
        room_id: &str,
        user_id: &str,
        conn_id: &str,
    ) -> Result<(), StoreError> {
        let k = self.store.keys();
        let mut conn = self.store.connection();

        let mut pipe = redis::pipe();
        pipe.atomic()
            .srem(k.room_conns(room_id), conn_id)
            .ignore()
            .zrem(k.room_lastseen(room_id), conn_id)
            .ignore()
            .hdel(k.room_conn_meta(room_id), conn_id)
            .ignore()
            .srem(k.user_conns(user_id), conn_id)
            .ignore();
        let _: () = pipe.query_async(&mut conn).await?;

        if self.count_user_connections(room_id, user_id).await? == 0 {
            let _: () = conn.srem(k.room_members(room_id), user_id).await?;
        }
        if self.list_connections(room_id).await?.is_empty() {
            let _: () = conn.srem(k.active_rooms(), room_id).await?;
        }
        Ok(())
    }

    /// Strips a stale `connId` out of the room's connection-level indexes
    /// without touching the members set. Used by the reaper when the
    /// conn→metadata map entry is also gone, so there is no `userId` to
    /// reconcile the members set against (spec §4.E: "tolerate the case
    /// where the conn→metadata entry is also missing").
    pub async fn remove_stale_connection(&self, room_id: &str, conn_id: &str) -> Result<(), StoreError> {
        let k = self.store.keys();
        let mut conn = self.store.connection();

        let mut pipe = redis::pipe();
        pipe.atomic()
            .srem(k.room_conns(room_id), conn_id)
            .ignore()
            .zrem(k.room_lastseen(room_id), conn_id)
            .ignore()
            .hdel(k.room_conn_meta(room_id), conn_id)
            .ignore();
        let _: () = pipe.query_async(&mut conn).await?;

        if self.list_connections(room_id).await?.is_empty() {
            let _: () = conn.srem(k.active_rooms(), room_id).await?;
        }
        Ok(())
    }

    /// Drops `room_id` from the active-rooms set if its connection set is
    /// currently empty. A no-op otherwise.
    pub async fn prune_active_room_if_empty(&self, room_id: &str) -> Result<(), StoreError> {
        if self.list_connections(room_id).await?.is_empty() {
            let mut conn = self.store.connection();
            let _: () = conn.srem(self.store.keys().active_rooms(), room_id).await?;
        }
        Ok(())
    }

    pub async fn list_connections(&self, room_id: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.store.connection();
        Ok(conn.smembers(self.store.keys().room_conns(room_id)).await?)
    }

    /// connIds in the room whose last-seen score is at or before `cutoff_ms`.
    pub async fn list_stale_connections(
        &self,
        room_id: &str,
        cutoff_ms: u64,
    ) -> Result<Vec<String>, StoreError> {
        let mut conn = self.store.connection();
        Ok(conn
            .zrangebyscore(self.store.keys().room_lastseen(room_id), 0, cutoff_ms as isize)
            .await?)
    }

    pub async fn update_lastseen(
        &self,
        room_id: &str,
        conn_id: &str,
        last_seen_ms: u64,
    ) -> Result<(), StoreError> {
        let mut conn = self.store.connection();
        let _: () = conn
            .zadd(self.store.keys().room_lastseen(room_id), conn_id, last_seen_ms)
            .await?;
        Ok(())
    }

    pub async fn record_user_for_conn(
        &self,
        room_id: &str,
        conn_id: &str,
        user_id: &str,
        epoch: i64,
    ) -> Result<(), StoreError> {
        let k = self.store.keys();
        let meta = serde_json::to_string(&ConnMeta {
            user_id: user_id.to_string(),
            epoch,
        })
        .map_err(|e| StoreError::Malformed {
            key: k.room_conn_meta(room_id),
            reason: e.to_string(),
        })?;
        let mut conn = self.store.connection();
        let _: () = conn.hset(k.room_conn_meta(room_id), conn_id, meta).await?;
        Ok(())
    }

    pub async fn read_user_for_conn(
        &self,
        room_id: &str,
        conn_id: &str,
    ) -> Result<Option<ConnMeta>, StoreError> {
        let mut conn = self.store.connection();
        let raw: Option<String> = conn
            .hget(self.store.keys().room_conn_meta(room_id), conn_id)
            .await?;
        match raw {
            None => Ok(None),
            Some(raw) => Ok(Some(serde_json::from_str(&raw).map_err(|e| {
                StoreError::Malformed {
                    key: self.store.keys().room_conn_meta(room_id),
                    reason: e.to_string(),
                }
            })?)),
        }
    }

    pub async fn remove_conn_meta(&self, room_id: &str, conn_id: &str) -> Result<(), StoreError> {
        let mut conn = self.store.connection();
        let _: () = conn
            .hdel(self.store.keys().room_conn_meta(room_id), conn_id)
            .await?;
        Ok(())
    }

    /// Counts live connections for `user_id` within `room_id` by scanning
    /// the room's conn->metadata map — authoritative within the room, so a
    /// disconnect in another room never miscounts this one.
    pub async fn count_user_connections(
        &self,
        room_id: &str,
        user_id: &str,
    ) -> Result<usize, StoreError> {
        let mut conn = self.store.connection();
        let all: std::collections::HashMap<String, String> = conn
            .hgetall(self.store.keys().room_conn_meta(room_id))
            .await?;
        let mut count = 0usize;
        for raw in all.values() {
            if let Ok(meta) = serde_json::from_str::<ConnMeta>(raw) {
                if meta.user_id == user_id {
                    count += 1;
                }
            }
        }
        Ok(count)
    }

    pub async fn active_rooms(&self) -> Result<Vec<String>, StoreError> {
        let mut conn = self.store.connection();
        Ok(conn.smembers(self.store.keys().active_rooms()).await?)
    }

    pub async fn members(&self, room_id: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.store.connection();
        Ok(conn.smembers(self.store.keys().room_members(room_id)).await?)
    }
}
