//! Lua scripts backing the scripted heartbeat and scripted join
//! accelerators (spec §4.H). Both collapse a read-then-write sequence that
//! would otherwise cost several round-trips into one, following the
//! `LUA_PUT`/`LUA_PUT_IF_VERSION` idiom of atomic hash/index/TTL updates in
//! a single script — generalized here to a JSON-blob connection record
//! (`cjson.decode`/`cjson.encode`) instead of discrete hash fields, since
//! that is how `pulsemesh-registry` stores a connection.
//!
//! Caveat: the room-scoped index keys (`{room:<id>}:conns`, `:lastseen`,
//! `:connmeta`, plus the global `active_rooms`/`user:<id>:conns` sets) are
//! built inside the script from `ARGV` rather than declared as `KEYS[]`,
//! because the scripted heartbeat only knows which room a connection
//! belongs to after reading the connection record itself. This is safe
//! against a single-node store or a store accessed through a
//! slot-transparent proxy; a strict Redis Cluster deployment would need the
//! caller to supply the room id up front (it does not, for heartbeat) or to
//! accept the script crossing hash slots.

use pulsemesh_common::now_ms;
use pulsemesh_store::{SharedStore, StoreError};
use redis::Script;
use serde::{Deserialize, Serialize};
use serde_json::Value;

const LUA_SCRIPTED_JOIN: &str = r#"
local raw = redis.call('GET', KEYS[1])
local prior_epoch = nil
if raw then
    local existing = cjson.decode(raw)
    prior_epoch = existing.epoch
end

local now = tonumber(ARGV[4])
local epoch
if prior_epoch then
    epoch = prior_epoch + 1
    if epoch < now then epoch = now end
else
    epoch = now
end

local record = {
    conn_id = ARGV[3],
    user_id = ARGV[2],
    room_id = ARGV[1],
    last_seen_ms = now,
    epoch = epoch,
    state = cjson.decode(ARGV[6]),
}
redis.call('SET', KEYS[1], cjson.encode(record), 'PX', ARGV[5])

local prefix = ARGV[7]
local room_tag = '{room:' .. ARGV[1] .. '}'
redis.call('SADD', prefix .. ':' .. room_tag .. ':conns', ARGV[3])
redis.call('SADD', prefix .. ':' .. room_tag .. ':members', ARGV[2])
redis.call('ZADD', prefix .. ':' .. room_tag .. ':lastseen', now, ARGV[3])
redis.call('HSET', prefix .. ':' .. room_tag .. ':connmeta', ARGV[3],
    cjson.encode({user_id = ARGV[2], epoch = epoch}))
redis.call('SADD', prefix .. ':active_rooms', ARGV[1])
redis.call('SADD', prefix .. ':user:' .. ARGV[2] .. ':conns', ARGV[3])

return epoch
"#;

const LUA_SCRIPTED_HEARTBEAT: &str = r#"
local raw = redis.call('GET', KEYS[1])
if not raw then
    return cjson.encode({found = false, stale = false, changed = false, epoch = 0})
end

local record = cjson.decode(raw)
local stored_epoch = record.epoch
local requested = ARGV[1]

if requested ~= '' then
    local req = tonumber(requested)
    if req < stored_epoch then
        return cjson.encode({found = true, stale = true, changed = false, epoch = stored_epoch})
    elseif req > stored_epoch then
        record.epoch = req
    end
end

local prev_state_json = cjson.encode(record.state)
if ARGV[4] ~= '' then
    local patch = cjson.decode(ARGV[4])
    if type(patch) == 'table' and next(patch) ~= nil then
        if type(record.state) ~= 'table' then
            record.state = {}
        end
        for k, v in pairs(patch) do
            record.state[k] = v
        end
    end
end

record.last_seen_ms = tonumber(ARGV[2])
local changed = cjson.encode(record.state) ~= prev_state_json
redis.call('SET', KEYS[1], cjson.encode(record), 'PX', ARGV[3])

local prefix = ARGV[5]
local room_tag = '{room:' .. record.room_id .. '}'
redis.call('ZADD', prefix .. ':' .. room_tag .. ':lastseen', ARGV[2], record.conn_id)
if record.epoch ~= stored_epoch then
    redis.call('HSET', prefix .. ':' .. room_tag .. ':connmeta', record.conn_id,
        cjson.encode({user_id = record.user_id, epoch = record.epoch}))
end

return cjson.encode({
    found = true,
    stale = false,
    changed = changed,
    epoch = record.epoch,
    room_id = record.room_id,
    user_id = record.user_id,
    state = record.state,
})
"#;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScriptedHeartbeatOutcome {
    pub found: bool,
    pub stale: bool,
    pub changed: bool,
    pub epoch: i64,
    #[serde(default)]
    pub room_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub state: Option<Value>,
}

/// Wraps the two server-side scripts. `redis::Script::invoke_async` already
/// tries EVALSHA first and falls back to EVAL (caching the resulting SHA)
/// when the store reports the script isn't cached, so no explicit NOSCRIPT
/// retry is needed on our side — matching `SharedStore::eval`'s own doc
/// comment.
#[derive(Clone)]
pub struct ScriptedOps {
    store: SharedStore,
    join_script: Script,
    heartbeat_script: Script,
}

impl ScriptedOps {
    pub fn new(store: SharedStore) -> Self {
        Self {
            store,
            join_script: Script::new(LUA_SCRIPTED_JOIN),
            heartbeat_script: Script::new(LUA_SCRIPTED_HEARTBEAT),
        }
    }

    /// Atomically computes the next epoch and writes the connection record
    /// plus every room index in one round-trip. Returns the epoch assigned.
    pub async fn join(
        &self,
        room_id: &str,
        user_id: &str,
        conn_id: &str,
        ttl_ms: u64,
        initial_state: &Value,
    ) -> Result<i64, StoreError> {
        let conn_key = self.store.keys().conn(conn_id);
        let state_json = serde_json::to_string(initial_state).map_err(|e| StoreError::Malformed {
            key: conn_key.clone(),
            reason: e.to_string(),
        })?;
        let now = now_ms();
        self.store
            .eval(&self.join_script, |inv| {
                inv.key(&conn_key)
                    .arg(room_id)
                    .arg(user_id)
                    .arg(conn_id)
                    .arg(now)
                    .arg(ttl_ms.max(1))
                    .arg(&state_json)
                    .arg(self.store.keys().prefix())
            })
            .await
    }

    /// Atomically validates the epoch, merges `patch_state` if present,
    /// refreshes `lastSeen`/TTL and the room conn-metadata map, in one
    /// round-trip.
    pub async fn heartbeat(
        &self,
        conn_id: &str,
        patch_state: Option<&Value>,
        requested_epoch: Option<i64>,
        ttl_ms: u64,
    ) -> Result<ScriptedHeartbeatOutcome, StoreError> {
        let conn_key = self.store.keys().conn(conn_id);
        let patch_json = match patch_state {
            Some(v) if !v.is_null() => serde_json::to_string(v).map_err(|e| StoreError::Malformed {
                key: conn_key.clone(),
                reason: e.to_string(),
            })?,
            _ => String::new(),
        };
        let requested = requested_epoch.map(|e| e.to_string()).unwrap_or_default();
        let now = now_ms();

        let raw: String = self
            .store
            .eval(&self.heartbeat_script, |inv| {
                inv.key(&conn_key)
                    .arg(&requested)
                    .arg(now)
                    .arg(ttl_ms.max(1))
                    .arg(&patch_json)
                    .arg(self.store.keys().prefix())
            })
            .await?;

        serde_json::from_str(&raw).map_err(|e| StoreError::Malformed {
            key: conn_key,
            reason: e.to_string(),
        })
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_outcome_round_trips_through_json() {
        let outcome = ScriptedHeartbeatOutcome {
            found: true,
            stale: false,
            changed: true,
            epoch: 42,
            room_id: Some("r1".to_string()),
            user_id: Some("u1".to_string()),
            state: Some(serde_json::json!({"mic": true})),
        };
        let raw = serde_json::to_string(&outcome).expect("serialize");
        let parsed: ScriptedHeartbeatOutcome = serde_json::from_str(&raw).expect("deserialize");
        assert_eq!(parsed.epoch, 42);
        assert!(parsed.changed);
        assert_eq!(parsed.state, outcome.state);
    }

    #[test]
    fn scripts_are_non_empty() {
        assert!(!LUA_SCRIPTED_JOIN.is_empty());
        assert!(!LUA_SCRIPTED_HEARTBEAT.is_empty());
    }
}
