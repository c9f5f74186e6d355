//! Key schema for the shared store. Per-room and per-channel keys carry a
//! hash tag (`{room:<id>}`, `{chan:<type>:<name>}`) so a clustered store
//! colocates all keys for the same room or channel on one shard.
//!
//! All key-building lives here so the schema has exactly one definition
//! site; callers never hand-format a key.

use crate::error::StoreError;

#[derive(Debug, Clone)]
pub struct Keys {
    prefix: String,
}

impl Keys {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Rejects ids that contain hash-tag braces, which would let a caller
    /// escape its hash slot and break colocation.
    pub fn validate_id(id: &str) -> Result<(), StoreError> {
        if id.is_empty() {
            return Err(StoreError::InvalidId {
                id: id.to_string(),
                reason: "id must not be empty",
            });
        }
        if id.contains('{') || id.contains('}') {
            return Err(StoreError::InvalidId {
                id: id.to_string(),
                reason: "id must not contain '{' or '}'",
            });
        }
        Ok(())
    }

    /// The raw key prefix, for callers (the scripted heartbeat/join
    /// accelerators) that build room-scoped key names themselves instead of
    /// going through a dedicated builder here.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn conn(&self, conn_id: &str) -> String {
        format!("{}:conn:{conn_id}", self.prefix)
    }

    pub fn user_conns(&self, user_id: &str) -> String {
        format!("{}:user:{user_id}:conns", self.prefix)
    }

    pub fn room_members(&self, room_id: &str) -> String {
        format!("{}:{{room:{room_id}}}:members", self.prefix)
    }

    pub fn room_conns(&self, room_id: &str) -> String {
        format!("{}:{{room:{room_id}}}:conns", self.prefix)
    }

    /// Sorted set of connIds in the room, scored by lastSeenMs — the
    /// reaper's stale-connection sweep reads this.
    pub fn room_lastseen(&self, room_id: &str) -> String {
        format!("{}:{{room:{room_id}}}:lastseen", self.prefix)
    }

    /// Hash mapping connId -> `{userId, epoch}` JSON, the reaper's only
    /// source for a departed connection's identity once its own record
    /// has expired.
    pub fn room_conn_meta(&self, room_id: &str) -> String {
        format!("{}:{{room:{room_id}}}:connmeta", self.prefix)
    }

    pub fn room_events(&self, room_id: &str) -> String {
        format!("{}:{{room:{room_id}}}:events", self.prefix)
    }

    pub fn room_events_pattern(&self) -> String {
        format!("{}:{{room:*}}:events", self.prefix)
    }

    pub fn active_rooms(&self) -> String {
        format!("{}:active_rooms", self.prefix)
    }

    pub fn chan_meta(&self, channel_type: &str, channel_name: &str) -> String {
        format!("{}:{{chan:{channel_type}:{channel_name}}}:meta", self.prefix)
    }

    pub fn chan_meta_events(&self, channel_type: &str, channel_name: &str) -> String {
        format!(
            "{}:{{chan:{channel_type}:{channel_name}}}:meta_events",
            self.prefix
        )
    }

    pub fn chan_meta_events_pattern(&self) -> String {
        format!("{}:{{chan:*}}:meta_events", self.prefix)
    }

    pub fn chan_lock(&self, channel_type: &str, channel_name: &str, lock_name: &str) -> String {
        format!(
            "{}:{{chan:{channel_type}:{channel_name}}}:lock:{lock_name}",
            self.prefix
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_keys_share_a_hash_tag() {
        let keys = Keys::new("prs");
        assert!(keys.room_members("r1").contains("{room:r1}"));
        assert!(keys.room_conns("r1").contains("{room:r1}"));
        assert!(keys.room_lastseen("r1").contains("{room:r1}"));
    }

    #[test]
    fn rejects_braces_in_id() {
        assert!(Keys::validate_id("ok-room").is_ok());
        assert!(Keys::validate_id("r{1}").is_err());
        assert!(Keys::validate_id("").is_err());
    }
}
