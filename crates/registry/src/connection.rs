use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use pulsemesh_store::{SharedStore, StoreError};

/// Durable state for one connection. `state` is an unordered bag of
/// string keys to arbitrary JSON values, merged on each heartbeat patch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionRecord {
    pub conn_id: String,
    pub user_id: String,
    pub room_id: String,
    pub last_seen_ms: u64,
    pub epoch: i64,
    #[serde(default)]
    pub state: Value,
}

#[derive(Clone)]
pub struct ConnectionRegistry {
    store: SharedStore,
}

impl ConnectionRegistry {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    pub async fn read(&self, conn_id: &str) -> Result<Option<ConnectionRecord>, StoreError> {
        let mut conn = self.store.connection();
        let raw: Option<String> = conn.get(self.store.keys().conn(conn_id)).await?;
        match raw {
            None => Ok(None),
            Some(raw) => {
                let record = serde_json::from_str(&raw).map_err(|e| StoreError::Malformed {
                    key: self.store.keys().conn(conn_id),
                    reason: e.to_string(),
                })?;
                Ok(Some(record))
            },
        }
    }

    pub async fn write_initial(
        &self,
        record: &ConnectionRecord,
        ttl_ms: u64,
    ) -> Result<(), StoreError> {
        let mut conn = self.store.connection();
        let raw = serde_json::to_string(record).map_err(|e| StoreError::Malformed {
            key: self.store.keys().conn(&record.conn_id),
            reason: e.to_string(),
        })?;
        let _: () = redis::cmd("SET")
            .arg(self.store.keys().conn(&record.conn_id))
            .arg(raw)
            .arg("PX")
            .arg(ttl_ms.max(1))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    /// Refreshes `lastSeenMs` and the TTL without touching `state`. Returns
    /// `false` if the record no longer exists.
    pub async fn touch(
        &self,
        conn_id: &str,
        last_seen_ms: u64,
        ttl_ms: u64,
    ) -> Result<bool, StoreError> {
        let Some(mut record) = self.read(conn_id).await? else {
            return Ok(false);
        };
        record.last_seen_ms = last_seen_ms;
        self.write_initial(&record, ttl_ms).await?;
        Ok(true)
    }

    /// Merges `patch` into the stored state with last-write-wins on keys.
    /// Returns the updated record, or `None` if the connection is gone.
    pub async fn patch_state(
        &self,
        conn_id: &str,
        patch: &Value,
        last_seen_ms: u64,
        ttl_ms: u64,
    ) -> Result<Option<ConnectionRecord>, StoreError> {
        let Some(mut record) = self.read(conn_id).await? else {
            return Ok(None);
        };
        merge_json(&mut record.state, patch);
        record.last_seen_ms = last_seen_ms;
        self.write_initial(&record, ttl_ms).await?;
        Ok(Some(record))
    }

    pub async fn set_epoch(&self, conn_id: &str, epoch: i64, ttl_ms: u64) -> Result<(), StoreError> {
        if let Some(mut record) = self.read(conn_id).await? {
            record.epoch = epoch;
            self.write_initial(&record, ttl_ms).await?;
        }
        Ok(())
    }

    pub async fn delete(&self, conn_id: &str) -> Result<(), StoreError> {
        let mut conn = self.store.connection();
        let _: () = conn.del(self.store.keys().conn(conn_id)).await?;
        Ok(())
    }
}

/// Shallow last-write-wins merge of JSON object keys. Non-object patches
/// (or a non-object base) simply replace the base wholesale.
fn merge_json(base: &mut Value, patch: &Value) {
    match (base.as_object_mut(), patch.as_object()) {
        (Some(base_obj), Some(patch_obj)) => {
            for (k, v) in patch_obj {
                base_obj.insert(k.clone(), v.clone());
            }
        },
        _ => *base = patch.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_is_last_write_wins_shallow() {
        let mut base = serde_json::json!({"mic": true, "typing": false});
        let patch = serde_json::json!({"typing": true});
        merge_json(&mut base, &patch);
        assert_eq!(base, serde_json::json!({"mic": true, "typing": true}));
    }

    #[test]
    fn merge_replaces_non_object_base() {
        let mut base = Value::Null;
        let patch = serde_json::json!({"mic": true});
        merge_json(&mut base, &patch);
        assert_eq!(base, serde_json::json!({"mic": true}));
    }
}
