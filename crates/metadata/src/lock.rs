//! Advisory channel locks (spec §4.G's `lockName` precondition).
//!
//! A lock is a single string key holding the owning `userId`. The distilled
//! spec never discusses expiry; this engine additionally supports an
//! optional TTL, matching the corpus's own dedupe-cache pattern
//! (`crates/gateway`) of never leaving an advisory entry with no way out.
//! Default behavior (`ttl_ms: None`) matches the distilled spec exactly.

use pulsemesh_common::{EngineError, PreconditionCode};
use pulsemesh_store::{SharedStore, StoreError};
use redis::AsyncCommands;

#[derive(Debug, Clone, Copy, Default)]
pub struct LockOptions {
    pub ttl_ms: Option<u64>,
}

#[derive(Clone)]
pub struct Locks {
    store: SharedStore,
}

impl Locks {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    pub async fn acquire(
        &self,
        channel_type: &str,
        channel_name: &str,
        lock_name: &str,
        owner_user_id: &str,
        options: LockOptions,
    ) -> Result<(), StoreError> {
        let key = self.store.keys().chan_lock(channel_type, channel_name, lock_name);
        let mut conn = self.store.connection();
        match options.ttl_ms {
            Some(ttl) => {
                let _: () = conn.set_ex(key, owner_user_id, ttl.max(1).div_ceil(1000)).await?;
            },
            None => {
                let _: () = conn.set(key, owner_user_id).await?;
            },
        }
        Ok(())
    }

    pub async fn release(&self, channel_type: &str, channel_name: &str, lock_name: &str) -> Result<(), StoreError> {
        let key = self.store.keys().chan_lock(channel_type, channel_name, lock_name);
        let mut conn = self.store.connection();
        let _: () = conn.del(key).await?;
        Ok(())
    }

    /// Verifies precondition (i): the lock must exist and be owned by
    /// `actor_user_id`. Called before any mutation that specifies `lockName`.
    pub async fn verify(
        &self,
        channel_type: &str,
        channel_name: &str,
        lock_name: &str,
        actor_user_id: Option<&str>,
    ) -> Result<(), EngineError> {
        let key = self.store.keys().chan_lock(channel_type, channel_name, lock_name);
        let mut conn = self.store.connection();
        let owner: Option<String> = conn.get(key).await.map_err(StoreError::from)?;

        match owner {
            None => Err(EngineError::precondition(
                PreconditionCode::MetadataLock,
                format!("lock '{lock_name}' is not held"),
            )),
            Some(owner) => match actor_user_id {
                Some(actor) if actor == owner => Ok(()),
                _ => Err(EngineError::precondition(
                    PreconditionCode::MetadataLock,
                    format!("lock '{lock_name}' is owned by another user"),
                )),
            },
        }
    }
}
