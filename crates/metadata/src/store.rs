use std::time::Duration;

use chrono::Utc;
use pulsemesh_common::{EngineError, MetadataEvent, MetadataOperation, now_ms};
use pulsemesh_events::EventBus;
use pulsemesh_store::{Keys, SharedStore, StoreError};
use redis::AsyncCommands;
use tracing::warn;

use crate::cas::{apply_remove, apply_set, apply_update, check_major_revision_cas};
use crate::lock::Locks;
use crate::params::{GetParams, RemoveParams, SetParams, UpdateParams};
use crate::record::{MetadataEventItemList, MetadataRecord, MetadataResponse};

/// `maxRetries` default for the transactional concurrency variant (spec §4.G).
const DEFAULT_MAX_RETRIES: u32 = 5;
const DEFAULT_RETRY_DELAY_MS: u64 = 10;

#[derive(Clone)]
pub struct MetadataStore {
    store: SharedStore,
    bus: EventBus,
    locks: Locks,
    transactional: bool,
    max_retries: u32,
    retry_delay_ms: u64,
}

impl MetadataStore {
    pub fn new(store: SharedStore, bus: EventBus, transactional: bool) -> Self {
        Self {
            locks: Locks::new(store.clone()),
            store,
            bus,
            transactional,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
        }
    }

    pub fn with_retry_policy(mut self, max_retries: u32, retry_delay_ms: u64) -> Self {
        self.max_retries = max_retries;
        self.retry_delay_ms = retry_delay_ms;
        self
    }

    pub fn locks(&self) -> &Locks {
        &self.locks
    }

    pub async fn get(&self, params: GetParams) -> Result<MetadataResponse, EngineError> {
        Keys::validate_id(&params.channel_type).map_err(EngineError::from)?;
        Keys::validate_id(&params.channel_name).map_err(EngineError::from)?;
        let record = self.read_record(&params.channel_type, &params.channel_name).await?;
        Ok(MetadataResponse::from_record(
            &params.channel_type,
            &params.channel_name,
            &record,
            now_ms(),
        ))
    }

    pub async fn set(&self, params: SetParams) -> Result<MetadataResponse, EngineError> {
        let add_timestamp = params.options.add_timestamp;
        let add_user_id = params.options.add_user_id;
        let actor = params.actor_user_id.clone();
        let data = params.data.clone();
        self.mutate(
            &params.channel_type,
            &params.channel_name,
            &params.options.lock_name,
            params.options.major_revision,
            params.actor_user_id.clone(),
            MetadataOperation::Set,
            move |current| {
                let now_iso = Utc::now().to_rfc3339();
                Ok(apply_set(
                    current,
                    &data,
                    add_timestamp,
                    add_user_id,
                    actor.as_deref(),
                    &now_iso,
                ))
            },
        )
        .await
    }

    pub async fn update(&self, params: UpdateParams) -> Result<MetadataResponse, EngineError> {
        let add_timestamp = params.options.add_timestamp;
        let add_user_id = params.options.add_user_id;
        let actor = params.actor_user_id.clone();
        let data = params.data.clone();
        self.mutate(
            &params.channel_type,
            &params.channel_name,
            &params.options.lock_name,
            params.options.major_revision,
            params.actor_user_id.clone(),
            MetadataOperation::Update,
            move |current| {
                let now_iso = Utc::now().to_rfc3339();
                apply_update(current, &data, add_timestamp, add_user_id, actor.as_deref(), &now_iso)
            },
        )
        .await
    }

    pub async fn remove(&self, params: RemoveParams) -> Result<MetadataResponse, EngineError> {
        let keys = params.keys.clone();
        self.mutate(
            &params.channel_type,
            &params.channel_name,
            &params.options.lock_name,
            params.options.major_revision,
            params.actor_user_id.clone(),
            MetadataOperation::Remove,
            move |current| Ok::<_, EngineError>(apply_remove(current, keys.as_deref())),
        )
        .await
    }

    async fn read_record(&self, channel_type: &str, channel_name: &str) -> Result<MetadataRecord, EngineError> {
        let key = self.store.keys().chan_meta(channel_type, channel_name);
        let mut conn = self.store.connection();
        let raw: Option<String> = conn.get(&key).await.map_err(StoreError::from)?;
        match raw {
            None => Ok(MetadataRecord::default()),
            Some(raw) => serde_json::from_str(&raw).map_err(|e| {
                EngineError::from(StoreError::Malformed {
                    key,
                    reason: e.to_string(),
                })
            }),
        }
    }

    /// Runs the shared precondition checks (lock, majorRevision CAS) and
    /// then dispatches to the configured concurrency path. `apply` is the
    /// pure mutation from `cas.rs`, closing over the operation's own
    /// parameters; it re-runs on every retry of the transactional path, so
    /// it must be side-effect free.
    #[allow(clippy::too_many_arguments)]
    async fn mutate<F>(
        &self,
        channel_type: &str,
        channel_name: &str,
        lock_name: &Option<String>,
        major_revision: Option<u64>,
        actor_user_id: Option<String>,
        operation: MetadataOperation,
        apply: F,
    ) -> Result<MetadataResponse, EngineError>
    where
        F: Fn(&MetadataRecord) -> Result<(MetadataRecord, MetadataEventItemList), EngineError> + Send,
    {
        Keys::validate_id(channel_type).map_err(EngineError::from)?;
        Keys::validate_id(channel_name).map_err(EngineError::from)?;

        if let Some(lock_name) = lock_name {
            self.locks
                .verify(channel_type, channel_name, lock_name, actor_user_id.as_deref())
                .await?;
        }

        let (record, touched, bumped) = if self.transactional {
            self.mutate_transactional(channel_type, channel_name, major_revision, &apply)
                .await?
        } else {
            self.mutate_default(channel_type, channel_name, major_revision, &apply)
                .await?
        };

        if bumped {
            let event = MetadataEvent {
                channel_type: channel_type.to_string(),
                channel_name: channel_name.to_string(),
                operation,
                items: touched,
                major_revision: record.major_revision,
                timestamp: now_ms(),
                author_uid: actor_user_id,
            };
            if let Err(e) = self.bus.publish_metadata(&event).await {
                warn!(error = %e, channel_type, channel_name, "metadata: event publish failed (best-effort)");
            }
        }

        Ok(MetadataResponse::from_record(channel_type, channel_name, &record, now_ms()))
    }

    /// Default concurrency path: read, apply, write, with a post-hoc
    /// `majorRevision` CAS check. Susceptible to a lost update between the
    /// read and the write under contention (spec §4.G).
    async fn mutate_default<F>(
        &self,
        channel_type: &str,
        channel_name: &str,
        major_revision: Option<u64>,
        apply: &F,
    ) -> Result<(MetadataRecord, MetadataEventItemList, bool), EngineError>
    where
        F: Fn(&MetadataRecord) -> Result<(MetadataRecord, MetadataEventItemList), EngineError>,
    {
        let current = self.read_record(channel_type, channel_name).await?;
        check_major_revision_cas(&current, major_revision)?;
        let (record, touched) = apply(&current)?;
        self.write_record(channel_type, channel_name, &record).await?;
        let bumped = record.major_revision != current.major_revision;
        Ok((record, touched, bumped))
    }

    /// Transactional concurrency path: `WATCH` the record key, re-read,
    /// stage the mutated record behind `MULTI`/`EXEC`. A `None` result from
    /// the pipeline means the watch fired (another writer committed first);
    /// retry up to `max_retries` with `retry_delay_ms` between attempts.
    /// A CAS/validation failure from `apply` itself is not transient, so it
    /// unwatches and returns immediately without retrying.
    async fn mutate_transactional<F>(
        &self,
        channel_type: &str,
        channel_name: &str,
        major_revision: Option<u64>,
        apply: &F,
    ) -> Result<(MetadataRecord, MetadataEventItemList, bool), EngineError>
    where
        F: Fn(&MetadataRecord) -> Result<(MetadataRecord, MetadataEventItemList), EngineError>,
    {
        let key = self.store.keys().chan_meta(channel_type, channel_name);
        let mut conn = self.store.connection();

        for attempt in 0..=self.max_retries {
            self.store.watch(&mut conn, &[key.clone()]).await?;

            let current = self.read_record(channel_type, channel_name).await?;
            if let Err(e) = check_major_revision_cas(&current, major_revision) {
                self.store.unwatch(&mut conn).await?;
                return Err(e);
            }
            let (record, touched) = match apply(&current) {
                Ok(ok) => ok,
                Err(e) => {
                    self.store.unwatch(&mut conn).await?;
                    return Err(e);
                },
            };

            let payload = serde_json::to_string(&record).map_err(|e| {
                EngineError::from(StoreError::Malformed {
                    key: key.clone(),
                    reason: e.to_string(),
                })
            })?;

            let mut pipe = redis::pipe();
            pipe.atomic().set(&key, payload);
            let result: Option<()> = pipe.query_async(&mut conn).await.map_err(StoreError::from)?;

            match result {
                Some(()) => {
                    let bumped = record.major_revision != current.major_revision;
                    return Ok((record, touched, bumped));
                },
                None => {
                    if attempt == self.max_retries {
                        return Err(StoreError::TransactionConflict {
                            attempts: attempt + 1,
                        }
                        .into());
                    }
                    tokio::time::sleep(Duration::from_millis(self.retry_delay_ms)).await;
                },
            }
        }

        unreachable!("loop above always returns by its last iteration")
    }

    async fn write_record(
        &self,
        channel_type: &str,
        channel_name: &str,
        record: &MetadataRecord,
    ) -> Result<(), EngineError> {
        let key = self.store.keys().chan_meta(channel_type, channel_name);
        let payload = serde_json::to_string(record).map_err(|e| {
            EngineError::from(StoreError::Malformed {
                key: key.clone(),
                reason: e.to_string(),
            })
        })?;
        let mut conn = self.store.connection();
        let _: () = conn.set(key, payload).await.map_err(StoreError::from)?;
        Ok(())
    }
}
