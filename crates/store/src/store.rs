use redis::aio::{MultiplexedConnection, PubSub};
use redis::AsyncCommands;

use crate::{error::StoreError, keys::Keys};

/// A handle to the shared store: a cheaply-cloneable multiplexed connection
/// for ordinary commands, plus the `redis::Client` needed to open dedicated
/// (non-multiplexed) connections for pub/sub — multiplexed connections
/// cannot be used for subscriptions.
#[derive(Clone)]
pub struct SharedStore {
    client: redis::Client,
    conn: MultiplexedConnection,
    keys: Keys,
}

impl SharedStore {
    pub async fn connect(url: &str, key_prefix: impl Into<String>) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self {
            client,
            conn,
            keys: Keys::new(key_prefix),
        })
    }

    pub fn keys(&self) -> &Keys {
        &self.keys
    }

    /// A cheap clone of the shared multiplexed connection, suitable for any
    /// single command or pipeline.
    pub fn connection(&self) -> MultiplexedConnection {
        self.conn.clone()
    }

    /// Opens a dedicated, non-multiplexed connection for pub/sub. Each
    /// subscriber (the event bus, the metadata store's change listener)
    /// should hold exactly one of these.
    pub async fn open_pubsub(&self) -> Result<PubSub, StoreError> {
        Ok(self.client.get_async_pubsub().await?)
    }

    pub async fn publish(&self, channel: &str, payload: &str) -> Result<u64, StoreError> {
        let mut conn = self.connection();
        Ok(conn.publish(channel, payload).await?)
    }

    /// `WATCH` the given keys ahead of a `MULTI`/`EXEC` transaction.
    pub async fn watch(&self, conn: &mut MultiplexedConnection, keys: &[String]) -> Result<(), StoreError> {
        let mut cmd = redis::cmd("WATCH");
        for key in keys {
            cmd.arg(key);
        }
        let _: () = cmd.query_async(conn).await?;
        Ok(())
    }

    pub async fn unwatch(&self, conn: &mut MultiplexedConnection) -> Result<(), StoreError> {
        let _: () = redis::cmd("UNWATCH").query_async(conn).await?;
        Ok(())
    }

    /// Loads and evaluates a server-side script. `redis::Script::invoke_async`
    /// already tries EVALSHA first and transparently falls back to EVAL (and
    /// caches the SHA) when the store reports the script is not loaded, so
    /// no explicit NOSCRIPT handling is needed here.
    pub async fn eval<T: redis::FromRedisValue>(
        &self,
        script: &redis::Script,
        invocation: impl FnOnce(redis::ScriptInvocation<'_>) -> redis::ScriptInvocation<'_>,
    ) -> Result<T, StoreError> {
        let mut conn = self.connection();
        let inv = invocation(script.prepare_invoke());
        Ok(inv.invoke_async(&mut conn).await?)
    }
}
