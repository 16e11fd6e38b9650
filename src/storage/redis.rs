//! A Redis compatible [`CoordinatorStorage`].
//!
//! # Redis Data Model
//!
//!```text
//! {
//!     // The latest checkpoint
//!     "checkpoint": "...", // bincode encoded string
//! }
//! ```
//!
//! A checkpoint is written with a single `SET`, hence it is either stored entirely or not at all.

use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands, IntoConnectionInfo};
pub use redis::{RedisError, RedisResult};
use tracing::debug;

use crate::{
    state_machine::coordinator::Checkpoint,
    storage::{CoordinatorStorage, StorageError, StorageResult},
};

const CHECKPOINT_KEY: &str = "checkpoint";

#[derive(Clone)]
pub struct Client {
    connection: ConnectionManager,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Redis client").finish()
    }
}

fn to_storage_err(e: RedisError) -> StorageError {
    anyhow::anyhow!(e)
}

impl Client {
    /// Creates a new Redis client.
    ///
    /// `url` to which Redis instance the client should connect to.
    /// The URL format is `redis://[<username>][:<passwd>@]<hostname>[:port][/<db>]`.
    ///
    /// The [`Client`] uses a [`redis::aio::ConnectionManager`] that automatically reconnects
    /// if the connection is dropped.
    pub async fn new<T: IntoConnectionInfo>(url: T) -> Result<Self, RedisError> {
        let client = redis::Client::open(url)?;
        let connection = client.get_tokio_connection_manager().await?;
        Ok(Self { connection })
    }

    #[cfg(test)]
    pub async fn flush_db(&mut self) -> RedisResult<()> {
        debug!("flush current database");
        // https://redis.io/commands/flushdb
        // > This command never fails.
        redis::cmd("FLUSHDB")
            .arg("ASYNC")
            .query_async(&mut self.connection)
            .await
    }
}

#[async_trait]
impl CoordinatorStorage for Client {
    async fn save_checkpoint(&mut self, checkpoint: &Checkpoint) -> StorageResult<()> {
        debug!(
            "save checkpoint of round {} in phase {}",
            checkpoint.round_id, checkpoint.phase
        );
        let value = bincode::serialize(checkpoint)?;
        // https://redis.io/commands/set
        // > Set key to hold the string value. If key already holds a value,
        //   it is overwritten, regardless of its type.
        self.connection
            .set(CHECKPOINT_KEY, value)
            .await
            .map_err(to_storage_err)
    }

    async fn load_latest_checkpoint(&mut self) -> StorageResult<Option<Checkpoint>> {
        // https://redis.io/commands/get
        // > Bulk string reply: the value of key, or nil when key does not exist.
        let value: Option<Vec<u8>> = self
            .connection
            .get(CHECKPOINT_KEY)
            .await
            .map_err(to_storage_err)?;
        match value {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    async fn delete_coordinator_data(&mut self) -> StorageResult<()> {
        debug!("flush coordinator data");
        // https://redis.io/commands/del
        // > The number of keys that were removed.
        // We ignore the return value because we are not interested in it.
        let _: u64 = self
            .connection
            .del(CHECKPOINT_KEY)
            .await
            .map_err(to_storage_err)?;
        Ok(())
    }

    async fn is_ready(&mut self) -> StorageResult<()> {
        redis::cmd("PING")
            .query_async(&mut self.connection)
            .await
            .map_err(to_storage_err)
    }
}
