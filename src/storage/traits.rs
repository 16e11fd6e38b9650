//! Storage API.

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::state_machine::coordinator::Checkpoint;

/// The error type for storage operations that are not directly related to application domain.
/// These include, for example IO errors like broken pipe, file not found, out-of-memory, etc.
pub type StorageError = anyhow::Error;

/// The result of the storage operation.
pub type StorageResult<T> = Result<T, StorageError>;

#[async_trait]
/// An abstract store of the round checkpoints.
pub trait CoordinatorStorage
where
    Self: Clone + Send + Sync + 'static,
{
    /// Saves a [`Checkpoint`].
    ///
    /// # Behavior
    ///
    /// - The checkpoint becomes the latest checkpoint and `StorageResult::Ok(())` is returned.
    /// - A checkpoint is either saved entirely or not at all.
    async fn save_checkpoint(&mut self, checkpoint: &Checkpoint) -> StorageResult<()>;

    /// Returns the latest [`Checkpoint`].
    ///
    /// # Behavior
    ///
    /// - If no checkpoint has been saved yet, return `StorageResult::Ok(Option::None)`.
    /// - If a checkpoint exists, return `StorageResult::Ok(Some(Checkpoint))`.
    async fn load_latest_checkpoint(&mut self) -> StorageResult<Option<Checkpoint>>;

    /// Deletes all coordinator data.
    ///
    /// # Behavior
    ///
    /// Return `StorageResult::Ok(())` if the data was deleted successfully or if there was
    /// nothing to delete, otherwise return `StorageResult::Err(error)`.
    async fn delete_coordinator_data(&mut self) -> StorageResult<()>;

    /// Checks if the [`CoordinatorStorage`] is ready to process requests.
    ///
    /// # Behavior
    ///
    /// If the [`CoordinatorStorage`] is ready to process requests, return `StorageResult::Ok(())`.
    /// If the [`CoordinatorStorage`] cannot process requests because of a connection error,
    /// for example, return `StorageResult::Err(error)`.
    async fn is_ready(&mut self) -> StorageResult<()>;
}

#[async_trait]
/// An abstract store of the round results.
pub trait ModelStorage
where
    Self: Clone + Send + Sync + 'static,
{
    /// Stores the serialized result of a round and returns its handle.
    ///
    /// # Behavior
    ///
    /// - The handle is created by [`create_result_handle()`](Self::create_result_handle).
    /// - Storing the same result again succeeds and returns the same handle.
    async fn put_result(&mut self, round_id: u64, blob: &[u8]) -> StorageResult<String>;

    /// Returns a stored result.
    ///
    /// # Behavior
    ///
    /// - If the result does not exist, return `StorageResult::Ok(Option::None)`.
    /// - If the result exists, return `StorageResult::Ok(Option::Some(blob))`.
    async fn get_result(&mut self, handle: &str) -> StorageResult<Option<Vec<u8>>>;

    /// Creates a unique result handle from the round id and the content of the result.
    ///
    /// The format of the default implementation is `roundid_digest`, where the digest is the
    /// first eight bytes of the SHA-256 hash of the blob, encoded in hexadecimal.
    fn create_result_handle(round_id: u64, blob: &[u8]) -> String {
        let digest = Sha256::digest(blob);
        format!("{}_{}", round_id, hex::encode(&digest[..8]))
    }

    /// Checks if the [`ModelStorage`] is ready to process requests.
    ///
    /// # Behavior
    ///
    /// If the [`ModelStorage`] is ready to process requests, return `StorageResult::Ok(())`.
    /// If the [`ModelStorage`] cannot process requests because of a connection error,
    /// for example, return `StorageResult::Err(error)`.
    async fn is_ready(&mut self) -> StorageResult<()>;
}

#[async_trait]
pub trait Storage: CoordinatorStorage + ModelStorage {
    /// Checks if the [`CoordinatorStorage`] and the [`ModelStorage`] are ready to process
    /// requests.
    ///
    /// # Behavior
    ///
    /// If all inner services are ready to process requests,
    /// return `StorageResult::Ok(())`.
    /// If any inner service cannot process requests because of a connection error,
    /// for example, return `StorageResult::Err(error)`.
    async fn is_ready(&mut self) -> StorageResult<()>;
}
