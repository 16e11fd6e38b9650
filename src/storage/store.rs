//! A store which keeps the checkpoints and the results in different backends.

use async_trait::async_trait;

use crate::{
    state_machine::coordinator::Checkpoint,
    storage::{CoordinatorStorage, ModelStorage, Storage, StorageResult},
};

/// Combines a checkpoint backend and a result backend into a single [`Storage`].
///
/// A typical setup keeps the checkpoints in Redis and the results on the filesystem.
#[derive(Debug, Clone)]
pub struct Store<C, M>
where
    C: CoordinatorStorage,
    M: ModelStorage,
{
    checkpoints: C,
    results: M,
}

impl<C, M> Store<C, M>
where
    C: CoordinatorStorage,
    M: ModelStorage,
{
    pub fn new(checkpoints: C, results: M) -> Self {
        Self {
            checkpoints,
            results,
        }
    }
}

#[async_trait]
impl<C, M> CoordinatorStorage for Store<C, M>
where
    C: CoordinatorStorage,
    M: ModelStorage,
{
    async fn save_checkpoint(&mut self, checkpoint: &Checkpoint) -> StorageResult<()> {
        self.checkpoints.save_checkpoint(checkpoint).await
    }

    async fn load_latest_checkpoint(&mut self) -> StorageResult<Option<Checkpoint>> {
        self.checkpoints.load_latest_checkpoint().await
    }

    async fn delete_coordinator_data(&mut self) -> StorageResult<()> {
        self.checkpoints.delete_coordinator_data().await
    }

    async fn is_ready(&mut self) -> StorageResult<()> {
        CoordinatorStorage::is_ready(&mut self.checkpoints).await
    }
}

#[async_trait]
impl<C, M> ModelStorage for Store<C, M>
where
    C: CoordinatorStorage,
    M: ModelStorage,
{
    async fn put_result(&mut self, round_id: u64, blob: &[u8]) -> StorageResult<String> {
        self.results.put_result(round_id, blob).await
    }

    async fn get_result(&mut self, handle: &str) -> StorageResult<Option<Vec<u8>>> {
        self.results.get_result(handle).await
    }

    async fn is_ready(&mut self) -> StorageResult<()> {
        ModelStorage::is_ready(&mut self.results).await
    }
}

#[async_trait]
impl<C, M> Storage for Store<C, M>
where
    C: CoordinatorStorage,
    M: ModelStorage,
{
    async fn is_ready(&mut self) -> StorageResult<()> {
        tokio::try_join!(
            CoordinatorStorage::is_ready(&mut self.checkpoints),
            ModelStorage::is_ready(&mut self.results)
        )
        .map(|_| ())
    }
}
