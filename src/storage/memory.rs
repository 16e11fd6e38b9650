//! An in-memory store.
//!
//! Checkpoints and results live as long as the last clone of the [`MemoryStore`]. The store can
//! be told to fail its writes, which makes it the backend of choice to exercise the retry and
//! failure paths of the coordinator.

use std::{collections::HashMap, sync::Arc};

use anyhow::anyhow;
use async_trait::async_trait;
use parking_lot::Mutex;

use crate::{
    state_machine::coordinator::Checkpoint,
    storage::{CoordinatorStorage, ModelStorage, Storage, StorageResult},
};

#[derive(Debug, Default)]
struct Inner {
    checkpoints: Vec<Checkpoint>,
    results: HashMap<String, Vec<u8>>,
    fail_checkpoint_writes: bool,
    fail_result_writes: bool,
}

/// A store which keeps everything in memory. Clones share their content.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent checkpoint write fail (or succeed again).
    pub fn fail_checkpoint_writes(&self, fail: bool) {
        self.inner.lock().fail_checkpoint_writes = fail;
    }

    /// Makes every subsequent result write fail (or succeed again).
    pub fn fail_result_writes(&self, fail: bool) {
        self.inner.lock().fail_result_writes = fail;
    }

    /// All checkpoints saved so far, oldest first.
    pub fn checkpoints(&self) -> Vec<Checkpoint> {
        self.inner.lock().checkpoints.clone()
    }

    /// All stored results, keyed by handle.
    pub fn results(&self) -> HashMap<String, Vec<u8>> {
        self.inner.lock().results.clone()
    }
}

#[async_trait]
impl CoordinatorStorage for MemoryStore {
    async fn save_checkpoint(&mut self, checkpoint: &Checkpoint) -> StorageResult<()> {
        let mut inner = self.inner.lock();
        if inner.fail_checkpoint_writes {
            return Err(anyhow!("checkpoint writes are disabled"));
        }
        inner.checkpoints.push(checkpoint.clone());
        Ok(())
    }

    async fn load_latest_checkpoint(&mut self) -> StorageResult<Option<Checkpoint>> {
        Ok(self.inner.lock().checkpoints.last().cloned())
    }

    async fn delete_coordinator_data(&mut self) -> StorageResult<()> {
        self.inner.lock().checkpoints.clear();
        Ok(())
    }

    async fn is_ready(&mut self) -> StorageResult<()> {
        Ok(())
    }
}

#[async_trait]
impl ModelStorage for MemoryStore {
    async fn put_result(&mut self, round_id: u64, blob: &[u8]) -> StorageResult<String> {
        let handle = Self::create_result_handle(round_id, blob);
        let mut inner = self.inner.lock();
        if inner.fail_result_writes {
            return Err(anyhow!("result writes are disabled"));
        }
        inner.results.insert(handle.clone(), blob.to_vec());
        Ok(handle)
    }

    async fn get_result(&mut self, handle: &str) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.inner.lock().results.get(handle).cloned())
    }

    async fn is_ready(&mut self) -> StorageResult<()> {
        Ok(())
    }
}

#[async_trait]
impl Storage for MemoryStore {
    async fn is_ready(&mut self) -> StorageResult<()> {
        Ok(())
    }
}
