//! A filesystem [`ModelStorage`].
//!
//! Every result is a file named after its handle in the root directory.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use tokio::{fs, io::ErrorKind};
use tracing::debug;

use crate::storage::{ModelStorage, StorageResult};

#[derive(Debug, Clone)]
pub struct FsModelStore {
    root: PathBuf,
}

impl FsModelStore {
    /// Creates a store which writes the results into `root`. The directory is created if it
    /// doesn't exist.
    pub async fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)
            .await
            .with_context(|| format!("failed to create {}", root.display()))?;
        Ok(Self { root })
    }

    fn path_of(&self, handle: &str) -> StorageResult<PathBuf> {
        // handles are created by the store, anything else must not escape the root
        if handle.is_empty() || !handle.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(anyhow!("invalid result handle {:?}", handle));
        }
        Ok(self.root.join(handle))
    }
}

#[async_trait]
impl ModelStorage for FsModelStore {
    async fn put_result(&mut self, round_id: u64, blob: &[u8]) -> StorageResult<String> {
        let handle = Self::create_result_handle(round_id, blob);
        let path = self.path_of(&handle)?;
        if fs::try_exists(&path).await? {
            debug!("result {} is already stored", handle);
            return Ok(handle);
        }

        // write to a temporary file first so that a result is never visible half written
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, blob)
            .await
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("failed to move {}", tmp.display()))?;
        debug!("stored result {}", handle);
        Ok(handle)
    }

    async fn get_result(&mut self, handle: &str) -> StorageResult<Option<Vec<u8>>> {
        let path = self.path_of(handle)?;
        match fs::read(&path).await {
            Ok(blob) => Ok(Some(blob)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("failed to read {}", path.display())),
        }
    }

    async fn is_ready(&mut self) -> StorageResult<()> {
        let metadata = fs::metadata(&self.root).await?;
        if metadata.is_dir() {
            Ok(())
        } else {
            Err(anyhow!("{} is not a directory", self.root.display()))
        }
    }
}
