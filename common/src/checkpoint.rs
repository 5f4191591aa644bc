//! Checkpoint persistence for incremental and resumable ingestion. The
//! file-backed store is best-effort on write but must survive process
//! restart, so every put is flushed to disk via a temp-file rename.

use std::{collections::HashMap, path::PathBuf};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::warn;

use crate::{error::RagError, types::Checkpoint};

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn get(&self, tool_id: &str) -> Result<Option<Checkpoint>, RagError>;

    async fn put(&self, tool_id: &str, checkpoint: Checkpoint) -> Result<(), RagError>;

    /// Force pending state to durable storage where applicable.
    async fn flush(&self) -> Result<(), RagError> {
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryCheckpointStore {
    inner: RwLock<HashMap<String, Checkpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn get(&self, tool_id: &str) -> Result<Option<Checkpoint>, RagError> {
        Ok(self.inner.read().await.get(tool_id).cloned())
    }

    async fn put(&self, tool_id: &str, checkpoint: Checkpoint) -> Result<(), RagError> {
        self.inner
            .write()
            .await
            .insert(tool_id.to_owned(), checkpoint);
        Ok(())
    }
}

pub struct FileCheckpointStore {
    path: PathBuf,
    inner: RwLock<HashMap<String, Checkpoint>>,
}

impl FileCheckpointStore {
    /// Loads any previously persisted checkpoints from `path`.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, RagError> {
        let path = path.into();
        let inner = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(err) => return Err(err.into()),
        };
        Ok(Self {
            path,
            inner: RwLock::new(inner),
        })
    }

    async fn persist(&self) -> Result<(), RagError> {
        let snapshot = {
            let inner = self.inner.read().await;
            serde_json::to_vec_pretty(&*inner)?
        };
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, snapshot).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn get(&self, tool_id: &str) -> Result<Option<Checkpoint>, RagError> {
        Ok(self.inner.read().await.get(tool_id).cloned())
    }

    async fn put(&self, tool_id: &str, checkpoint: Checkpoint) -> Result<(), RagError> {
        self.inner
            .write()
            .await
            .insert(tool_id.to_owned(), checkpoint);
        // Persistence is best-effort; a failed write must not fail the sync
        // that produced the checkpoint.
        if let Err(err) = self.persist().await {
            warn!(tool_id, error = %err, "failed to persist checkpoint");
        }
        Ok(())
    }

    async fn flush(&self) -> Result<(), RagError> {
        self.persist().await
    }
}
