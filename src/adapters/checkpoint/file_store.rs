//! JSON checkpoint files, one per run.
//!
//! Each save writes a temporary file in the checkpoint directory, syncs it and
//! renames it over the previous checkpoint, so a crash leaves either the old
//! or the new checkpoint and never a torn one.

use async_trait::async_trait;
use std::io::Write;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::Checkpoint;
use crate::domain::ports::CheckpointStore;

#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, run_id: Uuid) -> PathBuf {
        self.dir.join(format!("{run_id}.json"))
    }
}

fn write_atomic(dir: &Path, target: &Path, bytes: &[u8]) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(target).map_err(|e| e.error)?;
    Ok(())
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> DomainResult<()> {
        let bytes = serde_json::to_vec_pretty(checkpoint)?;
        let dir = self.dir.clone();
        let target = self.path_for(checkpoint.run_id);

        tokio::task::spawn_blocking(move || write_atomic(&dir, &target, &bytes))
            .await
            .map_err(|e| DomainError::Checkpoint(format!("checkpoint writer panicked: {e}")))?
            .map_err(|e| {
                DomainError::Checkpoint(format!(
                    "failed to write checkpoint for run {}: {e}",
                    checkpoint.run_id
                ))
            })?;

        tracing::debug!(run_id = %checkpoint.run_id, steps = checkpoint.step_log.len(), "checkpoint saved");
        Ok(())
    }

    async fn load(&self, run_id: Uuid) -> DomainResult<Option<Checkpoint>> {
        let path = self.path_for(run_id);
        match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map(Some).map_err(|e| {
                DomainError::Checkpoint(format!("corrupt checkpoint {}: {e}", path.display()))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(DomainError::Checkpoint(format!(
                "failed to read {}: {e}",
                path.display()
            ))),
        }
    }

    async fn delete(&self, run_id: Uuid) -> DomainResult<()> {
        match tokio::fs::remove_file(self.path_for(run_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(DomainError::Checkpoint(e.to_string())),
        }
    }
}
