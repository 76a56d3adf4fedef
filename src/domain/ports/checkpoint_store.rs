//! Checkpoint storage port.

use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::errors::DomainResult;
use crate::domain::models::Checkpoint;

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Persist a checkpoint, replacing any previous one for the run.
    /// Must not return until the write is durable.
    async fn save(&self, checkpoint: &Checkpoint) -> DomainResult<()>;

    async fn load(&self, run_id: Uuid) -> DomainResult<Option<Checkpoint>>;

    async fn delete(&self, run_id: Uuid) -> DomainResult<()>;
}
