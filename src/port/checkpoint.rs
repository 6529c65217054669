use async_trait::async_trait;

use crate::domain::error::WorkflowError;

/// Opaque storage for checkpoint blobs, keyed by run and checkpoint id
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn save(&self, run_id: &str, checkpoint_id: &str, blob: Vec<u8>) -> Result<(), WorkflowError>;

    async fn load(&self, run_id: &str, checkpoint_id: &str) -> Result<Option<Vec<u8>>, WorkflowError>;

    /// Checkpoint ids of a run, oldest first
    async fn list(&self, run_id: &str) -> Result<Vec<String>, WorkflowError>;

    /// Removing an unknown checkpoint is not an error
    async fn delete(&self, run_id: &str, checkpoint_id: &str) -> Result<(), WorkflowError>;
}
