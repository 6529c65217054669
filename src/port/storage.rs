use async_trait::async_trait;

use crate::domain::{
    error::WorkflowError,
    identity::ActorId,
    state::{ReadResponse, StateReadOperation, StateWriteOperation, WriteResponse}
};

/// Key/value persistence per actor with optimistic concurrency
///
/// The version tag covers the whole actor, not individual keys. A write
/// whose `expected_version_tag` does not match is rejected as a whole and
/// reported through `WriteResponse::success`, carrying the current tag.
#[async_trait]
pub trait ActorStateStorage: Send + Sync {
    /// Apply every operation atomically, or none of them
    async fn write_state(
        &self,
        actor_id: &ActorId,
        operations: &[StateWriteOperation],
        expected_version_tag: &str
    ) -> Result<WriteResponse, WorkflowError>;

    /// Never changes the version tag; a missing key reads as `None`
    async fn read_state(&self, actor_id: &ActorId, operations: &[StateReadOperation]) -> Result<ReadResponse, WorkflowError>;
}
