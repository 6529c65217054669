use async_trait::async_trait;

use crate::domain::{error::WorkflowError, event::EventRecord};

/// Append-only persistence of a run's event records
///
/// The persistence id is the run id. Records carry their own sequence
/// numbers, assigned by the run engine.
#[async_trait]
pub trait EventJournal: Send + Sync {
    /// Append records for a run
    async fn persist_events(&self, run_id: &str, records: &[EventRecord]) -> Result<(), WorkflowError>;

    /// Records with `sequence >= from_sequence`, in order
    async fn replay_events(&self, run_id: &str, from_sequence: u64) -> Result<Vec<EventRecord>, WorkflowError>;

    /// Sequence number the next record will carry; 0 for an unknown run
    async fn highest_sequence_nr(&self, run_id: &str) -> Result<u64, WorkflowError>;

    /// Drop records with `sequence < to_sequence` (retention)
    async fn delete_events(&self, run_id: &str, to_sequence: u64) -> Result<(), WorkflowError>;
}
