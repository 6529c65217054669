//! Event journal implementations
//!
//! Runs persist their event records per superstep through [`EventJournal`];
//! the in-memory journal keeps them per run id for inspection and tests.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::{
    domain::{error::WorkflowError, event::EventRecord},
    port::journal::EventJournal
};

/// HashMap-backed journal, records stored by run id
#[derive(Debug, Default)]
pub struct InMemoryJournal {
    records: Arc<RwLock<HashMap<String, Vec<EventRecord>>>>
}

impl InMemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventJournal for InMemoryJournal {
    async fn persist_events(&self, run_id: &str, records: &[EventRecord]) -> Result<(), WorkflowError> {
        if records.is_empty() {
            return Ok(());
        }

        let mut store = self.records.write().await;
        let run_records = store.entry(run_id.to_string()).or_default();
        // A run resumed from a checkpoint rewrites everything journaled after it
        if let Some(first) = records.first() {
            run_records.retain(|record| record.sequence < first.sequence);
        }
        run_records.extend_from_slice(records);

        Ok(())
    }

    async fn replay_events(&self, run_id: &str, from_sequence: u64) -> Result<Vec<EventRecord>, WorkflowError> {
        let store = self.records.read().await;
        Ok(store
            .get(run_id)
            .map(|records| records.iter().filter(|record| record.sequence >= from_sequence).cloned().collect())
            .unwrap_or_default())
    }

    async fn highest_sequence_nr(&self, run_id: &str) -> Result<u64, WorkflowError> {
        let store = self.records.read().await;
        Ok(store.get(run_id).and_then(|records| records.last()).map_or(0, |record| record.sequence + 1))
    }

    async fn delete_events(&self, run_id: &str, to_sequence: u64) -> Result<(), WorkflowError> {
        let mut store = self.records.write().await;
        if let Some(records) = store.get_mut(run_id) {
            records.retain(|record| record.sequence >= to_sequence);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::domain::event::WorkflowEvent;

    fn record(sequence: u64) -> EventRecord {
        EventRecord {
            sequence,
            superstep: 1,
            timestamp: Utc::now(),
            event: WorkflowEvent::SuperstepStarted { superstep: 1, pending_messages: 1 }
        }
    }

    #[tokio::test]
    async fn test_inmemory_journal() {
        let journal = InMemoryJournal::new();
        let run_id = "test-run";

        assert!(journal.replay_events(run_id, 0).await.unwrap().is_empty());
        assert_eq!(journal.highest_sequence_nr(run_id).await.unwrap(), 0);

        journal.persist_events(run_id, &[record(0), record(1), record(2)]).await.unwrap();
        assert_eq!(journal.replay_events(run_id, 1).await.unwrap().len(), 2);
        assert_eq!(journal.highest_sequence_nr(run_id).await.unwrap(), 3);

        journal.delete_events(run_id, 2).await.unwrap();
        let remaining = journal.replay_events(run_id, 0).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].sequence, 2);
    }

    #[tokio::test]
    async fn test_resumed_run_replaces_later_records() {
        let journal = InMemoryJournal::new();
        journal.persist_events("run", &[record(0), record(1), record(2)]).await.unwrap();

        journal.persist_events("run", &[record(1)]).await.unwrap();
        let sequences =
            journal.replay_events("run", 0).await.unwrap().iter().map(|record| record.sequence).collect::<Vec<_>>();
        assert_eq!(sequences, vec![0, 1]);
    }
}
