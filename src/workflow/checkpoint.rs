//! Checkpoint Manager - capture and restore of run state at superstep boundaries
//!
//! A checkpoint freezes the queue, every executor's saved state and the open
//! fan-in queues. Restoring builds a fresh [`Run`] of the same workflow and
//! pours that state back in, so the restored run continues from exactly the
//! boundary the checkpoint was taken at.
//!
//! Checkpoint ids are `{superstep}-{capture}-{uuid}` with both counters
//! zero-padded, so the store's ascending id order is capture order within a
//! run's timeline.

use std::{
    collections::BTreeMap,
    sync::{Arc, atomic::Ordering}
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{Level, event};
use uuid::Uuid;

use crate::{
    config::RunConfig,
    domain::{constant::checkpoint, error::WorkflowError},
    port::checkpoint::CheckpointStore,
    workflow::{
        binding::DynExecutor,
        fan_in::FanInState,
        graph::Workflow,
        run::{QueuedMessage, Run}
    }
};

pub const CHECKPOINT_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub checkpoint_id:        String,
    pub version:              u32,
    pub workflow_fingerprint: String,
    pub run_id:               String,
    /// Finished supersteps at capture time
    pub superstep:            u64,
    /// Ordinal of this capture within the run's timeline, starting at 1
    pub capture:              u64,
    pub created_at:           DateTime<Utc>,
    pub queue:                Vec<QueuedMessage>,
    pub executor_states:      BTreeMap<String, serde_json::Value>,
    pub fan_in:               FanInState,
    pub event_sequence:       u64,
    pub outputs_yielded:      usize,
    pub halted:               bool
}

impl Checkpoint {
    pub fn to_bytes(&self) -> Result<Vec<u8>, WorkflowError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WorkflowError> {
        let checkpoint: Self = serde_json::from_slice(bytes)?;
        if checkpoint.version != CHECKPOINT_FORMAT_VERSION {
            return Err(WorkflowError::Checkpoint(format!(
                "unsupported checkpoint version {} (expected {})",
                checkpoint.version, CHECKPOINT_FORMAT_VERSION
            )));
        }
        Ok(checkpoint)
    }
}

#[derive(Clone)]
pub struct CheckpointManager {
    store: Arc<dyn CheckpointStore>
}

impl CheckpointManager {
    pub fn new(store: Arc<dyn CheckpointStore>) -> Self {
        Self { store }
    }

    /// Snapshot `run` without changing it
    ///
    /// Fails for a run caught mid-superstep, and as a whole when any executor
    /// cannot save its state.
    pub async fn capture(&self, run: &Run) -> Result<Checkpoint, WorkflowError> {
        if run.in_superstep {
            return Err(WorkflowError::Checkpoint(format!(
                "run '{}' is in the middle of superstep {}",
                run.run_id,
                run.superstep + 1
            )));
        }

        let mut executor_states = BTreeMap::new();
        for (executor_id, instance) in &run.instances {
            let state = instance.lock().await.save_state().map_err(|e| {
                event!(Level::ERROR, event = checkpoint::CAPTURE_FAILED,
                       run_id = %run.run_id, executor_id = %executor_id, error = %e);
                WorkflowError::Checkpoint(format!("executor '{}' could not save its state: {}", executor_id, e))
            })?;
            executor_states.insert(executor_id.clone(), state);
        }

        let capture = run.captures.fetch_add(1, Ordering::AcqRel) + 1;
        let checkpoint = Checkpoint {
            checkpoint_id: format!("{:012}-{:012}-{}", run.superstep, capture, Uuid::new_v4().simple()),
            version: CHECKPOINT_FORMAT_VERSION,
            workflow_fingerprint: run.workflow.fingerprint(),
            run_id: run.run_id.clone(),
            superstep: run.superstep,
            capture,
            created_at: Utc::now(),
            queue: run.queue.iter().cloned().collect(),
            executor_states,
            fan_in: run.fan_in.clone(),
            event_sequence: run.event_sequence,
            outputs_yielded: run.outputs_yielded,
            halted: run.halted
        };

        event!(Level::DEBUG, event = checkpoint::CAPTURED,
               run_id = %checkpoint.run_id, checkpoint_id = %checkpoint.checkpoint_id, superstep = %checkpoint.superstep);
        Ok(checkpoint)
    }

    pub async fn capture_and_store(&self, run: &Run) -> Result<Checkpoint, WorkflowError> {
        let checkpoint = self.capture(run).await?;
        self.store.save(&checkpoint.run_id, &checkpoint.checkpoint_id, checkpoint.to_bytes()?).await?;
        event!(Level::DEBUG, event = checkpoint::STORED,
               run_id = %checkpoint.run_id, checkpoint_id = %checkpoint.checkpoint_id);
        Ok(checkpoint)
    }

    /// Build a run of `workflow` positioned at the checkpoint's superstep boundary
    ///
    /// Stored checkpoints of the same run captured after `checkpoint` belong
    /// to the timeline the restored run replaces and are deleted.
    pub async fn restore(
        &self,
        workflow: Arc<Workflow>,
        checkpoint: &Checkpoint,
        config: RunConfig
    ) -> Result<Run, WorkflowError> {
        if checkpoint.workflow_fingerprint != workflow.fingerprint() {
            return Err(WorkflowError::Checkpoint(format!(
                "checkpoint '{}' was captured from a different workflow shape",
                checkpoint.checkpoint_id
            )));
        }

        let mut run = Run::start(workflow, checkpoint.run_id.clone(), config)?.with_checkpointing(self.clone());
        let restored = match Self::apply(&mut run, checkpoint).await {
            Ok(()) => self.discard_after(&checkpoint.run_id, &checkpoint.checkpoint_id).await,
            Err(error) => Err(error)
        };
        if let Err(error) = restored {
            if let Err(dispose_error) = run.dispose().await {
                event!(Level::WARN, event = checkpoint::DISPOSE_FAILED,
                       run_id = %checkpoint.run_id, checkpoint_id = %checkpoint.checkpoint_id, error = %dispose_error);
            }
            return Err(error);
        }

        event!(Level::DEBUG, event = checkpoint::RESTORED,
               run_id = %checkpoint.run_id, checkpoint_id = %checkpoint.checkpoint_id, superstep = %checkpoint.superstep);
        Ok(run)
    }

    async fn apply(run: &mut Run, checkpoint: &Checkpoint) -> Result<(), WorkflowError> {
        for (executor_id, state) in &checkpoint.executor_states {
            let instance = run.instances.get(executor_id).ok_or_else(|| {
                WorkflowError::Checkpoint(format!("checkpoint holds state for unknown executor '{}'", executor_id))
            })?;
            instance.lock().await.restore_state(state.clone())?;
        }

        run.queue = checkpoint.queue.iter().cloned().collect();
        run.fan_in = checkpoint.fan_in.clone();
        run.superstep = checkpoint.superstep;
        run.event_sequence = checkpoint.event_sequence;
        run.outputs_yielded = checkpoint.outputs_yielded;
        run.halted = checkpoint.halted;
        run.captures.store(checkpoint.capture, Ordering::Release);
        run.settle_status();
        Ok(())
    }

    async fn discard_after(&self, run_id: &str, checkpoint_id: &str) -> Result<usize, WorkflowError> {
        let newer: Vec<String> =
            self.store.list(run_id).await?.into_iter().filter(|id| id.as_str() > checkpoint_id).collect();
        for id in &newer {
            self.store.delete(run_id, id).await?;
        }
        if !newer.is_empty() {
            event!(Level::DEBUG, event = checkpoint::DISCARDED,
                   run_id = %run_id, after = %checkpoint_id, removed = %newer.len());
        }
        Ok(newer.len())
    }

    pub async fn load(&self, run_id: &str, checkpoint_id: &str) -> Result<Option<Checkpoint>, WorkflowError> {
        match self.store.load(run_id, checkpoint_id).await? {
            Some(bytes) => Ok(Some(Checkpoint::from_bytes(&bytes)?)),
            None => Ok(None)
        }
    }

    pub async fn load_latest(&self, run_id: &str) -> Result<Option<Checkpoint>, WorkflowError> {
        match self.store.list(run_id).await?.last() {
            Some(checkpoint_id) => self.load(run_id, checkpoint_id).await,
            None => Ok(None)
        }
    }

    /// Restore the latest stored checkpoint of `run_id`
    pub async fn resume(&self, workflow: Arc<Workflow>, run_id: &str, config: RunConfig) -> Result<Run, WorkflowError> {
        let checkpoint = self
            .load_latest(run_id)
            .await?
            .ok_or_else(|| WorkflowError::Checkpoint(format!("no checkpoint stored for run '{}'", run_id)))?;
        self.restore(workflow, &checkpoint, config).await
    }

    /// Keep only the newest `keep_last` checkpoints of a run; returns how many were removed
    pub async fn prune(&self, run_id: &str, keep_last: usize) -> Result<usize, WorkflowError> {
        let ids = self.store.list(run_id).await?;
        let remove = ids.len().saturating_sub(keep_last);
        for checkpoint_id in &ids[..remove] {
            self.store.delete(run_id, checkpoint_id).await?;
        }
        if remove > 0 {
            event!(Level::DEBUG, event = checkpoint::PRUNED, run_id = %run_id, removed = %remove);
        }
        Ok(remove)
    }

    /// Drop every checkpoint of a run that will not be resumed
    pub async fn release_run(&self, run_id: &str) -> Result<usize, WorkflowError> {
        self.prune(run_id, 0).await
    }
}
