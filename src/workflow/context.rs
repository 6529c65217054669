//! Per-dispatch run context handed to executor handlers
//!
//! The context is created for one executor's turn in a superstep and is the
//! only channel through which a handler affects the run: outgoing messages,
//! yielded outputs, events and the halt request are collected here and
//! merged by the run engine once the superstep's barrier releases.

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::domain::{error::WorkflowError, event::WorkflowEvent, message::Envelope};

/// A message sent by an executor during its turn
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub envelope: Envelope,
    /// Restricts delivery to one connected executor
    pub target:   Option<String>
}

pub struct WorkflowContext {
    run_id:       String,
    executor_id:  String,
    superstep:    u64,
    cancellation: CancellationToken,
    outbox:       Vec<OutgoingMessage>,
    events:       Vec<WorkflowEvent>,
    outputs:      usize,
    halt:         bool
}

impl WorkflowContext {
    pub(crate) fn new(run_id: &str, executor_id: &str, superstep: u64, cancellation: CancellationToken) -> Self {
        Self {
            run_id: run_id.to_string(),
            executor_id: executor_id.to_string(),
            superstep,
            cancellation,
            outbox: Vec::new(),
            events: Vec::new(),
            outputs: 0,
            halt: false
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn executor_id(&self) -> &str {
        &self.executor_id
    }

    pub fn superstep(&self) -> u64 {
        self.superstep
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Send along every outgoing edge whose target accepts `M`
    pub fn send_message<M: Serialize + 'static>(&mut self, message: &M) -> Result<(), WorkflowError> {
        self.outbox.push(OutgoingMessage { envelope: Envelope::wrap(message)?, target: None });
        Ok(())
    }

    /// Send to one connected executor only
    pub fn send_message_to<M: Serialize + 'static>(
        &mut self,
        target: impl Into<String>,
        message: &M
    ) -> Result<(), WorkflowError> {
        self.outbox.push(OutgoingMessage { envelope: Envelope::wrap(message)?, target: Some(target.into()) });
        Ok(())
    }

    /// Surface `output` as a workflow output
    pub fn yield_output<M: Serialize + 'static>(&mut self, output: &M) -> Result<(), WorkflowError> {
        let output = Envelope::wrap(output)?;
        self.events.push(WorkflowEvent::OutputYielded { executor_id: self.executor_id.clone(), output });
        self.outputs += 1;
        Ok(())
    }

    pub fn add_event(&mut self, event: WorkflowEvent) {
        self.events.push(event);
    }

    /// Report progress data as a conversation update
    pub fn emit_update<T: Serialize>(&mut self, data: &T) -> Result<(), WorkflowError> {
        let data = serde_json::to_value(data)?;
        self.events.push(WorkflowEvent::ConversationUpdate { executor_id: self.executor_id.clone(), data });
        Ok(())
    }

    /// End the run after the current superstep
    pub fn request_halt(&mut self) {
        self.halt = true;
    }

    pub(crate) fn record(&mut self, event: WorkflowEvent) {
        self.events.push(event);
    }

    pub(crate) fn into_parts(self) -> TurnOutput {
        TurnOutput { outbox: self.outbox, events: self.events, outputs: self.outputs, halt: self.halt }
    }
}

/// What one executor produced during its turn
#[derive(Debug, Default)]
pub(crate) struct TurnOutput {
    pub outbox:  Vec<OutgoingMessage>,
    pub events:  Vec<WorkflowEvent>,
    pub outputs: usize,
    pub halt:    bool
}
