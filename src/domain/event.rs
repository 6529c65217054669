//! Events observable during a workflow run

use std::fmt::{self, Display};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::message::Envelope;

/// Events emitted by the run engine and by executors
///
/// Events are append-only within a run. Apart from the record timestamp
/// they carry no wall-clock data, so a restored run replays to the same
/// sequence of events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkflowEvent {
    SuperstepStarted { superstep: u64, pending_messages: usize },
    SuperstepCompleted { superstep: u64, produced_messages: usize },
    InvocationStarted { executor_id: String, message_type: String },
    InvocationCompleted { executor_id: String, message_type: String },
    /// Free-form progress an executor reports, e.g. a streamed conversation update
    ConversationUpdate { executor_id: String, data: serde_json::Value },
    OutputYielded { executor_id: String, output: Envelope },
    RunHalted { executor_id: String },
    Error { executor_id: Option<String>, message: String }
}

impl WorkflowEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            WorkflowEvent::SuperstepStarted { .. } => "superstep-started",
            WorkflowEvent::SuperstepCompleted { .. } => "superstep-completed",
            WorkflowEvent::InvocationStarted { .. } => "invocation-started",
            WorkflowEvent::InvocationCompleted { .. } => "invocation-completed",
            WorkflowEvent::ConversationUpdate { .. } => "conversation-update",
            WorkflowEvent::OutputYielded { .. } => "output-yielded",
            WorkflowEvent::RunHalted { .. } => "run-halted",
            WorkflowEvent::Error { .. } => "error"
        }
    }
}

impl Display for WorkflowEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.event_type())
    }
}

/// An event as recorded in a run's log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Position in the run, starting at 0
    pub sequence:  u64,
    pub superstep: u64,
    pub timestamp: DateTime<Utc>,
    pub event:     WorkflowEvent
}
