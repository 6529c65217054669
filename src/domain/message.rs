//! Typed messages and their routing metadata
//!
//! Messages travel as [`Envelope`]s: the exact Rust type name of the message
//! plus its serialized payload. The type name is the dispatch key, so routing
//! never falls back to a supertype, and the serialized form is what lets the
//! run engine checkpoint pending messages.

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::domain::{
    error::WorkflowError,
    identity::{ActorId, TopicId}
};

/// Dispatch key of a message type
pub fn type_key<M: 'static>() -> &'static str {
    std::any::type_name::<M>()
}

/// A message tagged with its exact runtime type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub type_name: String,
    pub payload:   serde_json::Value
}

impl Envelope {
    pub fn wrap<M: Serialize + 'static>(message: &M) -> Result<Self, WorkflowError> {
        Ok(Self { type_name: type_key::<M>().to_string(), payload: serde_json::to_value(message)? })
    }

    /// Recover the message, failing unless the envelope holds exactly `M`
    pub fn open<M: DeserializeOwned + 'static>(&self) -> Result<M, WorkflowError> {
        if !self.is::<M>() {
            return Err(WorkflowError::Dispatch(format!(
                "expected message of type {}, found {}",
                type_key::<M>(),
                self.type_name
            )));
        }
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    pub fn is<M: 'static>(&self) -> bool {
        self.type_name == type_key::<M>()
    }

    /// Envelope carrying a unit reply
    pub fn unit() -> Self {
        Self { type_name: type_key::<()>().to_string(), payload: serde_json::Value::Null }
    }
}

/// Routing metadata carried alongside a payload
#[derive(Debug, Clone, Default)]
pub struct MessageContext {
    message_id:       Option<String>,
    pub sender:       Option<ActorId>,
    pub topic:        Option<TopicId>,
    pub is_rpc:       bool,
    pub cancellation: CancellationToken
}

impl MessageContext {
    pub fn rpc(sender: Option<ActorId>) -> Self {
        Self { sender, is_rpc: true, ..Default::default() }
    }

    pub fn broadcast(topic: TopicId, sender: Option<ActorId>) -> Self {
        Self { sender, topic: Some(topic), is_rpc: false, ..Default::default() }
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    pub fn with_cancellation(mut self, cancellation: CancellationToken) -> Self {
        self.cancellation = cancellation;
        self
    }

    /// Message id, generated on first access when none was supplied
    pub fn message_id(&mut self) -> &str {
        self.message_id.get_or_insert_with(|| Uuid::new_v4().to_string())
    }
}

/// Explicit kick-off signal for executors that buffer input until told to act
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnToken {
    /// Whether the receiving executor should surface intermediate events for this turn
    pub emit_events: bool
}

impl TurnToken {
    pub fn new(emit_events: bool) -> Self {
        Self { emit_events }
    }
}

/// One source's contribution to a fan-in round
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FanInInput {
    pub source:  String,
    pub message: Envelope
}

/// Aggregated delivery of a fan-in edge: one message from every source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FanInRound {
    pub round:  u64,
    pub inputs: Vec<FanInInput>
}

impl FanInRound {
    /// Open every input as `M`, in source declaration order
    pub fn values<M: DeserializeOwned + 'static>(&self) -> Result<Vec<M>, WorkflowError> {
        self.inputs.iter().map(|input| input.message.open::<M>()).collect()
    }

    /// Open the input contributed by `source`
    pub fn value_from<M: DeserializeOwned + 'static>(&self, source: &str) -> Result<Option<M>, WorkflowError> {
        self.inputs.iter().find(|input| input.source == source).map(|input| input.message.open::<M>()).transpose()
    }
}
