use std::sync::Arc;

use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};

use crate::{
    actor::runtime::{ActorRuntime, MessageOptions},
    domain::{
        error::WorkflowError,
        identity::{ActorId, TopicId},
        message::MessageContext
    },
    port::storage::ActorStateStorage,
    workflow::router::MessageRouter
};

/// A long-lived, addressable actor hosted by the [`ActorRuntime`]
///
/// The runtime hosts one instance per [`ActorId`] and hands it one message
/// at a time. Handlers are registered per exact message type.
#[async_trait]
pub trait HostedActor: Send + Sized + 'static {
    fn configure_routes(router: &mut MessageRouter<Self, ActorContext>) -> Result<(), WorkflowError>;

    fn save_state(&self) -> Result<serde_json::Value, WorkflowError> {
        Ok(serde_json::Value::Null)
    }

    async fn load_state(&mut self, _state: serde_json::Value) -> Result<(), WorkflowError> {
        Ok(())
    }
}

/// Explicit per-delivery context handed to actor handlers
pub struct ActorContext {
    id:      ActorId,
    message: MessageContext,
    runtime: ActorRuntime,
    storage: Option<Arc<dyn ActorStateStorage>>
}

impl ActorContext {
    pub(crate) fn new(
        id: ActorId,
        message: MessageContext,
        runtime: ActorRuntime,
        storage: Option<Arc<dyn ActorStateStorage>>
    ) -> Self {
        Self { id, message, runtime, storage }
    }

    /// Identity of the actor handling the message
    pub fn id(&self) -> &ActorId {
        &self.id
    }

    pub fn message(&self) -> &MessageContext {
        &self.message
    }

    pub fn message_mut(&mut self) -> &mut MessageContext {
        &mut self.message
    }

    pub fn runtime(&self) -> &ActorRuntime {
        &self.runtime
    }

    pub fn storage(&self) -> Result<&Arc<dyn ActorStateStorage>, WorkflowError> {
        self.storage
            .as_ref()
            .ok_or_else(|| WorkflowError::Configuration("the runtime was started without state storage".to_string()))
    }

    fn outgoing(&self) -> MessageOptions {
        MessageOptions::default().with_sender(self.id.clone()).with_cancellation(self.message.cancellation.clone())
    }

    /// Request/response to another actor, sent as this actor
    pub async fn send_message<M, R>(&self, message: &M, recipient: &ActorId) -> Result<R, WorkflowError>
    where
        M: Serialize + 'static,
        R: DeserializeOwned + 'static
    {
        self.runtime.send_message(message, recipient, self.outgoing()).await
    }

    /// Broadcast as this actor; this actor's own subscription is skipped
    pub async fn publish_message<M: Serialize + 'static>(&self, message: &M, topic: &TopicId) -> Result<(), WorkflowError> {
        self.runtime.publish_message(message, topic, self.outgoing()).await
    }
}
