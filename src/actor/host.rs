//! ActorHost Actor - one per ActorId
//!
//! The host owns the actor instance and serialises every delivery for that
//! identity through its mailbox. Handler failures are replied to the caller;
//! the host itself keeps running.

use std::sync::Arc;

use async_trait::async_trait;
use ractor::{Actor, ActorProcessingErr, ActorRef};
use tracing::{Level, event};

use crate::{
    actor::{message::ActorHostMessage, runtime::ActorRuntime},
    domain::{
        constant::actor_host,
        error::WorkflowError,
        identity::ActorId,
        message::{Envelope, MessageContext}
    },
    port::{
        actor::{ActorContext, HostedActor},
        storage::ActorStateStorage
    },
    workflow::router::MessageRouter
};

/// Type-erased actor as its host sees it
#[async_trait]
pub(crate) trait DynActor: Send {
    async fn handle(&mut self, envelope: Envelope, context: &mut ActorContext) -> Result<Envelope, WorkflowError>;

    fn save_state(&self) -> Result<serde_json::Value, WorkflowError>;

    async fn load_state(&mut self, state: serde_json::Value) -> Result<(), WorkflowError>;
}

struct RoutedActor<A: HostedActor> {
    actor:  A,
    router: Arc<MessageRouter<A, ActorContext>>
}

#[async_trait]
impl<A: HostedActor> DynActor for RoutedActor<A> {
    async fn handle(&mut self, envelope: Envelope, context: &mut ActorContext) -> Result<Envelope, WorkflowError> {
        self.router.dispatch(&mut self.actor, envelope, context).await
    }

    fn save_state(&self) -> Result<serde_json::Value, WorkflowError> {
        self.actor.save_state()
    }

    async fn load_state(&mut self, state: serde_json::Value) -> Result<(), WorkflowError> {
        self.actor.load_state(state).await
    }
}

/// Builds the actor for one identity
pub(crate) type ActorFactory = Arc<dyn Fn(&ActorId) -> Result<Box<dyn DynActor>, WorkflowError> + Send + Sync>;

/// Erase a typed factory; the router is built once, here
pub(crate) fn erase_factory<A, F>(factory: F) -> Result<ActorFactory, WorkflowError>
where
    A: HostedActor,
    F: Fn(&ActorId) -> Result<A, WorkflowError> + Send + Sync + 'static
{
    let mut router = MessageRouter::new();
    A::configure_routes(&mut router)?;
    let router = Arc::new(router);

    Ok(Arc::new(move |id: &ActorId| {
        let actor = factory(id)?;
        Ok(Box::new(RoutedActor { actor, router: router.clone() }) as Box<dyn DynActor>)
    }))
}

pub(crate) struct ActorHostState {
    id:      ActorId,
    actor:   Box<dyn DynActor>,
    runtime: ActorRuntime,
    storage: Option<Arc<dyn ActorStateStorage>>
}

pub(crate) struct ActorHost;

#[async_trait::async_trait]
impl Actor for ActorHost {
    type Arguments = (ActorId, Box<dyn DynActor>, ActorRuntime, Option<Arc<dyn ActorStateStorage>>);
    type Msg = ActorHostMessage;
    type State = ActorHostState;

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        (id, actor, runtime, storage): Self::Arguments
    ) -> Result<Self::State, ActorProcessingErr> {
        event!(Level::DEBUG, event = actor_host::HOST_STARTED, actor_id = %id);
        Ok(ActorHostState { id, actor, runtime, storage })
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State
    ) -> Result<(), ActorProcessingErr> {
        match message {
            ActorHostMessage::Deliver { envelope, context, reply } => {
                let result = Self::deliver(state, envelope, context).await;
                if let Some(reply) = reply {
                    if reply.send(result).is_err() {
                        event!(Level::WARN, event = actor_host::REPLY_FAILED, actor_id = %state.id);
                    }
                }
            }
            ActorHostMessage::SaveState { reply } => {
                if reply.send(state.actor.save_state()).is_err() {
                    event!(Level::WARN, event = actor_host::REPLY_FAILED, actor_id = %state.id);
                }
            }
            ActorHostMessage::LoadState { state: saved, reply } => {
                let result = state.actor.load_state(saved).await;
                if reply.send(result).is_err() {
                    event!(Level::WARN, event = actor_host::REPLY_FAILED, actor_id = %state.id);
                }
            }
        }
        Ok(())
    }
}

impl ActorHost {
    async fn deliver(
        state: &mut ActorHostState,
        envelope: Envelope,
        context: MessageContext
    ) -> Result<Envelope, WorkflowError> {
        let message_type = envelope.type_name.clone();
        event!(Level::DEBUG, event = actor_host::MESSAGE_RECEIVED,
               actor_id = %state.id, message_type = %message_type, rpc = %context.is_rpc);

        let cancellation = context.cancellation.clone();
        if cancellation.is_cancelled() {
            return Err(WorkflowError::Cancelled(format!("delivery to {} was cancelled", state.id)));
        }

        let mut actor_context = ActorContext::new(state.id.clone(), context, state.runtime.clone(), state.storage.clone());
        let result = tokio::select! {
            result = state.actor.handle(envelope, &mut actor_context) => result,
            _ = cancellation.cancelled() => {
                Err(WorkflowError::Cancelled(format!("delivery to {} was cancelled", state.id)))
            }
        };

        match &result {
            Ok(_) => {
                event!(Level::DEBUG, event = actor_host::MESSAGE_HANDLED,
                       actor_id = %state.id, message_type = %message_type);
            }
            Err(e) => {
                event!(Level::DEBUG, event = actor_host::MESSAGE_FAILED,
                       actor_id = %state.id, message_type = %message_type, error = %e);
            }
        }
        result
    }
}
