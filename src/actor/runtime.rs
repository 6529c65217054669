//! ActorRuntime - the caller-facing handle to the actor layer
//!
//! The handle is cheap to clone. It asks the runtime manager for addresses
//! and then talks to hosts directly; request/response deliveries are bounded
//! by the configured call timeout.

use std::{sync::Arc, time::Duration};

use ractor::{
    Actor, ActorRef, RpcReplyPort,
    rpc::{CallResult, call}
};
use serde::{Serialize, de::DeserializeOwned};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Level, event};

use crate::{
    actor::{
        host::{ActorFactory, erase_factory},
        manager::RuntimeManager,
        message::{ActorHostMessage, RuntimeManagerMessage, RuntimeStats},
        subscription::Subscription
    },
    config::RuntimeConfig,
    domain::{
        constant::runtime_manager,
        error::WorkflowError,
        identity::{ActorId, TopicId},
        message::{Envelope, MessageContext}
    },
    port::{actor::HostedActor, storage::ActorStateStorage}
};

/// Per-delivery options for sends and publishes
#[derive(Debug, Clone, Default)]
pub struct MessageOptions {
    pub sender:       Option<ActorId>,
    pub message_id:   Option<String>,
    pub cancellation: CancellationToken
}

impl MessageOptions {
    pub fn with_sender(mut self, sender: ActorId) -> Self {
        self.sender = Some(sender);
        self
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    pub fn with_cancellation(mut self, cancellation: CancellationToken) -> Self {
        self.cancellation = cancellation;
        self
    }

    fn context(&self, base: MessageContext) -> MessageContext {
        let context = base.with_cancellation(self.cancellation.clone());
        match &self.message_id {
            Some(message_id) => context.with_message_id(message_id.clone()),
            None => context
        }
    }
}

#[derive(Clone)]
pub struct ActorRuntime {
    manager:      ActorRef<RuntimeManagerMessage>,
    call_timeout: Duration
}

impl ActorRuntime {
    /// Spawn a runtime without state storage
    pub async fn start(config: RuntimeConfig) -> Result<Self, WorkflowError> {
        Self::start_with_storage(config, None).await
    }

    /// Spawn a runtime whose actors reach `storage` through their context
    pub async fn start_with_storage(
        config: RuntimeConfig,
        storage: Option<Arc<dyn ActorStateStorage>>
    ) -> Result<Self, WorkflowError> {
        let (manager, _handle) = Actor::spawn(None, RuntimeManager, (config.clone(), storage)).await?;
        Ok(Self::from_manager(manager, &config))
    }

    pub(crate) fn from_manager(manager: ActorRef<RuntimeManagerMessage>, config: &RuntimeConfig) -> Self {
        Self { manager, call_timeout: config.call_timeout() }
    }

    /// Make `actor_type` constructible; one factory per type
    pub async fn register_actor_factory<A, F>(&self, actor_type: &str, factory: F) -> Result<(), WorkflowError>
    where
        A: HostedActor,
        F: Fn(&ActorId) -> Result<A, WorkflowError> + Send + Sync + 'static
    {
        ActorId::new(actor_type, "")?;
        let factory: ActorFactory = erase_factory(factory)?;
        self.ask(|reply| RuntimeManagerMessage::RegisterFactory { actor_type: actor_type.to_string(), factory, reply })
            .await?
    }

    /// Point-to-point request/response
    ///
    /// The recipient is created on first use. Exactly one reply comes back; a
    /// handler failure is returned as that reply.
    pub async fn send_message<M, R>(&self, message: &M, recipient: &ActorId, options: MessageOptions) -> Result<R, WorkflowError>
    where
        M: Serialize + 'static,
        R: DeserializeOwned + 'static
    {
        let envelope = Envelope::wrap(message)?;
        let context = options.context(MessageContext::rpc(options.sender.clone()));
        let reply = self.deliver(recipient, envelope, context, &options.cancellation).await?;
        reply.open::<R>()
    }

    /// Fire-and-forget broadcast to every subscribed actor except the sender
    ///
    /// Subscribers run concurrently; one subscriber failing is logged and does
    /// not affect delivery to the others.
    pub async fn publish_message<M>(&self, message: &M, topic: &TopicId, options: MessageOptions) -> Result<(), WorkflowError>
    where
        M: Serialize + 'static
    {
        let envelope = Envelope::wrap(message)?;
        let recipients = self
            .ask(|reply| RuntimeManagerMessage::MatchTopic { topic: topic.clone(), reply })
            .await??
            .into_iter()
            .filter(|recipient| options.sender.as_ref() != Some(recipient))
            .collect::<Vec<_>>();

        event!(Level::DEBUG, event = runtime_manager::MESSAGE_PUBLISHED,
               topic = %topic, message_type = %envelope.type_name, recipients = %recipients.len());

        let mut deliveries = JoinSet::new();
        for recipient in recipients {
            let runtime = self.clone();
            let envelope = envelope.clone();
            let context = options.context(MessageContext::broadcast(topic.clone(), options.sender.clone()));
            let cancellation = options.cancellation.clone();
            deliveries.spawn(async move {
                let result = runtime.deliver(&recipient, envelope, context, &cancellation).await;
                (recipient, result)
            });
        }

        while let Some(joined) = deliveries.join_next().await {
            match joined {
                Ok((_, Ok(_))) => {}
                Ok((recipient, Err(e))) => {
                    event!(Level::WARN, event = runtime_manager::SUBSCRIBER_FAILED,
                           topic = %topic, actor_id = %recipient, error = %e);
                }
                Err(e) => {
                    event!(Level::WARN, event = runtime_manager::SUBSCRIBER_FAILED, topic = %topic, error = %e);
                }
            }
        }
        Ok(())
    }

    /// Resolve `id`; with `lazy` only the factory is checked, otherwise the actor is constructed now
    pub async fn get_actor(&self, id: &ActorId, lazy: bool) -> Result<ActorId, WorkflowError> {
        self.resolve(id, !lazy).await?;
        Ok(id.clone())
    }

    pub async fn add_subscription(&self, subscription: Subscription) -> Result<(), WorkflowError> {
        self.ask(|reply| RuntimeManagerMessage::AddSubscription { subscription, reply }).await?
    }

    pub async fn remove_subscription(&self, id: &str) -> Result<(), WorkflowError> {
        self.ask(|reply| RuntimeManagerMessage::RemoveSubscription { id: id.to_string(), reply }).await?
    }

    pub async fn save_actor_state(&self, id: &ActorId) -> Result<serde_json::Value, WorkflowError> {
        let host = self.host(id).await?;
        Self::call_host(&host, self.call_timeout, |reply| ActorHostMessage::SaveState { reply }).await?
    }

    pub async fn load_actor_state(&self, id: &ActorId, state: serde_json::Value) -> Result<(), WorkflowError> {
        let host = self.host(id).await?;
        Self::call_host(&host, self.call_timeout, |reply| ActorHostMessage::LoadState { state, reply }).await?
    }

    pub async fn stats(&self) -> Result<RuntimeStats, WorkflowError> {
        self.ask(|reply| RuntimeManagerMessage::GetStats { reply }).await
    }

    /// Stop the manager and every host; the handle is unusable afterwards
    pub async fn shutdown(&self) -> Result<(), WorkflowError> {
        self.manager
            .stop_and_wait(None, Some(self.call_timeout))
            .await
            .map_err(|_| WorkflowError::Timeout("runtime shutdown did not complete".to_string()))
    }

    async fn deliver(
        &self,
        recipient: &ActorId,
        envelope: Envelope,
        context: MessageContext,
        cancellation: &CancellationToken
    ) -> Result<Envelope, WorkflowError> {
        if cancellation.is_cancelled() {
            return Err(WorkflowError::Cancelled(format!("delivery to {} was cancelled", recipient)));
        }
        let host = self.host(recipient).await?;

        tokio::select! {
            result = Self::call_host(&host, self.call_timeout, |reply| ActorHostMessage::Deliver {
                envelope,
                context,
                reply: Some(reply)
            }) => result?,
            _ = cancellation.cancelled() => {
                Err(WorkflowError::Cancelled(format!("delivery to {} was cancelled", recipient)))
            }
        }
    }

    async fn host(&self, id: &ActorId) -> Result<ActorRef<ActorHostMessage>, WorkflowError> {
        self.resolve(id, true)
            .await?
            .ok_or_else(|| WorkflowError::Execution(format!("actor {} could not be resolved", id)))
    }

    async fn resolve(&self, id: &ActorId, create: bool) -> Result<Option<ActorRef<ActorHostMessage>>, WorkflowError> {
        self.ask(|reply| RuntimeManagerMessage::ResolveActor { id: id.clone(), create, reply }).await?
    }

    async fn ask<T, F>(&self, build: F) -> Result<T, WorkflowError>
    where
        T: Send + 'static,
        F: FnOnce(RpcReplyPort<T>) -> RuntimeManagerMessage
    {
        match call(&self.manager, build, Some(self.call_timeout)).await {
            Ok(CallResult::Success(value)) => Ok(value),
            Ok(CallResult::Timeout) => Err(WorkflowError::Timeout("runtime manager did not answer in time".to_string())),
            Ok(CallResult::SenderError) => Err(WorkflowError::Execution("runtime manager dropped the request".to_string())),
            Err(_) => Err(WorkflowError::Execution("runtime manager is not running".to_string()))
        }
    }

    async fn call_host<T, F>(host: &ActorRef<ActorHostMessage>, timeout: Duration, build: F) -> Result<T, WorkflowError>
    where
        T: Send + 'static,
        F: FnOnce(RpcReplyPort<T>) -> ActorHostMessage
    {
        match call(host, build, Some(timeout)).await {
            Ok(CallResult::Success(value)) => Ok(value),
            Ok(CallResult::Timeout) => Err(WorkflowError::Timeout(format!("no reply within {:?}", timeout))),
            Ok(CallResult::SenderError) => Err(WorkflowError::Execution("actor host dropped the request".to_string())),
            Err(_) => Err(WorkflowError::Execution("actor host is not running".to_string()))
        }
    }
}
