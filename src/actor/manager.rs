//! RuntimeManager Actor - owns factories, live hosts and subscriptions
//!
//! The manager only resolves addresses and spawns hosts; it never waits on
//! a host. Deliveries go straight from the caller to the host, so a handler
//! that calls back into the runtime cannot stall the manager.
//! - Spawns one ActorHost per ActorId, linked for supervision
//! - Keeps the Subscription Registry
//! - Removes hosts that stop or fail

use std::{collections::HashMap, sync::Arc};

use ractor::{Actor, ActorProcessingErr, ActorRef, SupervisionEvent};
use tracing::{Level, event};

use crate::{
    actor::{
        host::{ActorFactory, ActorHost},
        message::{ActorHostMessage, RuntimeManagerMessage, RuntimeStats},
        runtime::ActorRuntime,
        subscription::{Subscription, SubscriptionRegistry}
    },
    config::RuntimeConfig,
    domain::{
        constant::runtime_manager,
        error::WorkflowError,
        identity::{ActorId, TopicId}
    },
    port::storage::ActorStateStorage
};

pub(crate) struct RuntimeManagerState {
    factories:      HashMap<String, ActorFactory>,
    actors:         HashMap<ActorId, ActorRef<ActorHostMessage>>,
    subscriptions:  SubscriptionRegistry,
    storage:        Option<Arc<dyn ActorStateStorage>>,
    /// Handed to every host so handlers can reach other actors
    runtime:        ActorRuntime,
    actors_spawned: u64
}

pub(crate) struct RuntimeManager;

#[async_trait::async_trait]
impl Actor for RuntimeManager {
    type Arguments = (RuntimeConfig, Option<Arc<dyn ActorStateStorage>>);
    type Msg = RuntimeManagerMessage;
    type State = RuntimeManagerState;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        (config, storage): Self::Arguments
    ) -> Result<Self::State, ActorProcessingErr> {
        event!(Level::DEBUG, event = runtime_manager::MANAGER_STARTED, call_timeout_ms = %config.call_timeout_ms);

        Ok(RuntimeManagerState {
            factories: HashMap::new(),
            actors: HashMap::new(),
            subscriptions: SubscriptionRegistry::new(),
            storage,
            runtime: ActorRuntime::from_manager(myself, &config),
            actors_spawned: 0
        })
    }

    async fn post_stop(&self, _myself: ActorRef<Self::Msg>, state: &mut Self::State) -> Result<(), ActorProcessingErr> {
        for host in state.actors.values() {
            host.stop(None);
        }
        event!(Level::DEBUG, event = runtime_manager::MANAGER_STOPPED, live_actors = %state.actors.len());
        state.actors.clear();
        Ok(())
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State
    ) -> Result<(), ActorProcessingErr> {
        match message {
            RuntimeManagerMessage::RegisterFactory { actor_type, factory, reply } => {
                Self::reply(reply, Self::register_factory(actor_type, factory, state));
            }
            RuntimeManagerMessage::ResolveActor { id, create, reply } => {
                let result = self.resolve_actor(&myself, id, create, state).await;
                Self::reply(reply, result);
            }
            RuntimeManagerMessage::AddSubscription { subscription, reply } => {
                Self::reply(reply, Self::add_subscription(subscription, state));
            }
            RuntimeManagerMessage::RemoveSubscription { id, reply } => {
                let result = state.subscriptions.remove(&id).map(|removed| {
                    event!(Level::DEBUG, event = runtime_manager::SUBSCRIPTION_REMOVED,
                           subscription_id = %removed.id());
                });
                Self::reply(reply, result);
            }
            RuntimeManagerMessage::MatchTopic { topic, reply } => {
                Self::reply(reply, Self::match_topic(&topic, state));
            }
            RuntimeManagerMessage::GetStats { reply } => {
                Self::reply(reply, RuntimeStats {
                    live_actors:    state.actors.len(),
                    subscriptions:  state.subscriptions.len(),
                    factories:      state.factories.len(),
                    actors_spawned: state.actors_spawned
                });
            }
        }
        Ok(())
    }

    async fn handle_supervisor_evt(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: SupervisionEvent,
        state: &mut Self::State
    ) -> Result<(), ActorProcessingErr> {
        match message {
            SupervisionEvent::ActorTerminated(cell, _, reason) => {
                Self::forget_host(cell.get_id(), reason.unwrap_or_default(), state);
            }
            SupervisionEvent::ActorFailed(cell, error) => {
                Self::forget_host(cell.get_id(), error.to_string(), state);
            }
            _ => {}
        }
        Ok(())
    }
}

impl RuntimeManager {
    fn reply<T: Send + 'static>(reply: ractor::RpcReplyPort<T>, value: T) {
        if reply.send(value).is_err() {
            event!(Level::WARN, event = runtime_manager::REPLY_FAILED);
        }
    }

    fn register_factory(
        actor_type: String,
        factory: ActorFactory,
        state: &mut RuntimeManagerState
    ) -> Result<(), WorkflowError> {
        if state.factories.contains_key(&actor_type) {
            return Err(WorkflowError::Configuration(format!("a factory for actor type {} is already registered", actor_type)));
        }
        event!(Level::DEBUG, event = runtime_manager::FACTORY_REGISTERED, actor_type = %actor_type);
        state.factories.insert(actor_type, factory);
        Ok(())
    }

    async fn resolve_actor(
        &self,
        myself: &ActorRef<RuntimeManagerMessage>,
        id: ActorId,
        create: bool,
        state: &mut RuntimeManagerState
    ) -> Result<Option<ActorRef<ActorHostMessage>>, WorkflowError> {
        if let Some(host) = state.actors.get(&id) {
            return Ok(Some(host.clone()));
        }

        let factory = state
            .factories
            .get(id.actor_type())
            .cloned()
            .ok_or_else(|| WorkflowError::Configuration(format!("no factory registered for actor type {}", id.actor_type())))?;
        if !create {
            return Ok(None);
        }

        let actor = factory(&id).inspect_err(|e| {
            event!(Level::ERROR, event = runtime_manager::ACTOR_SPAWN_FAILED, actor_id = %id, error = %e);
        })?;

        let (host, _handle) = Actor::spawn_linked(
            None,
            ActorHost,
            (id.clone(), actor, state.runtime.clone(), state.storage.clone()),
            myself.get_cell()
        )
        .await
        .map_err(|e| {
            event!(Level::ERROR, event = runtime_manager::ACTOR_SPAWN_FAILED, actor_id = %id, error = %e);
            WorkflowError::from(e)
        })?;

        state.actors.insert(id.clone(), host.clone());
        state.actors_spawned += 1;
        event!(Level::DEBUG, event = runtime_manager::ACTOR_SPAWNED,
               actor_id = %id, live_actors = %state.actors.len());

        Ok(Some(host))
    }

    fn add_subscription(subscription: Subscription, state: &mut RuntimeManagerState) -> Result<(), WorkflowError> {
        let id = subscription.id().to_string();
        let actor_type = subscription.actor_type().to_string();
        state.subscriptions.add(subscription)?;
        event!(Level::DEBUG, event = runtime_manager::SUBSCRIPTION_ADDED,
               subscription_id = %id, actor_type = %actor_type);
        Ok(())
    }

    fn match_topic(topic: &TopicId, state: &RuntimeManagerState) -> Result<Vec<ActorId>, WorkflowError> {
        state.subscriptions.matching_actors(topic)
    }

    fn forget_host(cell_id: ractor::ActorId, reason: String, state: &mut RuntimeManagerState) {
        let terminated =
            state.actors.iter().find(|(_, host)| host.get_id() == cell_id).map(|(actor_id, _)| actor_id.clone());
        if let Some(actor_id) = terminated {
            state.actors.remove(&actor_id);
            event!(Level::DEBUG, event = runtime_manager::ACTOR_TERMINATED,
                   actor_id = %actor_id, reason = %reason);
        }
    }
}
