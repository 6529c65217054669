//! Typed messages for actor communication

use ractor::{ActorRef, Message, RpcReplyPort};

use crate::{
    actor::{host::ActorFactory, subscription::Subscription},
    domain::{
        error::WorkflowError,
        identity::{ActorId, TopicId},
        message::{Envelope, MessageContext}
    }
};

/// Messages for the runtime manager actor (owner of factories, hosts and subscriptions)
pub(crate) enum RuntimeManagerMessage {
    RegisterFactory {
        actor_type: String,
        factory:    ActorFactory,
        reply:      RpcReplyPort<Result<(), WorkflowError>>
    },
    /// Look up the host for `id`, spawning it when `create` is set
    ///
    /// Without `create`, an actor that is not live resolves to `None` as long
    /// as its type has a factory.
    ResolveActor {
        id:     ActorId,
        create: bool,
        reply:  RpcReplyPort<Result<Option<ActorRef<ActorHostMessage>>, WorkflowError>>
    },
    AddSubscription { subscription: Subscription, reply: RpcReplyPort<Result<(), WorkflowError>> },
    RemoveSubscription { id: String, reply: RpcReplyPort<Result<(), WorkflowError>> },
    MatchTopic { topic: TopicId, reply: RpcReplyPort<Result<Vec<ActorId>, WorkflowError>> },
    GetStats { reply: RpcReplyPort<RuntimeStats> }
}

/// Messages for an actor host (one per ActorId)
pub(crate) enum ActorHostMessage {
    /// Dispatch through the actor's router; `reply` is absent for deliveries nobody waits on
    Deliver {
        envelope: Envelope,
        context:  MessageContext,
        reply:    Option<RpcReplyPort<Result<Envelope, WorkflowError>>>
    },
    SaveState { reply: RpcReplyPort<Result<serde_json::Value, WorkflowError>> },
    LoadState { state: serde_json::Value, reply: RpcReplyPort<Result<(), WorkflowError>> }
}

/// Runtime statistics for monitoring
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeStats {
    pub live_actors:    usize,
    pub subscriptions:  usize,
    pub factories:      usize,
    pub actors_spawned: u64
}

impl Message for RuntimeManagerMessage {}
impl Message for ActorHostMessage {}
