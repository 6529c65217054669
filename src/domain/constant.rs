//! Domain Events - Structured event names for internal monitoring and debugging

/// Run Engine Events
pub mod run_engine {
    pub const RUN_STARTED: &str = "run.started";
    pub const RUN_RESTORED: &str = "run.restored";
    pub const RUN_FINISHED: &str = "run.finished";
    pub const RUN_CANCELLED: &str = "run.cancelled";
    pub const RUN_DISPOSED: &str = "run.disposed";
    pub const SUPERSTEP_STARTED: &str = "superstep.started";
    pub const SUPERSTEP_COMPLETED: &str = "superstep.completed";
    pub const SUPERSTEP_ABANDONED: &str = "superstep.abandoned";
    pub const EXECUTOR_FAILED: &str = "executor.failed";
    pub const FAN_IN_RELEASED: &str = "fan_in.released";
    pub const MESSAGE_UNROUTED: &str = "message.unrouted";
    pub const JOURNAL_FAILED: &str = "journal.failed";
}

/// Checkpoint Manager Events
pub mod checkpoint {
    pub const CAPTURED: &str = "checkpoint.captured";
    pub const CAPTURE_FAILED: &str = "checkpoint.capture_failed";
    pub const STORED: &str = "checkpoint.stored";
    pub const RESTORED: &str = "checkpoint.restored";
    pub const PRUNED: &str = "checkpoint.pruned";
    pub const DISCARDED: &str = "checkpoint.discarded";
    pub const DISPOSE_FAILED: &str = "checkpoint.dispose_failed";
}

/// Runtime Manager Actor Events
pub mod runtime_manager {
    pub const MANAGER_STARTED: &str = "manager.started";
    pub const MANAGER_STOPPED: &str = "manager.stopped";
    pub const FACTORY_REGISTERED: &str = "factory.registered";
    pub const ACTOR_SPAWNED: &str = "actor.spawned";
    pub const ACTOR_SPAWN_FAILED: &str = "actor.spawn_failed";
    pub const ACTOR_TERMINATED: &str = "actor.terminated";
    pub const SUBSCRIPTION_ADDED: &str = "subscription.added";
    pub const SUBSCRIPTION_REMOVED: &str = "subscription.removed";
    pub const MESSAGE_PUBLISHED: &str = "message.published";
    pub const SUBSCRIBER_FAILED: &str = "subscriber.failed";
    pub const REPLY_FAILED: &str = "reply.failed";
}

/// Actor Host Events
pub mod actor_host {
    pub const HOST_STARTED: &str = "host.started";
    pub const MESSAGE_RECEIVED: &str = "message.received";
    pub const MESSAGE_HANDLED: &str = "message.handled";
    pub const MESSAGE_FAILED: &str = "message.failed";
    pub const REPLY_FAILED: &str = "reply.failed";
}

/// Actor State Storage Events
pub mod state_storage {
    pub const STATE_WRITTEN: &str = "state.written";
    pub const STATE_CONFLICT: &str = "state.conflict";
    pub const STATE_READ: &str = "state.read";
}
