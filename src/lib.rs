//! # Workflow Engine
//!
//! A workflow execution engine and actor runtime.
//!
//! This crate provides:
//! - Typed, reflection-free message routing for executors and actors
//! - Workflow graphs with direct, conditional, fan-out and fan-in edges
//! - A superstep run engine with checkpoint capture and restore
//! - Topic-addressed actors backed by optimistic-concurrency state storage

pub mod actor;
pub mod adapter;
pub mod config;
pub mod domain;
pub mod port;
pub mod workflow;

pub use actor::{ActorRuntime, MessageOptions, Subscription, TopicMatcher};
pub use config::{EngineConfig, init_tracing};
pub use domain::{
    error::WorkflowError,
    identity::{ActorId, TopicId},
    message::{Envelope, FanInRound, MessageContext, TurnToken}
};
pub use workflow::{CheckpointManager, ExecutorBinding, Run, RunStatus, Workflow, WorkflowBuilder};
