//! Workflow graphs and their execution
//!
//! Executors are bound into an immutable [`Workflow`] graph, which a [`Run`]
//! drives superstep by superstep. The [`CheckpointManager`] captures and
//! restores runs at superstep boundaries.

pub mod barrier;
pub mod binding;
pub mod checkpoint;
pub mod context;
pub mod fan_in;
pub mod graph;
pub mod router;
pub mod run;

pub use barrier::AsyncBarrier;
pub use binding::ExecutorBinding;
pub use checkpoint::{Checkpoint, CheckpointManager};
pub use context::WorkflowContext;
pub use graph::{Workflow, WorkflowBuilder};
pub use router::{Handler, MessageRouter};
pub use run::{Run, RunStatus, SuperstepOutcome};
