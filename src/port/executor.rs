use async_trait::async_trait;

use crate::{
    domain::error::WorkflowError,
    workflow::{context::WorkflowContext, router::MessageRouter}
};

/// Static metadata an executor declares about what it emits
///
/// Used for graph inspection; sending an undeclared type is not blocked at run time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutorDeclarations {
    pub sends:  Vec<&'static str>,
    pub yields: Vec<&'static str>
}

/// A node of a workflow graph
///
/// An executor instance processes exactly one message at a time. Handlers are
/// registered per exact message type in [`Executor::configure_routes`], which
/// runs once per binding when the graph is built.
#[async_trait]
pub trait Executor: Send + Sized + 'static {
    /// Register one handler per accepted message type
    fn configure_routes(router: &mut MessageRouter<Self, WorkflowContext>) -> Result<(), WorkflowError>;

    fn declarations() -> ExecutorDeclarations {
        ExecutorDeclarations::default()
    }

    /// Snapshot of internal state for checkpointing
    ///
    /// Failing here aborts the whole checkpoint capture.
    fn save_state(&self) -> Result<serde_json::Value, WorkflowError> {
        Ok(serde_json::Value::Null)
    }

    fn restore_state(&mut self, _state: serde_json::Value) -> Result<(), WorkflowError> {
        Ok(())
    }

    /// Return a shared instance to its initial state between runs
    ///
    /// Only called for bindings that declare resetting support.
    async fn reset(&mut self) -> Result<(), WorkflowError> {
        Ok(())
    }
}
