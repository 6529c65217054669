use thiserror::Error;

/// Common error types for the workflow engine and actor runtime
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WorkflowError {
    /// Structural problems detected while building graphs, routers or runtimes
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Malformed identifiers and values
    #[error("validation error: {0}")]
    Validation(String),

    /// No handler registered for a message's exact type
    #[error("dispatch error: {0}")]
    Dispatch(String),

    /// Shared executor misuse (reset or concurrent use that the instance does not support)
    #[error("concurrency error: {0}")]
    Concurrency(String),

    /// Optimistic-concurrency tag mismatch on an actor state write
    #[error("version conflict: {0}")]
    VersionConflict(String),

    /// The operation observed its cancellation signal
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// Checkpoint capture or restore failure
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// Handler or run execution failures
    #[error("execution error: {0}")]
    Execution(String),

    /// Persistence backend errors
    #[error("storage error: {0}")]
    Storage(String),

    /// Serialization/deserialization errors
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Spawn errors
    #[error("spawn error: {0}")]
    Spawn(String),

    /// Timeout errors
    #[error("timeout: {0}")]
    Timeout(String),

    /// Generic errors with context
    #[error("{0}")]
    Generic(String)
}

impl WorkflowError {
    /// Cancellation is reported separately from failure and must not be retried automatically
    pub fn is_cancelled(&self) -> bool {
        matches!(self, WorkflowError::Cancelled(_))
    }

    /// Only version conflicts are retryable, after the caller re-reads state
    pub fn is_retryable(&self) -> bool {
        matches!(self, WorkflowError::VersionConflict(_))
    }
}

/// Convert from anyhow::Error
impl From<anyhow::Error> for WorkflowError {
    fn from(err: anyhow::Error) -> Self {
        WorkflowError::Generic(err.to_string())
    }
}

/// Convert from std::io::Error
impl From<std::io::Error> for WorkflowError {
    fn from(err: std::io::Error) -> Self {
        WorkflowError::Storage(err.to_string())
    }
}

/// Convert from serde_yaml::Error
impl From<serde_yaml::Error> for WorkflowError {
    fn from(err: serde_yaml::Error) -> Self {
        WorkflowError::Serialization(err.to_string())
    }
}

/// Convert from serde_json::Error
impl From<serde_json::Error> for WorkflowError {
    fn from(err: serde_json::Error) -> Self {
        WorkflowError::Serialization(err.to_string())
    }
}

/// Convert from rocksdb::Error
impl From<rocksdb::Error> for WorkflowError {
    fn from(err: rocksdb::Error) -> Self {
        WorkflowError::Storage(err.to_string())
    }
}

/// Convert from ractor::SpawnErr
impl From<ractor::SpawnErr> for WorkflowError {
    fn from(err: ractor::SpawnErr) -> Self {
        WorkflowError::Spawn(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_version_conflicts_are_retryable() {
        assert!(WorkflowError::VersionConflict("stale".into()).is_retryable());
        assert!(!WorkflowError::Concurrency("busy".into()).is_retryable());
        assert!(!WorkflowError::Cancelled("stop".into()).is_retryable());
    }

    #[test]
    fn test_cancellation_is_distinguished() {
        assert!(WorkflowError::Cancelled("run".into()).is_cancelled());
        assert!(!WorkflowError::Execution("boom".into()).is_cancelled());
    }
}
