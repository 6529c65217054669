//! Engine configuration
//!
//! Every field has a default, so an empty YAML document (or no file at all)
//! yields a usable configuration.

use std::{fs, path::Path, path::PathBuf, time::Duration};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::{adapter::StoreType, domain::error::WorkflowError};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub log_level: LogLevel,
    pub run:       RunConfig,
    pub runtime:   RuntimeConfig,
    pub storage:   StorageConfig
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogLevel(pub String);

impl Default for LogLevel {
    fn default() -> Self {
        Self("info".to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// A run needing more supersteps than this fails
    pub max_supersteps:        u64,
    /// Capture a checkpoint every N supersteps when checkpointing is attached; 0 disables it
    pub checkpoint_interval:   u64,
    /// How long a cancelled run waits for the in-flight superstep
    pub cancellation_grace_ms: u64
}

impl Default for RunConfig {
    fn default() -> Self {
        Self { max_supersteps: 100, checkpoint_interval: 1, cancellation_grace_ms: 5000 }
    }
}

impl RunConfig {
    pub fn cancellation_grace(&self) -> Duration {
        Duration::from_millis(self.cancellation_grace_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Bound on one request/response delivery
    pub call_timeout_ms: u64
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self { call_timeout_ms: 30_000 }
    }
}

impl RuntimeConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend:        StoreType,
    /// RocksDB directory; the platform data directory when unset
    pub path:           Option<PathBuf>,
    pub list_page_size: usize
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { backend: StoreType::InMemory, path: None, list_page_size: 100 }
    }
}

impl StorageConfig {
    pub fn database_path(&self) -> Result<PathBuf, WorkflowError> {
        if let Some(path) = &self.path {
            return Ok(path.clone());
        }
        let project_dirs = ProjectDirs::from("org", "wf-engine", "wf-engine")
            .ok_or_else(|| WorkflowError::Configuration("cannot determine the platform data directory".to_string()))?;
        Ok(project_dirs.data_dir().join("rocksdb"))
    }
}

impl EngineConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, WorkflowError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|e| WorkflowError::Configuration(format!("failed to read {}: {}", path.display(), e)))?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self, WorkflowError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), WorkflowError> {
        if self.run.max_supersteps == 0 {
            return Err(WorkflowError::Configuration("run.max_supersteps must be at least 1".to_string()));
        }
        if self.storage.list_page_size == 0 {
            return Err(WorkflowError::Configuration("storage.list_page_size must be at least 1".to_string()));
        }
        Ok(())
    }
}

/// Install the global fmt subscriber; `RUST_LOG` wins over `default_filter`
///
/// Safe to call more than once: later calls leave the first subscriber in place.
pub fn init_tracing(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let _ = tracing_subscriber::registry().with(filter).with(fmt::layer().with_target(false)).try_init();
}
