//! Executor bindings - how a graph node becomes a live executor
//!
//! A binding is created when the graph is built and is instantiated once per
//! run, unless it wraps a shared instance. Shared instances are reused across
//! runs: a run takes ownership when it starts and hands the instance back on
//! dispose, resetting it when the executor supports that.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU8, Ordering}
    }
};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::{
    domain::{error::WorkflowError, message::Envelope},
    port::executor::{Executor, ExecutorDeclarations},
    workflow::{context::WorkflowContext, router::MessageRouter}
};

/// Type-erased executor as the run engine sees it
#[async_trait]
pub(crate) trait DynExecutor: Send {
    async fn execute(&mut self, envelope: Envelope, context: &mut WorkflowContext) -> Result<(), WorkflowError>;

    fn save_state(&self) -> Result<serde_json::Value, WorkflowError>;

    fn restore_state(&mut self, state: serde_json::Value) -> Result<(), WorkflowError>;

    async fn reset(&mut self) -> Result<(), WorkflowError>;
}

struct HostedExecutor<E: Executor> {
    executor: E,
    router:   Arc<MessageRouter<E, WorkflowContext>>
}

#[async_trait]
impl<E: Executor> DynExecutor for HostedExecutor<E> {
    async fn execute(&mut self, envelope: Envelope, context: &mut WorkflowContext) -> Result<(), WorkflowError> {
        self.router.dispatch(&mut self.executor, envelope, context).await.map(|_| ())
    }

    fn save_state(&self) -> Result<serde_json::Value, WorkflowError> {
        self.executor.save_state()
    }

    fn restore_state(&mut self, state: serde_json::Value) -> Result<(), WorkflowError> {
        self.executor.restore_state(state)
    }

    async fn reset(&mut self) -> Result<(), WorkflowError> {
        self.executor.reset().await
    }
}

/// A live executor; the mutex enforces one message at a time per instance
pub(crate) type ExecutorInstance = Arc<Mutex<Box<dyn DynExecutor>>>;

type ExecutorFactory = Arc<dyn Fn(&str) -> Result<Box<dyn DynExecutor>, WorkflowError> + Send + Sync>;

const SHARED_IDLE: u8 = 0;
const SHARED_OWNED: u8 = 1;
const SHARED_DIRTY: u8 = 2;

pub(crate) struct SharedExecutor {
    instance:  ExecutorInstance,
    ownership: AtomicU8
}

#[derive(Clone)]
enum BindingSource {
    Placeholder,
    Factory(ExecutorFactory),
    Shared(Arc<SharedExecutor>)
}

/// A graph node: an id plus the means to obtain its executor
#[derive(Clone)]
pub struct ExecutorBinding {
    id:                                   String,
    executor_type:                        &'static str,
    source:                               BindingSource,
    accepted_types:                       Arc<Vec<&'static str>>,
    declarations:                         ExecutorDeclarations,
    supports_concurrent_shared_execution: bool,
    supports_resetting:                   bool
}

fn build_router<E: Executor>() -> Result<Arc<MessageRouter<E, WorkflowContext>>, WorkflowError> {
    let mut router = MessageRouter::new();
    E::configure_routes(&mut router)?;
    Ok(Arc::new(router))
}

impl ExecutorBinding {
    /// A binding that creates a fresh executor for every run
    pub fn new<E, F>(id: impl Into<String>, factory: F) -> Result<Self, WorkflowError>
    where
        E: Executor,
        F: Fn(&str) -> Result<E, WorkflowError> + Send + Sync + 'static
    {
        let router = build_router::<E>()?;
        let accepted_types = Arc::new(router.accepted_types());
        let factory: ExecutorFactory = Arc::new(move |run_id: &str| {
            let executor = factory(run_id)?;
            Ok(Box::new(HostedExecutor { executor, router: router.clone() }) as Box<dyn DynExecutor>)
        });

        Ok(Self {
            id: id.into(),
            executor_type: std::any::type_name::<E>(),
            source: BindingSource::Factory(factory),
            accepted_types,
            declarations: E::declarations(),
            supports_concurrent_shared_execution: false,
            supports_resetting: false
        })
    }

    /// A binding around one instance reused by every run of the workflow
    pub fn shared<E: Executor>(id: impl Into<String>, executor: E) -> Result<Self, WorkflowError> {
        let router = build_router::<E>()?;
        let accepted_types = Arc::new(router.accepted_types());
        let instance: ExecutorInstance = Arc::new(Mutex::new(Box::new(HostedExecutor { executor, router })));

        Ok(Self {
            id: id.into(),
            executor_type: std::any::type_name::<E>(),
            source: BindingSource::Shared(Arc::new(SharedExecutor { instance, ownership: AtomicU8::new(SHARED_IDLE) })),
            accepted_types,
            declarations: E::declarations(),
            supports_concurrent_shared_execution: false,
            supports_resetting: false
        })
    }

    /// A node id whose executor is bound later with `WorkflowBuilder::bind`
    pub fn placeholder(id: impl Into<String>) -> Self {
        Self {
            id:                                   id.into(),
            executor_type:                        "placeholder",
            source:                               BindingSource::Placeholder,
            accepted_types:                       Arc::new(Vec::new()),
            declarations:                         ExecutorDeclarations::default(),
            supports_concurrent_shared_execution: false,
            supports_resetting:                   false
        }
    }

    /// Allow several runs to use this shared instance at the same time
    pub fn with_concurrent_shared_execution(mut self) -> Self {
        self.supports_concurrent_shared_execution = true;
        self
    }

    /// Declare that the shared instance can be reset between runs
    pub fn with_resetting(mut self) -> Self {
        self.supports_resetting = true;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn executor_type(&self) -> &'static str {
        self.executor_type
    }

    pub fn declarations(&self) -> &ExecutorDeclarations {
        &self.declarations
    }

    pub fn is_placeholder(&self) -> bool {
        matches!(self.source, BindingSource::Placeholder)
    }

    pub fn is_shared_instance(&self) -> bool {
        matches!(self.source, BindingSource::Shared(_))
    }

    pub fn supports_concurrent_shared_execution(&self) -> bool {
        self.supports_concurrent_shared_execution
    }

    pub fn supports_resetting(&self) -> bool {
        self.supports_resetting
    }

    pub fn accepts(&self, type_name: &str) -> bool {
        self.accepted_types.iter().any(|accepted| *accepted == type_name)
    }

    pub fn accepted_types(&self) -> &[&'static str] {
        &self.accepted_types
    }

    /// Obtain the executor a run will drive
    pub(crate) fn instantiate(&self, run_id: &str) -> Result<ExecutorInstance, WorkflowError> {
        match &self.source {
            BindingSource::Placeholder => Err(WorkflowError::Configuration(format!(
                "executor '{}' is an unresolved placeholder",
                self.id
            ))),
            BindingSource::Factory(factory) => Ok(Arc::new(Mutex::new(factory(run_id)?))),
            BindingSource::Shared(shared) => Ok(shared.instance.clone())
        }
    }

    /// Take the shared instance for a run; fails fast when another run holds it
    pub(crate) fn acquire(&self) -> Result<(), WorkflowError> {
        let BindingSource::Shared(shared) = &self.source else {
            return Ok(());
        };
        if self.supports_concurrent_shared_execution {
            return Ok(());
        }

        match shared.ownership.compare_exchange(SHARED_IDLE, SHARED_OWNED, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => Ok(()),
            Err(SHARED_OWNED) => Err(WorkflowError::Concurrency(format!(
                "shared executor '{}' is in use by another run and does not support concurrent execution",
                self.id
            ))),
            Err(_) => Err(WorkflowError::Concurrency(format!(
                "shared executor '{}' was used by a previous run and does not support resetting",
                self.id
            )))
        }
    }

    /// Undo an `acquire` for a run that never started
    pub(crate) fn relinquish(&self) {
        if let BindingSource::Shared(shared) = &self.source {
            if !self.supports_concurrent_shared_execution {
                let _ = shared.ownership.compare_exchange(SHARED_OWNED, SHARED_IDLE, Ordering::AcqRel, Ordering::Acquire);
            }
        }
    }

    /// Give up a shared instance without resetting it; an explicit `reset` makes it usable again
    pub(crate) fn detach(&self) {
        if let BindingSource::Shared(shared) = &self.source {
            if !self.supports_concurrent_shared_execution {
                shared.ownership.store(SHARED_DIRTY, Ordering::Release);
            }
        }
    }

    /// Hand the shared instance back after a run, resetting it when supported
    pub(crate) async fn release(&self) -> Result<(), WorkflowError> {
        let BindingSource::Shared(shared) = &self.source else {
            return Ok(());
        };
        if self.supports_concurrent_shared_execution {
            return Ok(());
        }

        if self.supports_resetting {
            let result = shared.instance.lock().await.reset().await;
            // A failed reset leaves the instance unusable for later runs
            let next = if result.is_ok() { SHARED_IDLE } else { SHARED_DIRTY };
            shared.ownership.store(next, Ordering::Release);
            result
        } else {
            shared.ownership.store(SHARED_DIRTY, Ordering::Release);
            Ok(())
        }
    }

    /// Explicitly reset a shared, resettable instance that no run currently owns
    pub async fn reset(&self) -> Result<(), WorkflowError> {
        let BindingSource::Shared(shared) = &self.source else {
            return Err(WorkflowError::Concurrency(format!(
                "executor '{}' is not a shared instance and cannot be reset",
                self.id
            )));
        };
        if !self.supports_resetting {
            return Err(WorkflowError::Concurrency(format!("shared executor '{}' does not support resetting", self.id)));
        }
        if shared.ownership.load(Ordering::Acquire) == SHARED_OWNED {
            return Err(WorkflowError::Concurrency(format!(
                "shared executor '{}' is in use and cannot be reset",
                self.id
            )));
        }

        shared.instance.lock().await.reset().await?;
        shared.ownership.store(SHARED_IDLE, Ordering::Release);
        Ok(())
    }
}

impl PartialEq for ExecutorBinding {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ExecutorBinding {}

impl fmt::Debug for ExecutorBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutorBinding")
            .field("id", &self.id)
            .field("executor_type", &self.executor_type)
            .field("is_shared_instance", &self.is_shared_instance())
            .field("supports_concurrent_shared_execution", &self.supports_concurrent_shared_execution)
            .field("supports_resetting", &self.supports_resetting)
            .finish()
    }
}
