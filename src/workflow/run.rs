//! Run Engine - drives one execution of a workflow in supersteps
//!
//! Each superstep takes every queued message, groups the messages by target
//! executor (in order of first appearance), runs one task per executor and
//! waits on an [`AsyncBarrier`] until every task has finished. Only then are
//! the produced messages routed into the queue for the next superstep, so
//! the queue is touched by the engine alone and a run is always observable
//! at a clean boundary between supersteps.

use std::{
    collections::{BTreeMap, VecDeque},
    sync::{Arc, atomic::AtomicU64}
};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Level, event};

use crate::{
    config::RunConfig,
    domain::{
        constant::run_engine,
        error::WorkflowError,
        event::{EventRecord, WorkflowEvent},
        message::{Envelope, TurnToken}
    },
    port::journal::EventJournal,
    workflow::{
        barrier::AsyncBarrier,
        binding::{DynExecutor, ExecutorInstance},
        checkpoint::CheckpointManager,
        context::{OutgoingMessage, TurnOutput, WorkflowContext},
        fan_in::FanInState,
        graph::{EdgeKind, Workflow}
    }
};

/// A message waiting for the next superstep
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub target:   String,
    pub envelope: Envelope,
    /// Producing executor; `None` for external input
    pub source:   Option<String>
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Nothing queued and nothing yielded yet
    Idle,
    Running,
    /// Queue drained after at least one output
    Completed,
    Halted,
    Failed,
    Cancelled
}

impl RunStatus {
    /// Terminal runs accept no further input
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Halted | RunStatus::Failed | RunStatus::Cancelled)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuperstepOutcome {
    pub superstep: u64,
    pub processed: usize,
    pub produced:  usize,
    pub outputs:   usize,
    pub halted:    bool,
    /// The superstep was cancelled and did not finish within the grace period
    pub abandoned: bool
}

struct TurnResult {
    index:       usize,
    executor_id: String,
    output:      TurnOutput,
    error:       Option<WorkflowError>
}

struct PendingTurnToken {
    edge_index: usize,
    target:     String,
    source:     String,
    token:      TurnToken
}

/// Signals the superstep barrier however the executor task ends
struct SignalOnDrop(Arc<AsyncBarrier>);

impl Drop for SignalOnDrop {
    fn drop(&mut self) {
        self.0.signal();
    }
}

pub struct Run {
    pub(crate) workflow:        Arc<Workflow>,
    pub(crate) run_id:          String,
    pub(crate) config:          RunConfig,
    pub(crate) instances:       BTreeMap<String, ExecutorInstance>,
    pub(crate) queue:           VecDeque<QueuedMessage>,
    pub(crate) fan_in:          FanInState,
    /// Number of finished supersteps
    pub(crate) superstep:       u64,
    pub(crate) event_sequence:  u64,
    pub(crate) outputs_yielded: usize,
    pub(crate) halted:          bool,
    pub(crate) in_superstep:    bool,
    /// Checkpoints captured so far in this run's timeline
    pub(crate) captures:        AtomicU64,
    events:                     Vec<EventRecord>,
    status:                     RunStatus,
    journal:                    Option<Arc<dyn EventJournal>>,
    checkpoints:                Option<CheckpointManager>,
    disposed:                   bool
}

impl Run {
    /// Instantiate every executor of `workflow` for a new run
    ///
    /// Shared instances are taken for the lifetime of the run; if one is
    /// unavailable, nothing is taken and the start fails.
    pub fn start(workflow: Arc<Workflow>, run_id: impl Into<String>, config: RunConfig) -> Result<Self, WorkflowError> {
        let run_id = run_id.into();
        let mut acquired = Vec::new();
        let mut instances = BTreeMap::new();

        let instantiated = (|| -> Result<(), WorkflowError> {
            for binding in workflow.executors() {
                binding.acquire()?;
                acquired.push(binding);
                instances.insert(binding.id().to_string(), binding.instantiate(&run_id)?);
            }
            Ok(())
        })();
        if let Err(error) = instantiated {
            for binding in acquired {
                binding.relinquish();
            }
            return Err(error);
        }

        let mut fan_in = FanInState::default();
        for edge in workflow.edges() {
            if let EdgeKind::FanIn { sources, .. } = &edge.kind {
                fan_in.register(edge.index, sources);
            }
        }

        event!(Level::DEBUG, event = run_engine::RUN_STARTED, run_id = %run_id, workflow = %workflow.name());

        Ok(Self {
            workflow,
            run_id,
            config,
            instances,
            queue: VecDeque::new(),
            fan_in,
            superstep: 0,
            event_sequence: 0,
            outputs_yielded: 0,
            halted: false,
            in_superstep: false,
            captures: AtomicU64::new(0),
            events: Vec::new(),
            status: RunStatus::Idle,
            journal: None,
            checkpoints: None,
            disposed: false
        })
    }

    /// Persist each superstep's event records
    pub fn with_journal(mut self, journal: Arc<dyn EventJournal>) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Capture a checkpoint every `checkpoint_interval` supersteps
    pub fn with_checkpointing(mut self, manager: CheckpointManager) -> Self {
        self.checkpoints = Some(manager);
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn workflow(&self) -> &Arc<Workflow> {
        &self.workflow
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    /// Number of finished supersteps
    pub fn superstep(&self) -> u64 {
        self.superstep
    }

    pub fn pending_messages(&self) -> impl Iterator<Item = &QueuedMessage> {
        self.queue.iter()
    }

    /// Events recorded by this run object; a restored run starts empty
    pub fn events(&self) -> &[EventRecord] {
        &self.events
    }

    /// Outputs yielded so far, in emission order
    pub fn outputs(&self) -> Vec<&Envelope> {
        self.events
            .iter()
            .filter_map(|record| match &record.event {
                WorkflowEvent::OutputYielded { output, .. } => Some(output),
                _ => None
            })
            .collect()
    }

    pub fn outputs_yielded(&self) -> usize {
        self.outputs_yielded
    }

    pub fn fan_in_state(&self) -> &FanInState {
        &self.fan_in
    }

    /// Queue `message` for the start executor
    pub fn send_input<M: Serialize + 'static>(&mut self, message: &M) -> Result<(), WorkflowError> {
        self.ensure_accepting_input()?;
        self.enqueue_input(Envelope::wrap(message)?)
    }

    /// Queue a turn token for the start executor
    pub fn send_turn_token(&mut self, emit_events: bool) -> Result<(), WorkflowError> {
        self.ensure_accepting_input()?;
        self.enqueue_input(Envelope::wrap(&TurnToken::new(emit_events))?)
    }

    fn ensure_accepting_input(&self) -> Result<(), WorkflowError> {
        if self.disposed || self.status.is_terminal() {
            return Err(WorkflowError::Execution(format!(
                "run '{}' is {:?} and accepts no more input",
                self.run_id, self.status
            )));
        }
        Ok(())
    }

    fn enqueue_input(&mut self, envelope: Envelope) -> Result<(), WorkflowError> {
        let start = self.workflow.start_executor();
        let accepted = self.workflow.executor(start).is_some_and(|binding| binding.accepts(&envelope.type_name));
        if !accepted {
            return Err(WorkflowError::Dispatch(format!(
                "start executor '{}' does not handle {}",
                start, envelope.type_name
            )));
        }
        self.queue.push_back(QueuedMessage { target: start.to_string(), envelope, source: None });
        Ok(())
    }

    fn record(&mut self, superstep: u64, event: WorkflowEvent) {
        self.events.push(EventRecord { sequence: self.event_sequence, superstep, timestamp: Utc::now(), event });
        self.event_sequence += 1;
    }

    /// Status implied by the run's state at a superstep boundary
    pub(crate) fn settle_status(&mut self) {
        self.status = if self.halted {
            RunStatus::Halted
        } else if !self.queue.is_empty() {
            RunStatus::Running
        } else if self.outputs_yielded > 0 {
            RunStatus::Completed
        } else {
            RunStatus::Idle
        };
    }

    /// Execute one superstep
    pub async fn run_superstep(&mut self) -> Result<SuperstepOutcome, WorkflowError> {
        self.execute_superstep(&CancellationToken::new()).await
    }

    /// Run supersteps until the queue drains, an executor halts, or `cancellation` fires
    ///
    /// Cancellation is observed at superstep boundaries. A superstep already in
    /// flight gets the configured grace period to finish before it is abandoned.
    pub async fn run_to_completion(&mut self, cancellation: &CancellationToken) -> Result<RunStatus, WorkflowError> {
        if self.status.is_terminal() {
            return Ok(self.status);
        }

        loop {
            if cancellation.is_cancelled() {
                self.status = RunStatus::Cancelled;
                event!(Level::DEBUG, event = run_engine::RUN_CANCELLED, run_id = %self.run_id, superstep = %self.superstep);
                return Ok(self.status);
            }
            if self.halted || self.queue.is_empty() {
                break;
            }

            let outcome = self.execute_superstep(cancellation).await?;
            if outcome.abandoned {
                return Ok(self.status);
            }
        }

        self.settle_status();
        event!(Level::DEBUG, event = run_engine::RUN_FINISHED,
               run_id = %self.run_id, status = ?self.status, supersteps = %self.superstep);
        Ok(self.status)
    }

    async fn execute_superstep(&mut self, cancellation: &CancellationToken) -> Result<SuperstepOutcome, WorkflowError> {
        if self.disposed || self.status.is_terminal() {
            return Err(WorkflowError::Execution(format!("run '{}' is {:?}", self.run_id, self.status)));
        }
        if self.queue.is_empty() {
            return Ok(SuperstepOutcome {
                superstep: self.superstep,
                processed: 0,
                produced:  0,
                outputs:   0,
                halted:    self.halted,
                abandoned: false
            });
        }

        let current = self.superstep + 1;
        if current > self.config.max_supersteps {
            let error = WorkflowError::Execution(format!(
                "run '{}' exceeded the limit of {} supersteps",
                self.run_id, self.config.max_supersteps
            ));
            self.record(self.superstep, WorkflowEvent::Error { executor_id: None, message: error.to_string() });
            self.status = RunStatus::Failed;
            return Err(error);
        }

        if let Some(missing) = self.queue.iter().find(|message| !self.instances.contains_key(&message.target)) {
            return Err(WorkflowError::Execution(format!("no executor instance for '{}'", missing.target)));
        }

        let first_record = self.events.len();
        let processed = self.queue.len();
        self.in_superstep = true;
        self.status = RunStatus::Running;
        self.record(current, WorkflowEvent::SuperstepStarted { superstep: current, pending_messages: processed });
        event!(Level::DEBUG, event = run_engine::SUPERSTEP_STARTED,
               run_id = %self.run_id, superstep = %current, pending = %processed);

        let mut groups: Vec<(String, Vec<Envelope>)> = Vec::new();
        for message in std::mem::take(&mut self.queue) {
            match groups.iter_mut().find(|(target, _)| *target == message.target) {
                Some((_, batch)) => batch.push(message.envelope),
                None => groups.push((message.target, vec![message.envelope]))
            }
        }

        let barrier = Arc::new(AsyncBarrier::new(groups.len()));
        let mut tasks = JoinSet::new();
        for (index, (executor_id, messages)) in groups.into_iter().enumerate() {
            let Some(instance) = self.instances.get(&executor_id).cloned() else {
                barrier.signal();
                continue;
            };
            let run_id = self.run_id.clone();
            let token = cancellation.child_token();
            let signal = SignalOnDrop(barrier.clone());

            tasks.spawn(async move {
                let _signal = signal;
                let mut executor = instance.lock().await;
                let mut output = TurnOutput::default();
                let mut error = None;

                for envelope in messages {
                    let message_type = envelope.type_name.clone();
                    let mut context = WorkflowContext::new(&run_id, &executor_id, current, token.clone());
                    context.record(WorkflowEvent::InvocationStarted {
                        executor_id:  executor_id.clone(),
                        message_type: message_type.clone()
                    });

                    let result = executor.execute(envelope, &mut context).await;
                    if result.is_ok() {
                        context.record(WorkflowEvent::InvocationCompleted { executor_id: executor_id.clone(), message_type });
                    }

                    let turn = context.into_parts();
                    output.outbox.extend(turn.outbox);
                    output.events.extend(turn.events);
                    output.outputs += turn.outputs;
                    output.halt |= turn.halt;

                    if let Err(e) = result {
                        error = Some(e);
                        break;
                    }
                }

                TurnResult { index, executor_id, output, error }
            });
        }

        if barrier.join(cancellation).await.is_err() {
            let settled = tokio::time::timeout(self.config.cancellation_grace(), barrier.join(&CancellationToken::new())).await;
            if !matches!(settled, Ok(Ok(()))) {
                tasks.shutdown().await;
                // The drained messages are gone: the run stays marked mid-superstep so it cannot be captured
                self.status = RunStatus::Cancelled;
                event!(Level::WARN, event = run_engine::SUPERSTEP_ABANDONED, run_id = %self.run_id, superstep = %current);
                return Ok(SuperstepOutcome {
                    superstep: current,
                    processed,
                    produced: 0,
                    outputs: 0,
                    halted: false,
                    abandoned: true
                });
            }
        }

        let mut failure = None;
        let mut results = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => {
                    let error = WorkflowError::Execution(format!("executor task failed: {}", e));
                    self.record(current, WorkflowEvent::Error { executor_id: None, message: error.to_string() });
                    failure.get_or_insert(error);
                }
            }
        }
        results.sort_by_key(|result| result.index);

        let mut produced = VecDeque::new();
        let mut turn_tokens = Vec::new();
        let mut halted_by = Vec::new();
        let mut outputs = 0;

        for result in results {
            for event in result.output.events {
                self.record(current, event);
            }
            outputs += result.output.outputs;

            for outgoing in result.output.outbox {
                if let Err(error) = self.route(&result.executor_id, outgoing, &mut produced, &mut turn_tokens) {
                    self.record(current, WorkflowEvent::Error {
                        executor_id: Some(result.executor_id.clone()),
                        message:     error.to_string()
                    });
                    failure.get_or_insert(error);
                }
            }

            if let Some(error) = result.error {
                event!(Level::ERROR, event = run_engine::EXECUTOR_FAILED,
                       run_id = %self.run_id, executor_id = %result.executor_id, error = %error);
                self.record(current, WorkflowEvent::Error {
                    executor_id: Some(result.executor_id.clone()),
                    message:     error.to_string()
                });
                failure.get_or_insert(error);
            }

            if result.output.halt {
                halted_by.push(result.executor_id);
            }
        }

        for pending in turn_tokens {
            match Envelope::wrap(&pending.token) {
                Ok(envelope) => produced.push_back(QueuedMessage {
                    target: pending.target,
                    envelope,
                    source: Some(pending.source)
                }),
                Err(error) => {
                    failure.get_or_insert(error);
                }
            }
        }

        for executor_id in &halted_by {
            self.record(current, WorkflowEvent::RunHalted { executor_id: executor_id.clone() });
        }

        let produced_count = produced.len();
        self.queue = produced;
        self.halted |= !halted_by.is_empty();
        self.outputs_yielded += outputs;
        self.record(current, WorkflowEvent::SuperstepCompleted { superstep: current, produced_messages: produced_count });
        self.superstep = current;
        self.in_superstep = false;

        event!(Level::DEBUG, event = run_engine::SUPERSTEP_COMPLETED,
               run_id = %self.run_id, superstep = %current, produced = %produced_count, outputs = %outputs);

        if let Some(journal) = &self.journal {
            if let Err(error) = journal.persist_events(&self.run_id, &self.events[first_record..]).await {
                event!(Level::ERROR, event = run_engine::JOURNAL_FAILED, run_id = %self.run_id, error = %error);
                failure.get_or_insert(error);
            }
        }

        if let Some(error) = failure {
            self.status = RunStatus::Failed;
            return Err(error);
        }
        self.settle_status();

        if let Some(manager) = self.checkpoints.clone() {
            let interval = self.config.checkpoint_interval;
            if interval > 0 && current % interval == 0 {
                manager.capture_and_store(self).await?;
            }
        }

        Ok(SuperstepOutcome {
            superstep: current,
            processed,
            produced: produced_count,
            outputs,
            halted: self.halted,
            abandoned: false
        })
    }

    /// Deliver one sent message along the outgoing edges of `source`
    fn route(
        &mut self,
        source: &str,
        outgoing: OutgoingMessage,
        produced: &mut VecDeque<QueuedMessage>,
        turn_tokens: &mut Vec<PendingTurnToken>
    ) -> Result<(), WorkflowError> {
        let workflow = self.workflow.clone();
        let OutgoingMessage { envelope, target: restrict } = outgoing;
        let allowed = |target: &str| restrict.as_deref().is_none_or(|only| only == target);
        let accepts =
            |target: &str| workflow.executor(target).is_some_and(|binding| binding.accepts(&envelope.type_name));

        let mut reachable = false;
        let mut delivered = 0;

        for edge in workflow.outgoing(source) {
            let mut deliveries: Vec<(String, Envelope)> = Vec::new();

            match &edge.kind {
                EdgeKind::Direct { target, .. } => {
                    if allowed(target) && accepts(target) {
                        reachable = true;
                        deliveries.push((target.clone(), envelope.clone()));
                    }
                }
                EdgeKind::Conditional { target, condition, .. } => {
                    if allowed(target) && accepts(target) {
                        reachable = true;
                        if condition(&envelope) {
                            deliveries.push((target.clone(), envelope.clone()));
                        }
                    }
                }
                EdgeKind::FanOut { targets, assigner, .. } => {
                    reachable |= targets.iter().any(|target| allowed(target) && accepts(target));
                    let picks = match assigner {
                        Some(assigner) => assigner(&envelope, targets.len()),
                        None => (0..targets.len()).collect()
                    };
                    for pick in picks {
                        let Some(target) = targets.get(pick) else {
                            continue;
                        };
                        if allowed(target) && accepts(target) && !deliveries.iter().any(|(t, _)| t == target) {
                            deliveries.push((target.clone(), envelope.clone()));
                        }
                    }
                }
                EdgeKind::FanIn { target, .. } => {
                    if allowed(target) {
                        reachable = true;
                        for round in self.fan_in.accept(edge.index, source, envelope.clone()) {
                            event!(Level::DEBUG, event = run_engine::FAN_IN_RELEASED,
                                   run_id = %self.run_id, target = %target, round = %round.round);
                            deliveries.push((target.clone(), Envelope::wrap(&round)?));
                        }
                    }
                }
            }

            for (target, delivery) in deliveries {
                if let Some(token) = edge.turn_token {
                    let scheduled = turn_tokens
                        .iter()
                        .any(|pending| pending.edge_index == edge.index && pending.target == target);
                    if !scheduled {
                        turn_tokens.push(PendingTurnToken {
                            edge_index: edge.index,
                            target: target.clone(),
                            source: source.to_string(),
                            token
                        });
                    }
                }
                produced.push_back(QueuedMessage { target, envelope: delivery, source: Some(source.to_string()) });
                delivered += 1;
            }
        }

        if !reachable {
            return Err(WorkflowError::Dispatch(match restrict {
                Some(target) => {
                    format!("'{}' has no edge to '{}' that accepts {}", source, target, envelope.type_name)
                }
                None => format!("no outgoing edge of '{}' accepts {}", source, envelope.type_name)
            }));
        }
        if delivered == 0 {
            event!(Level::DEBUG, event = run_engine::MESSAGE_UNROUTED,
                   run_id = %self.run_id, source = %source, message_type = %envelope.type_name);
        }
        Ok(())
    }

    /// Release shared executor instances; the run cannot be driven afterwards
    pub async fn dispose(&mut self) -> Result<(), WorkflowError> {
        if self.disposed {
            return Ok(());
        }
        self.disposed = true;
        self.instances.clear();

        let mut first_error = None;
        for binding in self.workflow.executors() {
            if let Err(error) = binding.release().await {
                event!(Level::WARN, event = run_engine::RUN_DISPOSED,
                       run_id = %self.run_id, executor_id = %binding.id(), error = %error);
                first_error.get_or_insert(error);
            }
        }

        event!(Level::DEBUG, event = run_engine::RUN_DISPOSED, run_id = %self.run_id);
        first_error.map_or(Ok(()), Err)
    }
}

impl Drop for Run {
    fn drop(&mut self) {
        if !self.disposed {
            for binding in self.workflow.executors() {
                binding.detach();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration
    };

    use async_trait::async_trait;

    use super::*;
    use crate::{
        adapter::journal::InMemoryJournal,
        domain::message::FanInRound,
        port::executor::Executor,
        workflow::{
            binding::ExecutorBinding,
            graph::WorkflowBuilder,
            router::{Handler, MessageRouter}
        }
    };

    /// Forwards a transformed copy of every string
    struct Transform {
        apply: fn(&str) -> String
    }

    #[async_trait]
    impl Handler<String, WorkflowContext> for Transform {
        type Reply = ();

        async fn handle(&mut self, message: String, context: &mut WorkflowContext) -> Result<(), WorkflowError> {
            context.send_message(&(self.apply)(&message))
        }
    }

    #[async_trait]
    impl Executor for Transform {
        fn configure_routes(router: &mut MessageRouter<Self, WorkflowContext>) -> Result<(), WorkflowError> {
            router.register::<String>()?;
            Ok(())
        }
    }

    /// Yields the joined values of each fan-in round
    struct Join {
        rounds: Arc<AtomicUsize>
    }

    #[async_trait]
    impl Handler<FanInRound, WorkflowContext> for Join {
        type Reply = ();

        async fn handle(&mut self, round: FanInRound, context: &mut WorkflowContext) -> Result<(), WorkflowError> {
            self.rounds.fetch_add(1, Ordering::SeqCst);
            context.yield_output(&round.values::<String>()?.join("+"))
        }
    }

    #[async_trait]
    impl Executor for Join {
        fn configure_routes(router: &mut MessageRouter<Self, WorkflowContext>) -> Result<(), WorkflowError> {
            router.register::<FanInRound>()?;
            Ok(())
        }
    }

    /// Yields every string it receives
    struct Sink;

    #[async_trait]
    impl Handler<String, WorkflowContext> for Sink {
        type Reply = ();

        async fn handle(&mut self, message: String, context: &mut WorkflowContext) -> Result<(), WorkflowError> {
            if message == "fail" {
                return Err(WorkflowError::Execution("sink rejected input".to_string()));
            }
            if message == "stop" {
                context.request_halt();
            }
            context.yield_output(&message)
        }
    }

    #[async_trait]
    impl Executor for Sink {
        fn configure_routes(router: &mut MessageRouter<Self, WorkflowContext>) -> Result<(), WorkflowError> {
            router.register::<String>()?;
            Ok(())
        }
    }

    /// Buffers strings until a turn token arrives
    #[derive(Default)]
    struct Buffer {
        pending: Vec<String>
    }

    #[async_trait]
    impl Handler<String, WorkflowContext> for Buffer {
        type Reply = ();

        async fn handle(&mut self, message: String, _context: &mut WorkflowContext) -> Result<(), WorkflowError> {
            self.pending.push(message);
            Ok(())
        }
    }

    #[async_trait]
    impl Handler<TurnToken, WorkflowContext> for Buffer {
        type Reply = ();

        async fn handle(&mut self, token: TurnToken, context: &mut WorkflowContext) -> Result<(), WorkflowError> {
            if token.emit_events {
                context.emit_update(&self.pending.len())?;
            }
            let joined = self.pending.join(",");
            self.pending.clear();
            context.yield_output(&joined)
        }
    }

    #[async_trait]
    impl Executor for Buffer {
        fn configure_routes(router: &mut MessageRouter<Self, WorkflowContext>) -> Result<(), WorkflowError> {
            router.register::<String>()?.register::<TurnToken>()?;
            Ok(())
        }
    }

    /// Sends each input twice
    struct Doubler;

    #[async_trait]
    impl Handler<String, WorkflowContext> for Doubler {
        type Reply = ();

        async fn handle(&mut self, message: String, context: &mut WorkflowContext) -> Result<(), WorkflowError> {
            context.send_message(&format!("{}1", message))?;
            context.send_message(&format!("{}2", message))
        }
    }

    #[async_trait]
    impl Executor for Doubler {
        fn configure_routes(router: &mut MessageRouter<Self, WorkflowContext>) -> Result<(), WorkflowError> {
            router.register::<String>()?;
            Ok(())
        }
    }

    /// Ignores cancellation and sleeps
    struct Sleeper;

    #[async_trait]
    impl Handler<String, WorkflowContext> for Sleeper {
        type Reply = ();

        async fn handle(&mut self, _message: String, _context: &mut WorkflowContext) -> Result<(), WorkflowError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        }
    }

    #[async_trait]
    impl Executor for Sleeper {
        fn configure_routes(router: &mut MessageRouter<Self, WorkflowContext>) -> Result<(), WorkflowError> {
            router.register::<String>()?;
            Ok(())
        }
    }

    fn transform(id: &str, apply: fn(&str) -> String) -> ExecutorBinding {
        ExecutorBinding::new(id, move |_| Ok(Transform { apply })).unwrap()
    }

    fn diamond(rounds: Arc<AtomicUsize>) -> Arc<Workflow> {
        let mut builder = WorkflowBuilder::new("diamond", transform("a", |s| s.to_string()));
        builder
            .add_executor(transform("b", |s| s.to_uppercase()))
            .add_executor(transform("c", |s| s.repeat(2)))
            .add_executor(ExecutorBinding::new("d", move |_| Ok(Join { rounds: rounds.clone() })).unwrap())
            .add_fan_out_edge("a", &["b", "c"])
            .add_fan_in_edge(&["b", "c"], "d");
        Arc::new(builder.build().unwrap())
    }

    fn invocations(run: &Run, executor: &str) -> usize {
        run.events()
            .iter()
            .filter(|record| {
                matches!(&record.event, WorkflowEvent::InvocationStarted { executor_id, .. } if executor_id == executor)
            })
            .count()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_fan_out_then_fan_in_fires_once_with_both_values() {
        let rounds = Arc::new(AtomicUsize::new(0));
        let mut run = Run::start(diamond(rounds.clone()), "run-1", RunConfig::default()).unwrap();
        run.send_input(&"x".to_string()).unwrap();

        let status = run.run_to_completion(&CancellationToken::new()).await.unwrap();

        assert_eq!(status, RunStatus::Completed);
        assert_eq!(rounds.load(Ordering::SeqCst), 1);
        assert_eq!(run.superstep(), 3);
        assert_eq!(run.outputs().len(), 1);
        assert_eq!(run.outputs()[0].open::<String>().unwrap(), "X+xx");
        assert_eq!(invocations(&run, "b"), 1);
        assert_eq!(invocations(&run, "c"), 1);
    }

    #[tokio::test]
    async fn test_fan_in_waits_for_every_source() {
        let rounds = Arc::new(AtomicUsize::new(0));
        let mut builder = WorkflowBuilder::new("partial", transform("a", |s| s.to_string()));
        let counter = rounds.clone();
        builder
            .add_executor(transform("b", |s| s.to_uppercase()))
            .add_executor(transform("c", |s| s.repeat(2)))
            .add_executor(ExecutorBinding::new("d", move |_| Ok(Join { rounds: counter.clone() })).unwrap())
            .add_fan_out_edge_with("a", &["b", "c"], |_, _| vec![0])
            .add_fan_in_edge(&["b", "c"], "d");
        let mut run = Run::start(Arc::new(builder.build().unwrap()), "run-1", RunConfig::default()).unwrap();

        run.send_input(&"x".to_string()).unwrap();
        let status = run.run_to_completion(&CancellationToken::new()).await.unwrap();

        assert_eq!(status, RunStatus::Idle);
        assert_eq!(rounds.load(Ordering::SeqCst), 0);
        assert_eq!(invocations(&run, "c"), 0);
        assert_eq!(run.fan_in_state().edge(1).unwrap().pending_count("b"), 1);
    }

    #[tokio::test]
    async fn test_sources_running_ahead_are_held_for_later_rounds() {
        let rounds = Arc::new(AtomicUsize::new(0));
        let counter = rounds.clone();
        let mut builder = WorkflowBuilder::new("ahead", transform("a", |s| s.to_string()));
        builder
            .add_executor(ExecutorBinding::new("b", |_| Ok(Doubler)).unwrap())
            .add_executor(transform("c", |s| s.to_uppercase()))
            .add_executor(ExecutorBinding::new("d", move |_| Ok(Join { rounds: counter.clone() })).unwrap())
            .add_fan_out_edge("a", &["b", "c"])
            .add_fan_in_edge(&["b", "c"], "d");
        let mut run = Run::start(Arc::new(builder.build().unwrap()), "run-1", RunConfig::default()).unwrap();

        run.send_input(&"x".to_string()).unwrap();
        run.run_to_completion(&CancellationToken::new()).await.unwrap();
        assert_eq!(rounds.load(Ordering::SeqCst), 1);
        assert_eq!(run.outputs()[0].open::<String>().unwrap(), "x1+X");

        run.send_input(&"y".to_string()).unwrap();
        run.run_to_completion(&CancellationToken::new()).await.unwrap();
        assert_eq!(rounds.load(Ordering::SeqCst), 2);
        assert_eq!(run.outputs()[1].open::<String>().unwrap(), "x2+Y");
    }

    #[tokio::test]
    async fn test_unaccepted_input_is_a_dispatch_error() {
        let mut run = Run::start(diamond(Arc::new(AtomicUsize::new(0))), "run-1", RunConfig::default()).unwrap();
        assert!(matches!(run.send_input(&42u32), Err(WorkflowError::Dispatch(_))));
        assert!(matches!(run.send_turn_token(true), Err(WorkflowError::Dispatch(_))));
        assert_eq!(run.pending_messages().count(), 0);
    }

    #[tokio::test]
    async fn test_handler_error_fails_the_run() {
        let mut builder = WorkflowBuilder::new("failing", transform("a", |s| s.to_string()));
        builder.add_executor(ExecutorBinding::new("sink", |_| Ok(Sink)).unwrap()).add_edge("a", "sink");
        let mut run = Run::start(Arc::new(builder.build().unwrap()), "run-1", RunConfig::default()).unwrap();

        run.send_input(&"fail".to_string()).unwrap();
        let result = run.run_to_completion(&CancellationToken::new()).await;

        assert!(matches!(result, Err(WorkflowError::Execution(_))));
        assert_eq!(run.status(), RunStatus::Failed);
        assert!(run.events().iter().any(|record| matches!(
            &record.event,
            WorkflowEvent::Error { executor_id: Some(id), .. } if id == "sink"
        )));
        assert!(run.send_input(&"again".to_string()).is_err());
    }

    #[tokio::test]
    async fn test_halt_stops_the_run() {
        let mut builder = WorkflowBuilder::new("halting", ExecutorBinding::new("sink", |_| Ok(Sink)).unwrap());
        builder.add_executor(ExecutorBinding::new("never", |_| Ok(Sink)).unwrap());
        let mut run = Run::start(Arc::new(builder.build().unwrap()), "run-1", RunConfig::default()).unwrap();

        run.send_input(&"stop".to_string()).unwrap();
        let status = run.run_to_completion(&CancellationToken::new()).await.unwrap();

        assert_eq!(status, RunStatus::Halted);
        assert!(run.events().iter().any(|record| matches!(record.event, WorkflowEvent::RunHalted { .. })));
    }

    #[tokio::test]
    async fn test_message_without_accepting_edge_is_a_dispatch_error() {
        let workflow = WorkflowBuilder::new("dead-end", transform("a", |s| s.to_string())).build().unwrap();
        let mut run = Run::start(Arc::new(workflow), "run-1", RunConfig::default()).unwrap();

        run.send_input(&"x".to_string()).unwrap();
        let result = run.run_superstep().await;
        assert!(matches!(result, Err(WorkflowError::Dispatch(_))));
    }

    #[tokio::test]
    async fn test_conditional_edge_filters_messages() {
        let mut builder = WorkflowBuilder::new("conditional", transform("a", |s| s.to_string()));
        builder
            .add_executor(ExecutorBinding::new("sink", |_| Ok(Sink)).unwrap())
            .add_conditional_edge("a", "sink", |envelope| envelope.open::<String>().is_ok_and(|s| s.starts_with('k')));
        let mut run = Run::start(Arc::new(builder.build().unwrap()), "run-1", RunConfig::default()).unwrap();

        run.send_input(&"keep".to_string()).unwrap();
        run.send_input(&"drop".to_string()).unwrap();
        run.run_to_completion(&CancellationToken::new()).await.unwrap();

        let outputs = run.outputs().iter().map(|output| output.open::<String>().unwrap()).collect::<Vec<_>>();
        assert_eq!(outputs, vec!["keep".to_string()]);
    }

    #[tokio::test]
    async fn test_superstep_limit() {
        let mut builder = WorkflowBuilder::new("ping-pong", transform("ping", |s| s.to_string()));
        builder
            .add_executor(transform("pong", |s| s.to_string()))
            .add_edge("ping", "pong")
            .add_edge("pong", "ping");
        let config = RunConfig { max_supersteps: 5, ..RunConfig::default() };
        let mut run = Run::start(Arc::new(builder.build().unwrap()), "run-1", config).unwrap();

        run.send_input(&"ball".to_string()).unwrap();
        let result = run.run_to_completion(&CancellationToken::new()).await;

        assert!(matches!(result, Err(WorkflowError::Execution(_))));
        assert_eq!(run.superstep(), 5);
        assert_eq!(run.status(), RunStatus::Failed);
    }

    #[tokio::test]
    async fn test_turn_token_follows_buffered_messages() {
        let mut builder = WorkflowBuilder::new("buffered", ExecutorBinding::new("split", |_| Ok(Doubler)).unwrap());
        builder
            .add_executor(ExecutorBinding::new("buffer", |_| Ok(Buffer::default())).unwrap())
            .add_edge("split", "buffer")
            .with_turn_token(true);
        let mut run = Run::start(Arc::new(builder.build().unwrap()), "run-1", RunConfig::default()).unwrap();

        run.send_input(&"m".to_string()).unwrap();
        let status = run.run_to_completion(&CancellationToken::new()).await.unwrap();

        assert_eq!(status, RunStatus::Completed);
        assert_eq!(run.outputs().len(), 1);
        assert_eq!(run.outputs()[0].open::<String>().unwrap(), "m1,m2");
        assert!(run.events().iter().any(|record| matches!(record.event, WorkflowEvent::ConversationUpdate { .. })));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let mut run = Run::start(diamond(Arc::new(AtomicUsize::new(0))), "run-1", RunConfig::default()).unwrap();
        run.send_input(&"x".to_string()).unwrap();

        let token = CancellationToken::new();
        token.cancel();
        assert_eq!(run.run_to_completion(&token).await.unwrap(), RunStatus::Cancelled);
        assert_eq!(run.superstep(), 0);
        assert!(run.send_input(&"y".to_string()).is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unresponsive_superstep_is_abandoned_after_grace() {
        let workflow = WorkflowBuilder::new("slow", ExecutorBinding::new("sleeper", |_| Ok(Sleeper)).unwrap())
            .build()
            .unwrap();
        let config = RunConfig { cancellation_grace_ms: 50, ..RunConfig::default() };
        let mut run = Run::start(Arc::new(workflow), "run-1", config).unwrap();
        run.send_input(&"zzz".to_string()).unwrap();

        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let status = tokio::time::timeout(Duration::from_secs(5), run.run_to_completion(&token)).await.unwrap().unwrap();
        assert_eq!(status, RunStatus::Cancelled);
        assert!(run.in_superstep);
    }

    #[tokio::test]
    async fn test_shared_instance_is_exclusive_per_run() {
        let shared = ExecutorBinding::shared("sink", Sink).unwrap().with_resetting();
        let workflow = Arc::new(WorkflowBuilder::new("shared", shared).build().unwrap());

        let mut first = Run::start(workflow.clone(), "run-1", RunConfig::default()).unwrap();
        assert!(matches!(
            Run::start(workflow.clone(), "run-2", RunConfig::default()),
            Err(WorkflowError::Concurrency(_))
        ));

        first.dispose().await.unwrap();
        let mut second = Run::start(workflow, "run-3", RunConfig::default()).unwrap();
        second.send_input(&"hello".to_string()).unwrap();
        assert_eq!(second.run_to_completion(&CancellationToken::new()).await.unwrap(), RunStatus::Completed);
        second.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn test_journal_receives_every_record() {
        let journal = Arc::new(InMemoryJournal::new());
        let mut run = Run::start(diamond(Arc::new(AtomicUsize::new(0))), "run-j", RunConfig::default())
            .unwrap()
            .with_journal(journal.clone());

        run.send_input(&"x".to_string()).unwrap();
        run.run_to_completion(&CancellationToken::new()).await.unwrap();

        let persisted = journal.replay_events("run-j", 0).await.unwrap();
        assert_eq!(persisted, run.events());
        assert_eq!(journal.highest_sequence_nr("run-j").await.unwrap(), run.events().len() as u64);
    }
}
