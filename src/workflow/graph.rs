//! Workflow Graph - executor bindings plus the edges between them
//!
//! Graphs are assembled with [`WorkflowBuilder`] and validated once in
//! [`WorkflowBuilder::build`]: every structural mistake (an edge naming an
//! unknown node, an unresolved placeholder, a fan-in target that cannot take
//! the aggregated round) is reported there, never during a run.

use std::{
    collections::{BTreeMap, HashSet},
    fmt,
    sync::Arc
};

use crate::{
    domain::{
        error::WorkflowError,
        message::{Envelope, FanInRound, TurnToken, type_key}
    },
    workflow::binding::ExecutorBinding
};

/// Predicate deciding whether a message crosses a conditional edge
pub type EdgeCondition = Arc<dyn Fn(&Envelope) -> bool + Send + Sync>;

/// Picks target indices for a message crossing a partitioned fan-out edge
pub type FanOutAssigner = Arc<dyn Fn(&Envelope, usize) -> Vec<usize> + Send + Sync>;

#[derive(Clone)]
pub enum EdgeKind {
    Direct { source: String, target: String },
    Conditional { source: String, target: String, condition: EdgeCondition },
    FanOut { source: String, targets: Vec<String>, assigner: Option<FanOutAssigner> },
    FanIn { sources: Vec<String>, target: String }
}

impl fmt::Debug for EdgeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EdgeKind::Direct { source, target } => write!(f, "Direct({} -> {})", source, target),
            EdgeKind::Conditional { source, target, .. } => write!(f, "Conditional({} -> {})", source, target),
            EdgeKind::FanOut { source, targets, assigner } => {
                write!(f, "FanOut({} -> {:?}, partitioned: {})", source, targets, assigner.is_some())
            }
            EdgeKind::FanIn { sources, target } => write!(f, "FanIn({:?} -> {})", sources, target)
        }
    }
}

/// A directed connection; `index` is its position in the graph
#[derive(Debug, Clone)]
pub struct Edge {
    pub index:      usize,
    pub kind:       EdgeKind,
    /// When set, a turn token follows the data delivered across this edge
    pub turn_token: Option<TurnToken>
}

impl Edge {
    pub fn sources(&self) -> Vec<&str> {
        match &self.kind {
            EdgeKind::Direct { source, .. } | EdgeKind::Conditional { source, .. } | EdgeKind::FanOut { source, .. } => {
                vec![source.as_str()]
            }
            EdgeKind::FanIn { sources, .. } => sources.iter().map(String::as_str).collect()
        }
    }

    pub fn targets(&self) -> Vec<&str> {
        match &self.kind {
            EdgeKind::Direct { target, .. } | EdgeKind::Conditional { target, .. } | EdgeKind::FanIn { target, .. } => {
                vec![target.as_str()]
            }
            EdgeKind::FanOut { targets, .. } => targets.iter().map(String::as_str).collect()
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            EdgeKind::Direct { .. } => "direct",
            EdgeKind::Conditional { .. } => "conditional",
            EdgeKind::FanOut { .. } => "fan-out",
            EdgeKind::FanIn { .. } => "fan-in"
        }
    }
}

/// An immutable, validated graph
#[derive(Debug)]
pub struct Workflow {
    name:      String,
    start:     String,
    executors: BTreeMap<String, ExecutorBinding>,
    /// Executor ids in registration order
    order:     Vec<String>,
    edges:     Vec<Edge>
}

impl Workflow {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn start_executor(&self) -> &str {
        &self.start
    }

    pub fn executor(&self, id: &str) -> Option<&ExecutorBinding> {
        self.executors.get(id)
    }

    /// Bindings in registration order
    pub fn executors(&self) -> impl Iterator<Item = &ExecutorBinding> {
        self.order.iter().filter_map(|id| self.executors.get(id))
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// Edges with `executor_id` among their sources
    pub fn outgoing(&self, executor_id: &str) -> impl Iterator<Item = &Edge> {
        self.edges.iter().filter(move |edge| edge.sources().contains(&executor_id))
    }

    /// Stable description of the graph's shape, used to match checkpoints to workflows
    pub fn fingerprint(&self) -> String {
        let nodes = self
            .executors()
            .map(|binding| format!("{}:{}", binding.id(), binding.executor_type()))
            .collect::<Vec<_>>()
            .join(",");
        let edges = self
            .edges
            .iter()
            .map(|edge| format!("{}[{}->{}]", edge.kind_name(), edge.sources().join("+"), edge.targets().join("+")))
            .collect::<Vec<_>>()
            .join(",");
        format!("{}|start={}|nodes={}|edges={}", self.name, self.start, nodes, edges)
    }
}

/// Assembles a [`Workflow`]
pub struct WorkflowBuilder {
    name:      String,
    start:     String,
    executors: BTreeMap<String, ExecutorBinding>,
    order:     Vec<String>,
    edges:     Vec<Edge>,
    errors:    Vec<String>
}

impl WorkflowBuilder {
    pub fn new(name: impl Into<String>, start: ExecutorBinding) -> Self {
        let mut builder = Self {
            name:      name.into(),
            start:     start.id().to_string(),
            executors: BTreeMap::new(),
            order:     Vec::new(),
            edges:     Vec::new(),
            errors:    Vec::new()
        };
        builder.add_executor(start);
        builder
    }

    /// Register a node; ids must be unique
    pub fn add_executor(&mut self, binding: ExecutorBinding) -> &mut Self {
        if self.executors.contains_key(binding.id()) {
            self.errors.push(format!("executor '{}' is registered twice", binding.id()));
            return self;
        }
        self.order.push(binding.id().to_string());
        self.executors.insert(binding.id().to_string(), binding);
        self
    }

    /// Resolve a placeholder registered earlier
    pub fn bind(&mut self, binding: ExecutorBinding) -> &mut Self {
        match self.executors.get(binding.id()) {
            Some(existing) if existing.is_placeholder() => {
                self.executors.insert(binding.id().to_string(), binding);
            }
            Some(_) => self.errors.push(format!("executor '{}' is already bound", binding.id())),
            None => self.errors.push(format!("no placeholder '{}' to bind", binding.id()))
        }
        self
    }

    pub fn add_edge(&mut self, source: &str, target: &str) -> &mut Self {
        self.push_edge(EdgeKind::Direct { source: source.to_string(), target: target.to_string() })
    }

    pub fn add_conditional_edge<F>(&mut self, source: &str, target: &str, condition: F) -> &mut Self
    where
        F: Fn(&Envelope) -> bool + Send + Sync + 'static
    {
        self.push_edge(EdgeKind::Conditional {
            source:    source.to_string(),
            target:    target.to_string(),
            condition: Arc::new(condition)
        })
    }

    /// Broadcast every message from `source` to each of `targets`
    pub fn add_fan_out_edge(&mut self, source: &str, targets: &[&str]) -> &mut Self {
        self.push_edge(EdgeKind::FanOut {
            source:   source.to_string(),
            targets:  targets.iter().map(|t| t.to_string()).collect(),
            assigner: None
        })
    }

    /// Fan out to the targets the assigner picks for each message
    pub fn add_fan_out_edge_with<F>(&mut self, source: &str, targets: &[&str], assigner: F) -> &mut Self
    where
        F: Fn(&Envelope, usize) -> Vec<usize> + Send + Sync + 'static
    {
        self.push_edge(EdgeKind::FanOut {
            source:   source.to_string(),
            targets:  targets.iter().map(|t| t.to_string()).collect(),
            assigner: Some(Arc::new(assigner))
        })
    }

    /// Deliver one [`FanInRound`] to `target` once every source has produced a message
    pub fn add_fan_in_edge(&mut self, sources: &[&str], target: &str) -> &mut Self {
        self.push_edge(EdgeKind::FanIn {
            sources: sources.iter().map(|s| s.to_string()).collect(),
            target:  target.to_string()
        })
    }

    /// Follow deliveries across the most recently added edge with a turn token
    pub fn with_turn_token(&mut self, emit_events: bool) -> &mut Self {
        match self.edges.last_mut() {
            Some(edge) => edge.turn_token = Some(TurnToken::new(emit_events)),
            None => self.errors.push("with_turn_token called before any edge was added".to_string())
        }
        self
    }

    fn push_edge(&mut self, kind: EdgeKind) -> &mut Self {
        let index = self.edges.len();
        self.edges.push(Edge { index, kind, turn_token: None });
        self
    }

    /// Validate and freeze the graph
    pub fn build(&self) -> Result<Workflow, WorkflowError> {
        let mut errors = self.errors.clone();

        for binding in self.executors.values() {
            if binding.is_placeholder() {
                errors.push(format!("executor '{}' is an unresolved placeholder", binding.id()));
            }
        }

        for edge in &self.edges {
            let sources = edge.sources();
            let targets = edge.targets();
            if sources.is_empty() || targets.is_empty() {
                errors.push(format!("{} edge #{} needs at least one source and one target", edge.kind_name(), edge.index));
            }

            for id in sources.iter().chain(targets.iter()) {
                if !self.executors.contains_key(*id) {
                    errors.push(format!("{} edge #{} references unknown executor '{}'", edge.kind_name(), edge.index, id));
                }
            }

            let unique_sources = sources.iter().collect::<HashSet<_>>();
            if unique_sources.len() != sources.len() {
                errors.push(format!("{} edge #{} lists a source twice", edge.kind_name(), edge.index));
            }

            for target in &targets {
                let Some(binding) = self.executors.get(*target) else {
                    continue;
                };
                if binding.is_placeholder() {
                    continue;
                }
                if matches!(edge.kind, EdgeKind::FanIn { .. }) && !binding.accepts(type_key::<FanInRound>()) {
                    errors.push(format!("fan-in target '{}' does not handle FanInRound", target));
                }
                if edge.turn_token.is_some() && !binding.accepts(type_key::<TurnToken>()) {
                    errors.push(format!("turn-token edge target '{}' does not handle TurnToken", target));
                }
            }
        }

        if !errors.is_empty() {
            return Err(WorkflowError::Configuration(errors.join("; ")));
        }

        Ok(Workflow {
            name:      self.name.clone(),
            start:     self.start.clone(),
            executors: self.executors.clone(),
            order:     self.order.clone(),
            edges:     self.edges.clone()
        })
    }
}
