//! Fan-in aggregation state
//!
//! Each fan-in edge keeps one FIFO per source. A round is released as soon as
//! every source queue holds at least one message; the round takes exactly one
//! message from each queue, so surplus messages from a fast source wait for
//! the next round instead of being merged into the current one.

use std::collections::{BTreeMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::domain::message::{Envelope, FanInInput, FanInRound};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FanInEdgeState {
    /// Source ids in declaration order
    sources:    Vec<String>,
    pending:    BTreeMap<String, VecDeque<Envelope>>,
    next_round: u64
}

impl FanInEdgeState {
    pub fn new(sources: &[String]) -> Self {
        Self {
            sources:    sources.to_vec(),
            pending:    sources.iter().map(|source| (source.clone(), VecDeque::new())).collect(),
            next_round: 0
        }
    }

    /// Queue a message from `source`; returns every round that became complete
    pub fn accept(&mut self, source: &str, message: Envelope) -> Vec<FanInRound> {
        let Some(queue) = self.pending.get_mut(source) else {
            return Vec::new();
        };
        queue.push_back(message);

        let mut rounds = Vec::new();
        while self.pending.values().all(|queue| !queue.is_empty()) {
            let inputs = self
                .sources
                .iter()
                .filter_map(|source| {
                    let message = self.pending.get_mut(source)?.pop_front()?;
                    Some(FanInInput { source: source.clone(), message })
                })
                .collect();
            rounds.push(FanInRound { round: self.next_round, inputs });
            self.next_round += 1;
        }
        rounds
    }

    pub fn pending_count(&self, source: &str) -> usize {
        self.pending.get(source).map_or(0, VecDeque::len)
    }

    pub fn rounds_released(&self) -> u64 {
        self.next_round
    }
}

/// Fan-in state of a whole run, keyed by edge index
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FanInState {
    edges: BTreeMap<usize, FanInEdgeState>
}

impl FanInState {
    pub fn register(&mut self, edge_index: usize, sources: &[String]) {
        self.edges.entry(edge_index).or_insert_with(|| FanInEdgeState::new(sources));
    }

    pub fn accept(&mut self, edge_index: usize, source: &str, message: Envelope) -> Vec<FanInRound> {
        self.edges.get_mut(&edge_index).map(|edge| edge.accept(source, message)).unwrap_or_default()
    }

    pub fn edge(&self, edge_index: usize) -> Option<&FanInEdgeState> {
        self.edges.get(&edge_index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sources() -> Vec<String> {
        vec!["b".to_string(), "c".to_string()]
    }

    fn text(value: &str) -> Envelope {
        Envelope::wrap(&value.to_string()).unwrap()
    }

    #[test]
    fn test_round_releases_when_every_source_has_produced() {
        let mut edge = FanInEdgeState::new(&sources());
        assert!(edge.accept("b", text("b0")).is_empty());

        let rounds = edge.accept("c", text("c0"));
        assert_eq!(rounds.len(), 1);
        assert_eq!(rounds[0].round, 0);
        assert_eq!(rounds[0].values::<String>().unwrap(), vec!["b0", "c0"]);
        assert_eq!(edge.pending_count("b"), 0);
    }

    #[test]
    fn test_surplus_messages_wait_for_the_next_round() {
        let mut edge = FanInEdgeState::new(&sources());
        edge.accept("b", text("b0"));
        edge.accept("b", text("b1"));

        let first = edge.accept("c", text("c0"));
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].value_from::<String>("b").unwrap().as_deref(), Some("b0"));
        assert_eq!(edge.pending_count("b"), 1);

        let second = edge.accept("c", text("c1"));
        assert_eq!(second[0].round, 1);
        assert_eq!(second[0].values::<String>().unwrap(), vec!["b1", "c1"]);
        assert_eq!(edge.rounds_released(), 2);
    }

    #[test]
    fn test_unknown_source_is_ignored() {
        let mut state = FanInState::default();
        state.register(3, &sources());
        assert!(state.accept(3, "z", text("z0")).is_empty());
        assert!(state.accept(9, "b", text("b0")).is_empty());
        assert_eq!(state.edge(3).unwrap().pending_count("b"), 0);
    }
}
