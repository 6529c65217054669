//! Subscription Registry - maps topics to actor addresses
//!
//! Matching is evaluated against the registered subscriptions on every call;
//! nothing is cached, so a registry mutation is visible to the next publish.

use serde::{Deserialize, Serialize};

use crate::domain::{
    error::WorkflowError,
    identity::{ActorId, TopicId}
};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TopicMatcher {
    /// Topic type equals the value
    Exact(String),
    /// Topic type starts with the value
    Prefix(String)
}

impl TopicMatcher {
    pub fn matches(&self, topic: &TopicId) -> bool {
        match self {
            TopicMatcher::Exact(topic_type) => topic.topic_type() == topic_type,
            TopicMatcher::Prefix(prefix) => topic.topic_type().starts_with(prefix.as_str())
        }
    }
}

/// Routes every matching topic to `actor_type`, keyed by the topic's source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    id:         String,
    matcher:    TopicMatcher,
    actor_type: String
}

impl Subscription {
    pub fn new(id: impl Into<String>, matcher: TopicMatcher, actor_type: impl Into<String>) -> Result<Self, WorkflowError> {
        let actor_type = actor_type.into();
        // Validates the type pattern up front
        ActorId::new(actor_type.as_str(), "")?;
        Ok(Self { id: id.into(), matcher, actor_type })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn matcher(&self) -> &TopicMatcher {
        &self.matcher
    }

    pub fn actor_type(&self) -> &str {
        &self.actor_type
    }

    pub fn matches(&self, topic: &TopicId) -> bool {
        self.matcher.matches(topic)
    }

    pub fn map_to_actor(&self, topic: &TopicId) -> Result<ActorId, WorkflowError> {
        if !self.matches(topic) {
            return Err(WorkflowError::Dispatch(format!("subscription {} does not match topic {}", self.id, topic)));
        }
        ActorId::new(self.actor_type.as_str(), topic.source())
    }
}

/// Same id, or same actor type and matcher
impl PartialEq for Subscription {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id || (self.actor_type == other.actor_type && self.matcher == other.matcher)
    }
}

#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    subscriptions: Vec<Subscription>
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, subscription: Subscription) -> Result<(), WorkflowError> {
        if let Some(existing) = self.subscriptions.iter().find(|existing| **existing == subscription) {
            return Err(WorkflowError::Configuration(format!(
                "subscription {} duplicates existing subscription {}",
                subscription.id, existing.id
            )));
        }
        self.subscriptions.push(subscription);
        Ok(())
    }

    pub fn remove(&mut self, id: &str) -> Result<Subscription, WorkflowError> {
        let index = self
            .subscriptions
            .iter()
            .position(|subscription| subscription.id == id)
            .ok_or_else(|| WorkflowError::Configuration(format!("unknown subscription {}", id)))?;
        Ok(self.subscriptions.remove(index))
    }

    /// Addresses of every actor subscribed to `topic`, deduplicated in registration order
    pub fn matching_actors(&self, topic: &TopicId) -> Result<Vec<ActorId>, WorkflowError> {
        let mut actors: Vec<ActorId> = Vec::new();
        for subscription in self.subscriptions.iter().filter(|subscription| subscription.matches(topic)) {
            let actor = subscription.map_to_actor(topic)?;
            if !actors.contains(&actor) {
                actors.push(actor);
            }
        }
        Ok(actors)
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topic(topic_type: &str, source: &str) -> TopicId {
        TopicId::new(topic_type, source).unwrap()
    }

    #[test]
    fn test_map_to_actor_uses_topic_source() {
        let subscription = Subscription::new("s1", TopicMatcher::Exact("orders".into()), "billing").unwrap();
        let actor = subscription.map_to_actor(&topic("orders", "shop-7")).unwrap();
        assert_eq!(actor, ActorId::new("billing", "shop-7").unwrap());
        assert!(subscription.map_to_actor(&topic("refunds", "shop-7")).is_err());
    }

    #[test]
    fn test_prefix_matching() {
        let matcher = TopicMatcher::Prefix("orders.".into());
        assert!(matcher.matches(&topic("orders.created", "x")));
        assert!(!matcher.matches(&topic("orders", "x")));
    }

    #[test]
    fn test_invalid_actor_type_is_rejected() {
        assert!(matches!(
            Subscription::new("s", TopicMatcher::Exact("t".into()), "9lives"),
            Err(WorkflowError::Validation(_))
        ));
    }

    #[test]
    fn test_duplicates_by_id_or_by_shape() {
        let mut registry = SubscriptionRegistry::new();
        registry.add(Subscription::new("s1", TopicMatcher::Exact("orders".into()), "billing").unwrap()).unwrap();

        let same_id = Subscription::new("s1", TopicMatcher::Prefix("x".into()), "audit").unwrap();
        assert!(matches!(registry.add(same_id), Err(WorkflowError::Configuration(_))));

        let same_shape = Subscription::new("s2", TopicMatcher::Exact("orders".into()), "billing").unwrap();
        assert!(matches!(registry.add(same_shape), Err(WorkflowError::Configuration(_))));

        registry.add(Subscription::new("s3", TopicMatcher::Exact("orders".into()), "audit").unwrap()).unwrap();
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_matching_reflects_mutations() {
        let mut registry = SubscriptionRegistry::new();
        registry.add(Subscription::new("exact", TopicMatcher::Exact("orders.created".into()), "billing").unwrap()).unwrap();
        registry.add(Subscription::new("prefix", TopicMatcher::Prefix("orders.".into()), "billing").unwrap()).unwrap();
        registry.add(Subscription::new("audit", TopicMatcher::Prefix("orders".into()), "audit").unwrap()).unwrap();

        let created = topic("orders.created", "eu");
        let actors = registry.matching_actors(&created).unwrap();
        assert_eq!(actors, vec![ActorId::new("billing", "eu").unwrap(), ActorId::new("audit", "eu").unwrap()]);

        registry.remove("audit").unwrap();
        assert_eq!(registry.matching_actors(&created).unwrap().len(), 1);
        assert!(matches!(registry.remove("audit"), Err(WorkflowError::Configuration(_))));
    }
}
