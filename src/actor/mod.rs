//! Actor Runtime built on Ractor
//!
//! A runtime manager actor owns the actor factories, the live hosts and the
//! subscription registry. Every addressable actor identity gets its own host
//! actor, so deliveries to one identity are serialised while different
//! identities run concurrently.

pub(crate) mod host;
pub(crate) mod manager;
pub(crate) mod message;
pub mod runtime;
pub mod subscription;

pub use message::RuntimeStats;
pub use runtime::{ActorRuntime, MessageOptions};
pub use subscription::{Subscription, SubscriptionRegistry, TopicMatcher};
