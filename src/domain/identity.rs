//! Actor and topic identities
//!
//! Both identities are immutable value types. They are validated on
//! construction so malformed ids fail where they are created rather than
//! when a message is routed.

use std::{fmt, str::FromStr};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::domain::error::WorkflowError;

static ACTOR_TYPE_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z_:0-9]*$").expect("valid regex"));
static TOPIC_TYPE_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[\w\-.:=]+$").expect("valid regex"));

/// Source used by topics that were created without an explicit source
pub const DEFAULT_TOPIC_SOURCE: &str = "default";

/// Identifies one logical actor instance
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "RawActorId")]
pub struct ActorId {
    actor_type: String,
    key:        String
}

impl ActorId {
    pub fn new(actor_type: impl Into<String>, key: impl Into<String>) -> Result<Self, WorkflowError> {
        let actor_type = actor_type.into();
        if !ACTOR_TYPE_PATTERN.is_match(&actor_type) {
            return Err(WorkflowError::Validation(format!(
                "invalid actor type '{}': must match ^[A-Za-z_][A-Za-z_:0-9]*$",
                actor_type
            )));
        }
        Ok(Self { actor_type, key: key.into() })
    }

    pub fn actor_type(&self) -> &str {
        &self.actor_type
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.actor_type, self.key)
    }
}

/// Wire form of [`ActorId`]; decoding goes through [`ActorId::new`]
#[derive(Deserialize)]
struct RawActorId {
    actor_type: String,
    key:        String
}

impl TryFrom<RawActorId> for ActorId {
    type Error = WorkflowError;

    fn try_from(raw: RawActorId) -> Result<Self, Self::Error> {
        ActorId::new(raw.actor_type, raw.key)
    }
}

impl FromStr for ActorId {
    type Err = WorkflowError;

    /// Parses the `type/key` form produced by `Display`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (actor_type, key) = s
            .split_once('/')
            .ok_or_else(|| WorkflowError::Validation(format!("invalid actor id '{}': expected type/key", s)))?;
        ActorId::new(actor_type, key)
    }
}

/// Identifies a broadcast channel; never used for direct addressing
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "RawTopicId")]
pub struct TopicId {
    topic_type: String,
    source:     String
}

impl TopicId {
    pub fn new(topic_type: impl Into<String>, source: impl Into<String>) -> Result<Self, WorkflowError> {
        let topic_type = topic_type.into();
        if !TOPIC_TYPE_PATTERN.is_match(&topic_type) {
            return Err(WorkflowError::Validation(format!(
                "invalid topic type '{}': must match ^[\\w\\-.:=]+$",
                topic_type
            )));
        }
        Ok(Self { topic_type, source: source.into() })
    }

    /// Topic with the default source
    pub fn with_default_source(topic_type: impl Into<String>) -> Result<Self, WorkflowError> {
        Self::new(topic_type, DEFAULT_TOPIC_SOURCE)
    }

    pub fn topic_type(&self) -> &str {
        &self.topic_type
    }

    pub fn source(&self) -> &str {
        &self.source
    }
}

impl fmt::Display for TopicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.topic_type, self.source)
    }
}

#[derive(Deserialize)]
struct RawTopicId {
    topic_type: String,
    source:     String
}

impl TryFrom<RawTopicId> for TopicId {
    type Error = WorkflowError;

    fn try_from(raw: RawTopicId) -> Result<Self, Self::Error> {
        TopicId::new(raw.topic_type, raw.source)
    }
}

impl FromStr for TopicId {
    type Err = WorkflowError;

    /// Parses `type/source`, or a bare `type` with the default source
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((topic_type, source)) => TopicId::new(topic_type, source),
            None => TopicId::with_default_source(s)
        }
    }
}
