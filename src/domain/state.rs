//! Actor state operations
//!
//! Reads and writes against actor state storage are expressed as closed sum
//! types, so every backend matches them exhaustively.

use serde::{Deserialize, Serialize};

use crate::domain::error::WorkflowError;

/// Version tag reported for an actor that has never been written
pub const INITIAL_VERSION_TAG: &str = "0";

/// True when `tag` is one of the accepted spellings of "no prior state"
pub fn is_initial_tag(tag: &str) -> bool {
    tag.is_empty() || tag == INITIAL_VERSION_TAG
}

/// One mutation inside an atomic write batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StateWriteOperation {
    SetValue { key: String, value: Vec<u8> },
    RemoveKey { key: String }
}

impl StateWriteOperation {
    pub fn set(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        StateWriteOperation::SetValue { key: key.into(), value: value.into() }
    }

    pub fn remove(key: impl Into<String>) -> Self {
        StateWriteOperation::RemoveKey { key: key.into() }
    }
}

/// One lookup inside a read batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StateReadOperation {
    GetValue { key: String },
    /// Lists keys in ascending order; `None` prefix lists every key of the actor
    ListKeys { prefix: Option<String>, continuation_token: Option<String> }
}

impl StateReadOperation {
    pub fn get(key: impl Into<String>) -> Self {
        StateReadOperation::GetValue { key: key.into() }
    }

    pub fn list(prefix: Option<&str>, continuation_token: Option<String>) -> Self {
        StateReadOperation::ListKeys { prefix: prefix.map(str::to_string), continuation_token }
    }
}

/// Result of one read operation, positionally matching the request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StateReadResult {
    /// `None` when the key does not exist
    Value(Option<Vec<u8>>),
    /// A page of keys; `continuation_token` is set when more keys remain
    Keys { keys: Vec<String>, continuation_token: Option<String> }
}

impl StateReadResult {
    pub fn into_value(self) -> Option<Vec<u8>> {
        match self {
            StateReadResult::Value(value) => value,
            StateReadResult::Keys { .. } => None
        }
    }
}

/// Outcome of a write batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteResponse {
    /// The new tag on success, the actor's current tag on conflict
    pub version_tag: String,
    pub success:     bool
}

impl WriteResponse {
    /// Turn a rejected batch into a `VersionConflict` the caller must handle
    pub fn into_result(self) -> Result<String, WorkflowError> {
        if self.success {
            Ok(self.version_tag)
        } else {
            Err(WorkflowError::VersionConflict(format!("current version tag is '{}'", self.version_tag)))
        }
    }
}

/// Outcome of a read batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadResponse {
    pub version_tag: String,
    pub results:     Vec<StateReadResult>
}

/// Key-space paging shared by the storage backends
///
/// `keys` must be sorted ascending. The continuation token is the last key
/// of the returned page.
pub fn page_keys<'a>(
    keys: impl Iterator<Item = &'a str>,
    prefix: Option<&str>,
    continuation_token: Option<&str>,
    page_size: usize
) -> (Vec<String>, Option<String>) {
    let mut matching = keys
        .filter(|key| prefix.is_none_or(|p| key.starts_with(p)))
        .filter(|key| continuation_token.is_none_or(|token| *key > token))
        .take(page_size + 1)
        .map(str::to_string)
        .collect::<Vec<_>>();

    if matching.len() > page_size {
        matching.truncate(page_size);
        let token = matching.last().cloned();
        (matching, token)
    } else {
        (matching, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_tag_spellings() {
        assert!(is_initial_tag(""));
        assert!(is_initial_tag("0"));
        assert!(!is_initial_tag("1"));
    }

    #[test]
    fn test_page_keys_with_continuation() {
        let keys = ["a/1", "a/2", "a/3", "b/1"];

        let (page, token) = page_keys(keys.iter().copied(), Some("a/"), None, 2);
        assert_eq!(page, vec!["a/1", "a/2"]);
        assert_eq!(token.as_deref(), Some("a/2"));

        let (page, token) = page_keys(keys.iter().copied(), Some("a/"), token.as_deref(), 2);
        assert_eq!(page, vec!["a/3"]);
        assert_eq!(token, None);

        let (page, _) = page_keys(keys.iter().copied(), None, None, 10);
        assert_eq!(page.len(), 4);
    }

    #[test]
    fn test_rejected_write_maps_to_version_conflict() {
        let rejected = WriteResponse { version_tag: "3".into(), success: false };
        assert!(matches!(rejected.into_result(), Err(WorkflowError::VersionConflict(_))));
    }
}
