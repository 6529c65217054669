//! Actor state storage implementations
//!
//! Both backends keep one version counter per actor. The tag check and the
//! batch it guards run under one lock, so writes to an actor are
//! linearizable; reads never touch the counter.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc
};

use async_trait::async_trait;
use rocksdb::{Direction, IteratorMode, WriteBatch};
use tokio::sync::RwLock;
use tracing::{Level, event};

use crate::{
    adapter::{SharedDb, scoped_prefix},
    domain::{
        constant::state_storage,
        error::WorkflowError,
        identity::ActorId,
        state::{
            INITIAL_VERSION_TAG, ReadResponse, StateReadOperation, StateReadResult, StateWriteOperation,
            WriteResponse, is_initial_tag, page_keys
        }
    },
    port::storage::ActorStateStorage
};

pub const DEFAULT_LIST_PAGE_SIZE: usize = 100;

/// Whether a batch carrying `expected` may be applied to an actor at `current`
fn tag_matches(current: Option<u64>, expected: &str) -> bool {
    match current {
        None => is_initial_tag(expected),
        Some(version) => expected == version.to_string()
    }
}

fn current_tag(current: Option<u64>) -> String {
    current.map_or_else(|| INITIAL_VERSION_TAG.to_string(), |version| version.to_string())
}

fn log_conflict(actor_id: &ActorId, expected: &str, current: &str) {
    event!(Level::DEBUG, event = state_storage::STATE_CONFLICT,
           actor_id = %actor_id, expected = %expected, current = %current);
}

#[derive(Debug, Default, Clone)]
struct ActorRecord {
    version: u64,
    entries: BTreeMap<String, Vec<u8>>
}

/// Per-actor records behind an async lock
#[derive(Debug)]
pub struct InMemoryActorStateStorage {
    actors:    Arc<RwLock<HashMap<ActorId, ActorRecord>>>,
    page_size: usize
}

impl Default for InMemoryActorStateStorage {
    fn default() -> Self {
        Self::new(DEFAULT_LIST_PAGE_SIZE)
    }
}

impl InMemoryActorStateStorage {
    pub fn new(page_size: usize) -> Self {
        Self { actors: Arc::new(RwLock::new(HashMap::new())), page_size: page_size.max(1) }
    }
}

#[async_trait]
impl ActorStateStorage for InMemoryActorStateStorage {
    async fn write_state(
        &self,
        actor_id: &ActorId,
        operations: &[StateWriteOperation],
        expected_version_tag: &str
    ) -> Result<WriteResponse, WorkflowError> {
        let mut actors = self.actors.write().await;
        let current = actors.get(actor_id).map(|record| record.version);

        if !tag_matches(current, expected_version_tag) {
            let version_tag = current_tag(current);
            log_conflict(actor_id, expected_version_tag, &version_tag);
            return Ok(WriteResponse { version_tag, success: false });
        }
        if operations.is_empty() {
            return Ok(WriteResponse { version_tag: current_tag(current), success: true });
        }

        let record = actors.entry(actor_id.clone()).or_default();
        for operation in operations {
            match operation {
                StateWriteOperation::SetValue { key, value } => {
                    record.entries.insert(key.clone(), value.clone());
                }
                StateWriteOperation::RemoveKey { key } => {
                    record.entries.remove(key);
                }
            }
        }
        record.version += 1;

        event!(Level::DEBUG, event = state_storage::STATE_WRITTEN,
               actor_id = %actor_id, operations = %operations.len(), version = %record.version);
        Ok(WriteResponse { version_tag: record.version.to_string(), success: true })
    }

    async fn read_state(&self, actor_id: &ActorId, operations: &[StateReadOperation]) -> Result<ReadResponse, WorkflowError> {
        let actors = self.actors.read().await;
        let record = actors.get(actor_id);

        let results = operations
            .iter()
            .map(|operation| match operation {
                StateReadOperation::GetValue { key } => {
                    StateReadResult::Value(record.and_then(|record| record.entries.get(key)).cloned())
                }
                StateReadOperation::ListKeys { prefix, continuation_token } => {
                    let (keys, continuation_token) = match record {
                        Some(record) => page_keys(
                            record.entries.keys().map(String::as_str),
                            prefix.as_deref(),
                            continuation_token.as_deref(),
                            self.page_size
                        ),
                        None => (Vec::new(), None)
                    };
                    StateReadResult::Keys { keys, continuation_token }
                }
            })
            .collect();

        event!(Level::TRACE, event = state_storage::STATE_READ, actor_id = %actor_id, operations = %operations.len());
        Ok(ReadResponse { version_tag: current_tag(record.map(|record| record.version)), results })
    }
}

/// RocksDB actor state storage
///
/// Storage layout, partitioned by actor (`{n}` is the byte length of the actor id):
/// - `state\0{n}:{actor_id}\0root` -> version counter (decimal string)
/// - `state\0{n}:{actor_id}\0key\0{key}` -> value bytes
///
/// A write applies the root document and every key document in one
/// `WriteBatch` while holding the database's write lock, which every
/// adapter on the same database shares; reads come from one snapshot.
pub struct RocksDbActorStateStorage {
    db:        Arc<SharedDb>,
    page_size: usize
}

impl RocksDbActorStateStorage {
    pub fn from_db(db: Arc<SharedDb>, page_size: usize) -> Self {
        Self { db, page_size: page_size.max(1) }
    }

    fn root_key(actor_id: &ActorId) -> String {
        format!("{}root", scoped_prefix("state", &actor_id.to_string()))
    }

    fn entry_prefix(actor_id: &ActorId) -> String {
        format!("{}key\u{0}", scoped_prefix("state", &actor_id.to_string()))
    }

    fn parse_version(bytes: Option<Vec<u8>>) -> Result<Option<u64>, WorkflowError> {
        bytes
            .map(|bytes| {
                String::from_utf8_lossy(&bytes)
                    .parse::<u64>()
                    .map_err(|e| WorkflowError::Storage(format!("corrupt version document: {}", e)))
            })
            .transpose()
    }
}

#[async_trait]
impl ActorStateStorage for RocksDbActorStateStorage {
    async fn write_state(
        &self,
        actor_id: &ActorId,
        operations: &[StateWriteOperation],
        expected_version_tag: &str
    ) -> Result<WriteResponse, WorkflowError> {
        let _guard = self.db.lock_writes().await;

        let db = self.db.clone();
        let root_key = Self::root_key(actor_id);
        let entry_prefix = Self::entry_prefix(actor_id);
        let operations = operations.to_vec();
        let expected = expected_version_tag.to_string();

        let (response, applied) = tokio::task::spawn_blocking(move || -> Result<(WriteResponse, usize), WorkflowError> {
            let current = Self::parse_version(db.get(root_key.as_bytes())?)?;
            if !tag_matches(current, &expected) {
                return Ok((WriteResponse { version_tag: current_tag(current), success: false }, 0));
            }
            if operations.is_empty() {
                return Ok((WriteResponse { version_tag: current_tag(current), success: true }, 0));
            }

            let next = current.unwrap_or(0) + 1;
            let mut batch = WriteBatch::default();
            for operation in &operations {
                match operation {
                    StateWriteOperation::SetValue { key, value } => {
                        batch.put(format!("{}{}", entry_prefix, key).as_bytes(), value);
                    }
                    StateWriteOperation::RemoveKey { key } => {
                        batch.delete(format!("{}{}", entry_prefix, key).as_bytes());
                    }
                }
            }
            batch.put(root_key.as_bytes(), next.to_string().as_bytes());
            db.write(batch)?;

            Ok((WriteResponse { version_tag: next.to_string(), success: true }, operations.len()))
        })
        .await
        .map_err(|e| WorkflowError::Storage(format!("state write task failed: {}", e)))??;

        if response.success {
            event!(Level::DEBUG, event = state_storage::STATE_WRITTEN,
                   actor_id = %actor_id, operations = %applied, version = %response.version_tag);
        } else {
            log_conflict(actor_id, expected_version_tag, &response.version_tag);
        }
        Ok(response)
    }

    async fn read_state(&self, actor_id: &ActorId, operations: &[StateReadOperation]) -> Result<ReadResponse, WorkflowError> {
        let db = self.db.clone();
        let root_key = Self::root_key(actor_id);
        let entry_prefix = Self::entry_prefix(actor_id);
        let operations = operations.to_vec();
        let page_size = self.page_size;

        let response = tokio::task::spawn_blocking(move || -> Result<ReadResponse, WorkflowError> {
            let snapshot = db.snapshot();
            let version = Self::parse_version(snapshot.get(root_key.as_bytes())?)?;

            let mut results = Vec::with_capacity(operations.len());
            for operation in &operations {
                match operation {
                    StateReadOperation::GetValue { key } => {
                        let value = snapshot.get(format!("{}{}", entry_prefix, key).as_bytes())?;
                        results.push(StateReadResult::Value(value));
                    }
                    StateReadOperation::ListKeys { prefix, continuation_token } => {
                        let scan = format!("{}{}", entry_prefix, prefix.as_deref().unwrap_or(""));
                        let mut names = Vec::new();
                        for item in snapshot.iterator(IteratorMode::From(scan.as_bytes(), Direction::Forward)) {
                            let (key, _) = item?;
                            if !key.starts_with(scan.as_bytes()) {
                                break;
                            }
                            names.push(String::from_utf8_lossy(&key[entry_prefix.len()..]).into_owned());
                        }
                        let (keys, continuation_token) = page_keys(
                            names.iter().map(String::as_str),
                            None,
                            continuation_token.as_deref(),
                            page_size
                        );
                        results.push(StateReadResult::Keys { keys, continuation_token });
                    }
                }
            }

            Ok(ReadResponse { version_tag: current_tag(version), results })
        })
        .await
        .map_err(|e| WorkflowError::Storage(format!("state read task failed: {}", e)))??;

        event!(Level::TRACE, event = state_storage::STATE_READ, actor_id = %actor_id);
        Ok(response)
    }
}
