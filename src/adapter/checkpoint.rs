//! Checkpoint store implementations
//!
//! Both stores list checkpoint ids in ascending order. Ids produced by the
//! checkpoint manager start with the zero-padded superstep and capture
//! ordinal, so that order is also capture order.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc
};

use async_trait::async_trait;
use rocksdb::{Direction, IteratorMode};
use tokio::sync::RwLock;

use crate::{
    adapter::{SharedDb, scoped_prefix},
    domain::error::WorkflowError,
    port::checkpoint::CheckpointStore
};

#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    blobs: Arc<RwLock<HashMap<String, BTreeMap<String, Vec<u8>>>>>
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn save(&self, run_id: &str, checkpoint_id: &str, blob: Vec<u8>) -> Result<(), WorkflowError> {
        let mut blobs = self.blobs.write().await;
        blobs.entry(run_id.to_string()).or_default().insert(checkpoint_id.to_string(), blob);
        Ok(())
    }

    async fn load(&self, run_id: &str, checkpoint_id: &str) -> Result<Option<Vec<u8>>, WorkflowError> {
        let blobs = self.blobs.read().await;
        Ok(blobs.get(run_id).and_then(|run| run.get(checkpoint_id)).cloned())
    }

    async fn list(&self, run_id: &str) -> Result<Vec<String>, WorkflowError> {
        let blobs = self.blobs.read().await;
        Ok(blobs.get(run_id).map(|run| run.keys().cloned().collect()).unwrap_or_default())
    }

    async fn delete(&self, run_id: &str, checkpoint_id: &str) -> Result<(), WorkflowError> {
        let mut blobs = self.blobs.write().await;
        if let Some(run) = blobs.get_mut(run_id) {
            run.remove(checkpoint_id);
            if run.is_empty() {
                blobs.remove(run_id);
            }
        }
        Ok(())
    }
}

/// RocksDB checkpoint store
///
/// Storage layout:
/// - `checkpoint\0{n}:{run_id}\0{checkpoint_id}` -> checkpoint blob, `{n}` being the run id's length
pub struct RocksDbCheckpointStore {
    db: Arc<SharedDb>
}

impl RocksDbCheckpointStore {
    /// Share an open database with the other RocksDB adapters
    pub fn from_db(db: Arc<SharedDb>) -> Self {
        Self { db }
    }

    fn run_prefix(run_id: &str) -> String {
        scoped_prefix("checkpoint", run_id)
    }

    fn key(run_id: &str, checkpoint_id: &str) -> String {
        format!("{}{}", Self::run_prefix(run_id), checkpoint_id)
    }
}

#[async_trait]
impl CheckpointStore for RocksDbCheckpointStore {
    async fn save(&self, run_id: &str, checkpoint_id: &str, blob: Vec<u8>) -> Result<(), WorkflowError> {
        let db = self.db.clone();
        let key = Self::key(run_id, checkpoint_id);
        tokio::task::spawn_blocking(move || db.put(key.as_bytes(), blob).map_err(WorkflowError::from))
            .await
            .map_err(|e| WorkflowError::Storage(format!("checkpoint write task failed: {}", e)))?
    }

    async fn load(&self, run_id: &str, checkpoint_id: &str) -> Result<Option<Vec<u8>>, WorkflowError> {
        let db = self.db.clone();
        let key = Self::key(run_id, checkpoint_id);
        tokio::task::spawn_blocking(move || db.get(key.as_bytes()).map_err(WorkflowError::from))
            .await
            .map_err(|e| WorkflowError::Storage(format!("checkpoint read task failed: {}", e)))?
    }

    async fn list(&self, run_id: &str) -> Result<Vec<String>, WorkflowError> {
        let db = self.db.clone();
        let prefix = Self::run_prefix(run_id);
        tokio::task::spawn_blocking(move || -> Result<Vec<String>, WorkflowError> {
            let mut ids = Vec::new();
            for item in db.iterator(IteratorMode::From(prefix.as_bytes(), Direction::Forward)) {
                let (key, _) = item?;
                let Some(id) = key.strip_prefix(prefix.as_bytes()) else {
                    break;
                };
                ids.push(String::from_utf8_lossy(id).into_owned());
            }
            Ok(ids)
        })
        .await
        .map_err(|e| WorkflowError::Storage(format!("checkpoint list task failed: {}", e)))?
    }

    async fn delete(&self, run_id: &str, checkpoint_id: &str) -> Result<(), WorkflowError> {
        let db = self.db.clone();
        let key = Self::key(run_id, checkpoint_id);
        tokio::task::spawn_blocking(move || db.delete(key.as_bytes()).map_err(WorkflowError::from))
            .await
            .map_err(|e| WorkflowError::Storage(format!("checkpoint delete task failed: {}", e)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::open_db;

    async fn exercise(store: &dyn CheckpointStore) {
        assert!(store.list("run").await.unwrap().is_empty());
        assert_eq!(store.load("run", "missing").await.unwrap(), None);

        store.save("run", "000000000002-b", b"second".to_vec()).await.unwrap();
        store.save("run", "000000000001-a", b"first".to_vec()).await.unwrap();
        store.save("run:other", "000000000001-z", b"other".to_vec()).await.unwrap();
        store.save("run\u{0}nested", "000000000003-c", b"nested".to_vec()).await.unwrap();

        assert_eq!(store.list("run").await.unwrap(), vec!["000000000001-a", "000000000002-b"]);
        assert_eq!(store.load("run", "000000000002-b").await.unwrap(), Some(b"second".to_vec()));

        store.delete("run", "000000000001-a").await.unwrap();
        store.delete("run", "000000000001-a").await.unwrap();
        assert_eq!(store.list("run").await.unwrap(), vec!["000000000002-b"]);
        assert_eq!(store.list("run:other").await.unwrap().len(), 1);
        assert_eq!(store.list("run\u{0}nested").await.unwrap(), vec!["000000000003-c"]);
    }

    #[tokio::test]
    async fn test_inmemory_store() {
        exercise(&InMemoryCheckpointStore::new()).await;
    }

    #[tokio::test]
    async fn test_rocksdb_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksDbCheckpointStore::from_db(open_db(dir.path()).unwrap());
        exercise(&store).await;
    }
}
