//! Adapters - storage backends behind the port traits

pub mod checkpoint;
pub mod journal;
pub mod state;

use std::{
    collections::HashMap,
    fmt,
    ops::Deref,
    path::{Path, PathBuf},
    str::FromStr,
    sync::{Arc, Mutex, Weak}
};

use once_cell::sync::Lazy;
use rocksdb::{DB, Options};
use serde::{Deserialize, Serialize};

use crate::{
    adapter::{
        checkpoint::{InMemoryCheckpointStore, RocksDbCheckpointStore},
        journal::InMemoryJournal,
        state::{InMemoryActorStateStorage, RocksDbActorStateStorage}
    },
    config::StorageConfig,
    domain::error::WorkflowError,
    port::{checkpoint::CheckpointStore, journal::EventJournal, storage::ActorStateStorage}
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum StoreType {
    #[default]
    #[serde(rename = "inmemory")]
    InMemory,
    #[serde(rename = "rocksdb")]
    RocksDb
}

impl StoreType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreType::InMemory => "inmemory",
            StoreType::RocksDb => "rocksdb"
        }
    }
}

impl FromStr for StoreType {
    type Err = WorkflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inmemory" => Ok(StoreType::InMemory),
            "rocksdb" => Ok(StoreType::RocksDb),
            other => Err(WorkflowError::Configuration(format!("unknown storage backend: {}", other)))
        }
    }
}

impl fmt::Display for StoreType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An open RocksDB database shared by every adapter over one path
///
/// Versioned writes read a document and then write a batch; holding
/// `write_lock` across both is what makes the check atomic with the write,
/// so the lock lives with the database rather than with any one adapter.
pub struct SharedDb {
    db:         DB,
    write_lock: tokio::sync::Mutex<()>
}

impl SharedDb {
    /// Serialise a read-check-write sequence against every other adapter on this database
    pub async fn lock_writes(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.write_lock.lock().await
    }
}

impl Deref for SharedDb {
    type Target = DB;

    fn deref(&self) -> &DB {
        &self.db
    }
}

/// Key prefix owning everything stored for `owner` under `namespace`
///
/// The owner is length-prefixed, so no owner's prefix is a prefix of
/// another's whatever bytes the owner contains.
pub(crate) fn scoped_prefix(namespace: &str, owner: &str) -> String {
    format!("{}\u{0}{}:{}\u{0}", namespace, owner.len(), owner)
}

/// Databases opened by this process, by path
///
/// RocksDB holds an exclusive lock per directory, so every adapter over one
/// path shares a single handle while any of them is alive.
static OPEN_DATABASES: Lazy<Mutex<HashMap<PathBuf, Weak<SharedDb>>>> = Lazy::new(|| Mutex::new(HashMap::new()));

/// Open (or share) the RocksDB database at `path`, creating it if missing
pub fn open_db(path: &Path) -> Result<Arc<SharedDb>, WorkflowError> {
    let mut open = OPEN_DATABASES
        .lock()
        .map_err(|_| WorkflowError::Storage("database registry poisoned".to_string()))?;
    if let Some(db) = open.get(path).and_then(Weak::upgrade) {
        return Ok(db);
    }

    std::fs::create_dir_all(path)?;
    let mut opts = Options::default();
    opts.create_if_missing(true);
    opts.set_compression_type(rocksdb::DBCompressionType::Snappy);
    let db = DB::open(&opts, path)
        .map(|db| Arc::new(SharedDb { db, write_lock: tokio::sync::Mutex::new(()) }))
        .map_err(|e| WorkflowError::Storage(format!("failed to open RocksDB at {}: {}", path.display(), e)))?;

    open.retain(|_, handle| handle.strong_count() > 0);
    open.insert(path.to_path_buf(), Arc::downgrade(&db));
    Ok(db)
}

/// The persistence collaborators of one engine instance
#[derive(Clone)]
pub struct Stores {
    pub state:       Arc<dyn ActorStateStorage>,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub journal:     Arc<dyn EventJournal>
}

/// Builds [`Stores`] for the configured backend
///
/// The journal is in-memory for every backend, `rocksdb` included: run
/// history survives a restart only through checkpoints.
pub struct StorageFactory;

impl StorageFactory {
    pub fn create(config: &StorageConfig) -> Result<Stores, WorkflowError> {
        let page_size = config.list_page_size;
        match config.backend {
            StoreType::InMemory => Ok(Stores {
                state:       Arc::new(InMemoryActorStateStorage::new(page_size)),
                checkpoints: Arc::new(InMemoryCheckpointStore::new()),
                journal:     Arc::new(InMemoryJournal::new())
            }),
            StoreType::RocksDb => {
                let db = open_db(&config.database_path()?)?;
                Ok(Stores {
                    state:       Arc::new(RocksDbActorStateStorage::from_db(db.clone(), page_size)),
                    checkpoints: Arc::new(RocksDbCheckpointStore::from_db(db)),
                    journal:     Arc::new(InMemoryJournal::new())
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        domain::{identity::ActorId, state::StateWriteOperation},
        port::storage::ActorStateStorage
    };

    #[test]
    fn test_store_type_parsing() {
        assert_eq!("rocksdb".parse::<StoreType>().unwrap(), StoreType::RocksDb);
        assert_eq!(StoreType::InMemory.to_string(), "inmemory");
        assert!(matches!("sqlite".parse::<StoreType>(), Err(WorkflowError::Configuration(_))));
    }

    #[test]
    fn test_open_db_shares_handle_per_path() {
        let dir = tempfile::tempdir().unwrap();
        let first = open_db(dir.path()).unwrap();
        let second = open_db(dir.path()).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_factory_backends_share_one_database() {
        let dir = tempfile::tempdir().unwrap();
        let config = StorageConfig { backend: StoreType::RocksDb, path: Some(dir.path().join("db")), list_page_size: 10 };

        let stores = StorageFactory::create(&config).unwrap();
        let actor = ActorId::new("counter", "a").unwrap();
        stores.state.write_state(&actor, &[StateWriteOperation::set("k", "v")], "0").await.unwrap();
        stores.checkpoints.save("run", "000000000001-x", b"blob".to_vec()).await.unwrap();

        let again = StorageFactory::create(&config).unwrap();
        assert_eq!(again.state.read_state(&actor, &[]).await.unwrap().version_tag, "1");
        assert_eq!(again.checkpoints.list("run").await.unwrap(), vec!["000000000001-x"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_factory_stores_race_first_write_on_shared_database() {
        let dir = tempfile::tempdir().unwrap();
        let config = StorageConfig { backend: StoreType::RocksDb, path: Some(dir.path().join("db")), list_page_size: 10 };
        let left = StorageFactory::create(&config).unwrap().state;
        let right = StorageFactory::create(&config).unwrap().state;

        for round in 0..50 {
            let actor = ActorId::new("counter", format!("race-{}", round)).unwrap();
            let mut writers = Vec::new();
            for (n, storage) in [left.clone(), right.clone(), left.clone(), right.clone()].into_iter().enumerate() {
                let actor = actor.clone();
                writers.push(tokio::spawn(async move {
                    storage.write_state(&actor, &[StateWriteOperation::set("winner", n.to_string())], "0").await.unwrap()
                }));
            }

            let mut successes = 0;
            for writer in writers {
                if writer.await.unwrap().success {
                    successes += 1;
                }
            }
            assert_eq!(successes, 1, "round {}", round);
            assert_eq!(left.read_state(&actor, &[]).await.unwrap().version_tag, "1");
        }
    }

    #[test]
    fn test_scoped_prefixes_never_nest() {
        let short = scoped_prefix("state", "t/a");
        let long = scoped_prefix("state", "t/a\u{0}key\u{0}z");
        assert!(!long.starts_with(&short));
        assert!(!short.starts_with(&long));
    }

    #[tokio::test]
    async fn test_factory_inmemory_default() {
        let stores = StorageFactory::create(&StorageConfig::default()).unwrap();
        assert!(stores.checkpoints.list("run").await.unwrap().is_empty());
    }
}
