//! Redb store backend.
//!
//! Provides persistent storage using the redb embedded database. The tree is
//! stored flattened: one row per leaf, keyed by its full slash path, holding
//! the JSON-encoded leaf value. A single worker thread owns the database and
//! applies operations in the order they were queued, so reads always observe
//! earlier writes.

use std::path::Path;
use std::thread::JoinHandle;

use async_trait::async_trait;
use homelink_core::storage::Result;
use homelink_core::{RemoteStore, StoreError, StorePath};
use parking_lot::Mutex;
use redb::{Database, ReadableTable, TableDefinition};
use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot};

use crate::tree;

// Format: "devices/list/<id>/topic" -> JSON bytes
const TREE_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("tree");

/// Configuration for RedbStore.
#[derive(Debug, Clone)]
pub struct RedbStoreConfig {
    /// Path to the database file.
    pub path: String,

    /// Create parent directories if they don't exist.
    pub create_dirs: bool,
}

impl RedbStoreConfig {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            create_dirs: true,
        }
    }

    pub fn with_create_dirs(mut self, create_dirs: bool) -> Self {
        self.create_dirs = create_dirs;
        self
    }
}

enum Op {
    Set(StorePath, Value),
    Update(StorePath, Map<String, Value>),
    Read(StorePath, oneshot::Sender<Result<Option<Value>>>),
    Close(oneshot::Sender<()>),
}

/// redb-based persistent store.
pub struct RedbStore {
    tx: mpsc::UnboundedSender<Op>,
    path: String,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl RedbStore {
    /// Open or create the database and start its worker thread.
    pub fn new(config: RedbStoreConfig) -> Result<Self> {
        let path_ref = Path::new(&config.path);
        if config.create_dirs {
            if let Some(parent) = path_ref.parent() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let db = Database::create(path_ref).map_err(backend)?;

        // Make sure the table exists so read transactions can open it.
        let txn = db.begin_write().map_err(backend)?;
        txn.open_table(TREE_TABLE).map_err(backend)?;
        txn.commit().map_err(backend)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let worker = std::thread::Builder::new()
            .name("homelink-store".to_string())
            .spawn(move || run_worker(db, rx))?;

        tracing::debug!("Opened redb store at {}", config.path);

        Ok(Self {
            tx,
            path: config.path,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Open or create a store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::new(RedbStoreConfig::new(
            path.as_ref().to_string_lossy().to_string(),
        ))
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn enqueue(&self, op: Op) {
        if self.tx.send(op).is_err() {
            tracing::warn!("Store {} is closed, dropping write", self.path);
        }
    }
}

#[async_trait]
impl RemoteStore for RedbStore {
    fn set_value(&self, path: &StorePath, value: Value) {
        self.enqueue(Op::Set(path.clone(), value));
    }

    fn update_children(&self, path: &StorePath, children: Map<String, Value>) {
        self.enqueue(Op::Update(path.clone(), children));
    }

    async fn read(&self, path: &StorePath) -> Result<Option<Value>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Op::Read(path.clone(), reply))
            .map_err(|_| StoreError::Closed)?;
        rx.await.map_err(|_| StoreError::Closed)?
    }

    fn generate_key(&self) -> String {
        crate::new_key()
    }

    async fn close(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Op::Close(reply)).is_ok() {
            let _ = rx.await;
        }
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            tokio::task::spawn_blocking(move || worker.join())
                .await
                .map_err(|e| StoreError::Backend(format!("Task join error: {}", e)))?
                .map_err(|_| StoreError::Backend("Store worker panicked".to_string()))?;
        }
        Ok(())
    }

    fn is_persistent(&self) -> bool {
        true
    }
}

fn backend<E: std::fmt::Display>(e: E) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn run_worker(db: Database, mut rx: mpsc::UnboundedReceiver<Op>) {
    while let Some(op) = rx.blocking_recv() {
        match op {
            Op::Set(path, value) => {
                if let Err(e) = write_subtrees(&db, vec![(path.clone(), value)]) {
                    tracing::warn!("Failed to write {}: {}", path, e);
                }
            }
            Op::Update(path, children) => {
                let items = children
                    .into_iter()
                    .map(|(key, value)| (path.child(&key), value))
                    .collect();
                if let Err(e) = write_subtrees(&db, items) {
                    tracing::warn!("Failed to update {}: {}", path, e);
                }
            }
            Op::Read(path, reply) => {
                let _ = reply.send(read_subtree(&db, &path));
            }
            Op::Close(reply) => {
                let _ = reply.send(());
                break;
            }
        }
    }
    tracing::debug!("Store worker stopped");
}

/// Key prefix selecting `path` and everything below it.
fn key_of(path: &StorePath) -> String {
    path.to_string()
}

fn is_within(key: &str, base: &str) -> bool {
    base.is_empty()
        || key == base
        || (key.starts_with(base) && key.as_bytes().get(base.len()) == Some(&b'/'))
}

/// Replace each subtree in one transaction.
fn write_subtrees(db: &Database, items: Vec<(StorePath, Value)>) -> Result<()> {
    let txn = db.begin_write().map_err(backend)?;
    {
        let mut table = txn.open_table(TREE_TABLE).map_err(backend)?;
        for (path, value) in items {
            let base = key_of(&path);
            let stale: Vec<String> = table
                .range(base.as_str()..)
                .map_err(backend)?
                .map_while(|item| item.ok())
                .map(|(key, _)| key.value().to_string())
                .take_while(|key| key.starts_with(&base))
                .filter(|key| is_within(key, &base))
                .collect();
            for key in stale {
                table.remove(key.as_str()).map_err(backend)?;
            }
            for (leaf, leaf_value) in tree::flatten(&path, &value) {
                let bytes = serde_json::to_vec(&leaf_value)?;
                table
                    .insert(key_of(&leaf).as_str(), bytes.as_slice())
                    .map_err(backend)?;
            }
        }
    }
    txn.commit().map_err(backend)?;
    Ok(())
}

fn read_subtree(db: &Database, path: &StorePath) -> Result<Option<Value>> {
    let txn = db.begin_read().map_err(backend)?;
    let table = txn.open_table(TREE_TABLE).map_err(backend)?;
    let base = key_of(path);

    let mut leaves = Vec::new();
    for item in table.range(base.as_str()..).map_err(backend)? {
        let (key, value) = item.map_err(backend)?;
        let key = key.value();
        if !key.starts_with(&base) {
            break;
        }
        if !is_within(key, &base) {
            continue;
        }
        let leaf: Value = serde_json::from_slice(value.value())?;
        leaves.push((StorePath::new(key), leaf));
    }
    Ok(tree::assemble(path, leaves))
}
