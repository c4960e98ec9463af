//! In-memory store backend.
//!
//! Holds the whole tree in a single JSON value. Every write is also appended
//! to a log so callers can assert on what was persisted and in which order.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use homelink_core::storage::Result;
use homelink_core::{RemoteStore, StorePath};
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};

use crate::tree;

/// One recorded write.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreWrite {
    pub path: StorePath,
    pub value: Value,
}

/// Non-persistent store backed by a JSON tree.
#[derive(Default)]
pub struct MemoryStore {
    root: RwLock<Value>,
    writes: Mutex<Vec<StoreWrite>>,
    reads: AtomicUsize,
    read_delay: Mutex<Option<Duration>>,
    offline: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-populated with `data` at the root.
    pub fn with_data(data: Value) -> Self {
        let store = Self::new();
        *store.root.write() = data;
        store
    }

    /// Delay every read by `delay`.
    pub fn set_read_delay(&self, delay: Option<Duration>) {
        *self.read_delay.lock() = delay;
    }

    /// While offline, reads never complete (writes are still applied).
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Value at `path` without going through the async read path.
    pub fn get(&self, path: &str) -> Option<Value> {
        tree::get(&self.root.read(), &StorePath::new(path)).cloned()
    }

    /// Copy of the whole tree.
    pub fn snapshot(&self) -> Value {
        self.root.read().clone()
    }

    /// Every write in issue order.
    pub fn writes(&self) -> Vec<StoreWrite> {
        self.writes.lock().clone()
    }

    /// Writes at or below `path`.
    pub fn writes_under(&self, path: &str) -> Vec<StoreWrite> {
        let base = StorePath::new(path);
        self.writes
            .lock()
            .iter()
            .filter(|w| w.path.starts_with(&base))
            .cloned()
            .collect()
    }

    /// Number of reads issued.
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    fn apply(&self, path: &StorePath, value: Value) {
        self.writes.lock().push(StoreWrite {
            path: path.clone(),
            value: value.clone(),
        });
        tree::set(&mut self.root.write(), path, value);
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    fn set_value(&self, path: &StorePath, value: Value) {
        self.apply(path, value);
    }

    fn update_children(&self, path: &StorePath, children: Map<String, Value>) {
        for (key, value) in children {
            self.apply(&path.child(&key), value);
        }
    }

    async fn read(&self, path: &StorePath) -> Result<Option<Value>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let delay = *self.read_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.offline.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        Ok(tree::get(&self.root.read(), path).cloned())
    }

    fn generate_key(&self) -> String {
        crate::new_key()
    }

    fn is_persistent(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_write_then_read() {
        let store = MemoryStore::new();
        store.set_value(&"devices/lookup/LAMP".into(), json!("k1"));

        let value = store.read(&"devices/lookup/LAMP".into()).await.unwrap();
        assert_eq!(value, Some(json!("k1")));
        assert_eq!(store.read_count(), 1);
        assert_eq!(store.writes().len(), 1);
    }

    #[tokio::test]
    async fn test_update_children_merges() {
        let store = MemoryStore::with_data(json!({"devices": {"list": {"k1": {"topic": "lamp"}}}}));
        let mut children = Map::new();
        children.insert("connected".to_string(), json!("ONLINE"));
        store.update_children(&"devices/list/k1".into(), children);

        assert_eq!(
            store.get("devices/list/k1"),
            Some(json!({"topic": "lamp", "connected": "ONLINE"}))
        );
        assert_eq!(store.writes_under("devices/list/k1").len(), 1);
    }

    #[tokio::test]
    async fn test_offline_read_times_out() {
        let store = MemoryStore::new();
        store.set_offline(true);
        let result = homelink_core::storage::read_with_timeout(
            &store,
            &"devices/list".into(),
            Duration::from_millis(20),
        )
        .await;
        assert!(matches!(
            result,
            Err(homelink_core::StoreError::Timeout { .. })
        ));
    }

    #[test]
    fn test_generated_keys_are_unique() {
        let store = MemoryStore::new();
        assert_ne!(store.generate_key(), store.generate_key());
    }
}
