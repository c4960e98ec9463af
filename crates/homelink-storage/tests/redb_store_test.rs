//! Tests for the redb-backed store.
//!
//! Tests include:
//! - Subtree reads after queued writes
//! - Subtree replacement and removal
//! - Persistence across reopen

use homelink_core::{RemoteStore, StorePath};
use homelink_storage::RedbStore;
use serde_json::{json, Map};

#[tokio::test]
async fn test_read_observes_queued_writes() {
    let dir = tempfile::tempdir().unwrap();
    let store = RedbStore::open(dir.path().join("tree.redb")).unwrap();

    store.set_value(&"devices/lookup/LAMP".into(), json!("k1"));
    store.set_value(&"devices/list/k1/topic".into(), json!("lamp"));
    store.set_value(&"devices/list/k1/ports/POWER/state".into(), json!("ON"));

    let lookup = store.read(&"devices/lookup/LAMP".into()).await.unwrap();
    assert_eq!(lookup, Some(json!("k1")));

    let list = store.read(&"devices/list".into()).await.unwrap();
    assert_eq!(
        list,
        Some(json!({"k1": {"topic": "lamp", "ports": {"POWER": {"state": "ON"}}}}))
    );

    store.close().await.unwrap();
}

#[tokio::test]
async fn test_set_replaces_subtree() {
    let dir = tempfile::tempdir().unwrap();
    let store = RedbStore::open(dir.path().join("tree.redb")).unwrap();

    store.set_value(&"a".into(), json!({"b": 1, "c": {"d": 2}}));
    store.set_value(&"a".into(), json!({"e": 3}));
    store.set_value(&"a-1".into(), json!("sibling"));

    assert_eq!(store.read(&"a".into()).await.unwrap(), Some(json!({"e": 3})));

    store.set_value(&"a".into(), serde_json::Value::Null);
    assert_eq!(store.read(&"a".into()).await.unwrap(), None);
    assert_eq!(
        store.read(&StorePath::root()).await.unwrap(),
        Some(json!({"a-1": "sibling"}))
    );

    store.close().await.unwrap();
}

#[tokio::test]
async fn test_update_children_keeps_siblings() {
    let dir = tempfile::tempdir().unwrap();
    let store = RedbStore::open(dir.path().join("tree.redb")).unwrap();

    store.set_value(&"devices/list/k1/topic".into(), json!("lamp"));
    let mut children = Map::new();
    children.insert("connected".to_string(), json!("OFFLINE"));
    children.insert("lastAccess".to_string(), json!(1_700_000_000_000_i64));
    store.update_children(&"devices/list/k1".into(), children);

    let device = store.read(&"devices/list/k1".into()).await.unwrap().unwrap();
    assert_eq!(device["topic"], json!("lamp"));
    assert_eq!(device["connected"], json!("OFFLINE"));

    store.close().await.unwrap();
}

#[tokio::test]
async fn test_persists_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("tree.redb");

    {
        let store = RedbStore::open(&path).unwrap();
        store.set_value(&"stats/wifiSignal/k1/1700000100000".into(), json!(-60));
        store.close().await.unwrap();
    }

    let store = RedbStore::open(&path).unwrap();
    assert_eq!(
        store.read(&"stats/wifiSignal/k1".into()).await.unwrap(),
        Some(json!({"1700000100000": -60}))
    );
    store.close().await.unwrap();

    // Writes after close are dropped, reads fail.
    store.set_value(&"x".into(), json!(1));
    assert!(store.read(&"x".into()).await.is_err());
}
