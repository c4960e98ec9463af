//! Tests for the device registry.
//!
//! Tests include:
//! - Stable id allocation and reuse
//! - Concurrent first sightings of one topic
//! - Bootstrap from persisted devices
//! - Identity kept across a restart on the redb store
//! - Inbound routing by namespace and channel
//! - Startup and shutdown sequencing

use std::sync::Arc;
use std::time::Duration;

use homelink_core::config::RegistrySettings;
use homelink_core::{BusMessage, MessageBus, RemoteStore};
use homelink_testing::RecordingBus;
use homelink_devices::{Connectivity, DeviceError, DeviceRegistry, PortState, RouteOutcome};
use homelink_storage::{MemoryStore, RedbStore};
use serde_json::json;

fn registry_with(store: Arc<MemoryStore>) -> (Arc<DeviceRegistry>, Arc<RecordingBus>) {
    let bus = Arc::new(RecordingBus::new());
    let registry = DeviceRegistry::new(
        bus.clone(),
        store,
        RegistrySettings::default(),
        Duration::from_secs(10),
    );
    (registry, bus)
}

#[tokio::test]
async fn test_first_sighting_allocates_and_persists_id() {
    let store = Arc::new(MemoryStore::new());
    let (registry, _bus) = registry_with(store.clone());

    let device = registry.get_device_by_topic("front-door-light-switch").await.unwrap();
    let id = device.id().to_string();

    assert_eq!(
        store.get("devices/lookup/FRONT-DOOR-LIGHT-SWITCH"),
        Some(json!(id))
    );
    assert_eq!(
        store.get(&format!("devices/list/{}/topic", id)),
        Some(json!("front-door-light-switch"))
    );

    // The lookup entry is written before any device metadata.
    let writes = store.writes();
    assert_eq!(writes[0].path.to_string(), "devices/lookup/FRONT-DOOR-LIGHT-SWITCH");

    let again = registry.get_device_by_topic("FRONT-DOOR-LIGHT-SWITCH").await.unwrap();
    assert!(Arc::ptr_eq(&device, &again));
    assert!(Arc::ptr_eq(
        &device,
        &registry.get_device_by_key(&id).unwrap()
    ));
}

#[tokio::test]
async fn test_existing_lookup_is_reused() {
    let store = Arc::new(MemoryStore::with_data(json!({
        "devices": {"lookup": {"LAMP": "k1"}}
    })));
    let (registry, _bus) = registry_with(store.clone());

    let device = registry.get_device_by_topic("lamp").await.unwrap();
    assert_eq!(device.id(), "k1");
    assert!(store.writes_under("devices/lookup").is_empty());
}

#[tokio::test]
async fn test_null_lookup_allocates() {
    let store = Arc::new(MemoryStore::with_data(json!({
        "devices": {"lookup": {"LAMP": "null"}}
    })));
    let (registry, _bus) = registry_with(store.clone());

    let device = registry.get_device_by_topic("lamp").await.unwrap();
    assert_ne!(device.id(), "null");
    assert_eq!(store.get("devices/lookup/LAMP"), Some(json!(device.id())));
}

#[tokio::test]
async fn test_get_device_by_key_never_creates() {
    let store = Arc::new(MemoryStore::new());
    let (registry, _bus) = registry_with(store.clone());

    assert!(registry.get_device_by_key("missing").is_none());
    assert_eq!(store.read_count(), 0);
    assert!(store.writes().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_first_sightings_share_one_id() {
    let store = Arc::new(MemoryStore::new());
    store.set_read_delay(Some(Duration::from_millis(50)));
    let (registry, _bus) = registry_with(store.clone());

    let mut handles = Vec::new();
    for _ in 0..50 {
        let registry = registry.clone();
        handles.push(tokio::spawn(async move {
            registry
                .get_device_by_topic("front-door-light-switch")
                .await
                .unwrap()
        }));
    }

    let mut devices = Vec::new();
    for handle in handles {
        devices.push(handle.await.unwrap());
    }

    let first = &devices[0];
    assert!(devices.iter().all(|d| Arc::ptr_eq(d, first)));
    assert_eq!(store.read_count(), 1);
    assert_eq!(store.writes_under("devices/lookup").len(), 1);
    assert_eq!(registry.devices().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_identity_timeout_can_be_retried() {
    let store = Arc::new(MemoryStore::new());
    store.set_offline(true);
    let (registry, _bus) = registry_with(store.clone());

    let err = registry.get_device_by_topic("lamp").await.unwrap_err();
    assert!(matches!(err, DeviceError::IdentityTimeout { .. }));
    assert!(registry.devices().is_empty());
    assert!(store.writes().is_empty());

    store.set_offline(false);
    let device = registry.get_device_by_topic("lamp").await.unwrap();
    assert_eq!(store.get("devices/lookup/LAMP"), Some(json!(device.id())));
}

#[tokio::test]
async fn test_invalid_topic_rejected() {
    let store = Arc::new(MemoryStore::new());
    let (registry, _bus) = registry_with(store);

    assert!(matches!(
        registry.get_device_by_topic("  ").await,
        Err(DeviceError::InvalidTopic(_))
    ));
}

#[tokio::test]
async fn test_bootstrap_restores_devices() {
    let store = Arc::new(MemoryStore::with_data(json!({
        "devices": {
            "lookup": {"LAMP": "k1", "HEATER": "k2"},
            "list": {
                "k1": {"topic": "lamp", "connected": "ONLINE"},
                "k2": {"connected": "OFFLINE"}
            }
        }
    })));
    let (registry, _bus) = registry_with(store.clone());

    assert_eq!(registry.bootstrap().await.unwrap(), 2);
    let lamp = registry.get_device_by_key("k1").unwrap();
    assert_eq!(lamp.connected(), Connectivity::Online);
    let heater = registry.get_device_by_key("k2").unwrap();
    assert!(heater.topic().is_none());
    assert!(store.writes().is_empty());

    // Known topic resolves without touching the store.
    let reads = store.read_count();
    let resolved = registry.get_device_by_topic("lamp").await.unwrap();
    assert!(Arc::ptr_eq(&lamp, &resolved));
    assert_eq!(store.read_count(), reads);

    // A device restored without a topic is reused when its topic shows up.
    let resolved = registry.get_device_by_topic("heater").await.unwrap();
    assert!(Arc::ptr_eq(&heater, &resolved));
    assert_eq!(store.get("devices/list/k2/topic"), Some(json!("heater")));
}

#[tokio::test]
async fn test_identity_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("homelink.redb");

    let id = {
        let store = Arc::new(RedbStore::open(&path).unwrap());
        let registry = DeviceRegistry::new(
            Arc::new(RecordingBus::new()),
            store.clone(),
            RegistrySettings::default(),
            Duration::from_secs(10),
        );
        let outcome = registry
            .route(&BusMessage::new("stat/Lamp/RESULT", r#"{"POWER":"ON"}"#))
            .await
            .unwrap();
        let RouteOutcome::Status { device, .. } = outcome else {
            panic!("expected a status outcome");
        };
        store.close().await.unwrap();
        device
    };

    let store = Arc::new(RedbStore::open(&path).unwrap());
    let registry = DeviceRegistry::new(
        Arc::new(RecordingBus::new()),
        store.clone(),
        RegistrySettings::default(),
        Duration::from_secs(10),
    );
    assert_eq!(registry.bootstrap().await.unwrap(), 1);
    let restored = registry.get_device_by_key(&id).unwrap();
    assert_eq!(restored.wire_topic().as_deref(), Some("Lamp"));

    let resolved = registry.get_device_by_topic("LAMP").await.unwrap();
    assert!(Arc::ptr_eq(&restored, &resolved));
    let state_path = format!("devices/list/{}/ports/POWER/state", id);
    assert_eq!(
        store.read(&state_path.as_str().into()).await.unwrap(),
        Some(json!("ON"))
    );
    store.close().await.unwrap();
}

#[tokio::test]
async fn test_bootstrap_empty_store() {
    let store = Arc::new(MemoryStore::new());
    let (registry, _bus) = registry_with(store);
    assert_eq!(registry.bootstrap().await.unwrap(), 0);
}

#[tokio::test]
async fn test_route_status_report() {
    let store = Arc::new(MemoryStore::new());
    let (registry, _bus) = registry_with(store.clone());

    let before = chrono::Utc::now().timestamp();
    let outcome = registry
        .route(&BusMessage::new(
            "stat/lamp/RESULT",
            r#"{"POWER1":"ON","WIFI":{"Signal":-60}}"#,
        ))
        .await
        .unwrap();
    let after = chrono::Utc::now().timestamp();

    let RouteOutcome::Status { device, update } = outcome else {
        panic!("expected a status outcome");
    };
    assert_eq!(update.signal, Some(-60));

    let lamp = registry.get_device_by_key(&device).unwrap();
    assert_eq!(lamp.port_state("POWER1"), PortState::On);
    assert_eq!(
        store.get(&format!("devices/list/{}/ports/POWER1/state", device)),
        Some(json!("ON"))
    );
    assert_eq!(
        store.get(&format!("devices/list/{}/wifi/signal", device)),
        Some(json!(-60))
    );

    let series = store
        .get(&format!("stats/wifiSignal/{}", device))
        .unwrap();
    let series = series.as_object().unwrap();
    assert_eq!(series.len(), 1);
    let (bucket, signal) = series.iter().next().unwrap();
    let bucket: i64 = bucket.parse().unwrap();
    assert_eq!(signal, &json!(-60));
    assert_eq!(bucket % 900_000, 0);
    assert!(bucket >= (before - before % 900) * 1000);
    assert!(bucket <= (after - after % 900) * 1000);
}

#[tokio::test]
async fn test_identical_reports_write_state_once() {
    let store = Arc::new(MemoryStore::new());
    let (registry, bus) = registry_with(store.clone());
    let message = BusMessage::new("stat/lamp/RESULT", r#"{"POWER":"ON"}"#);

    registry.route(&message).await.unwrap();
    registry.route(&message).await.unwrap();

    let lamp = registry.get_device_by_topic("lamp").await.unwrap();
    let state_path = format!("devices/list/{}/ports/POWER/state", lamp.id());
    assert_eq!(store.writes_under(&state_path).len(), 1);
    assert!(bus.published().is_empty());
}

#[tokio::test]
async fn test_unknown_state_is_written_through() {
    let store = Arc::new(MemoryStore::new());
    let (registry, _bus) = registry_with(store.clone());

    registry
        .route(&BusMessage::new("stat/lamp/RESULT", r#"{"POWER":"ON"}"#))
        .await
        .unwrap();
    registry
        .route(&BusMessage::new("stat/lamp/RESULT", r#"{"POWER":"BLINK"}"#))
        .await
        .unwrap();

    let lamp = registry.get_device_by_topic("lamp").await.unwrap();
    assert_eq!(lamp.port_state("POWER"), PortState::Unknown);
    assert_eq!(
        store.get(&format!("devices/list/{}/ports/POWER/state", lamp.id())),
        Some(json!("UNKNOWN"))
    );
}

#[tokio::test]
async fn test_malformed_status_changes_nothing() {
    let store = Arc::new(MemoryStore::new());
    let (registry, _bus) = registry_with(store.clone());

    let result = registry
        .route(&BusMessage::new("stat/lamp/RESULT", "not json"))
        .await;
    assert!(matches!(result, Err(DeviceError::Decode(_))));
    assert!(registry.devices().is_empty());
    assert!(store.writes().is_empty());
}

#[tokio::test]
async fn test_route_last_will() {
    let store = Arc::new(MemoryStore::new());
    let (registry, _bus) = registry_with(store.clone());

    let outcome = registry
        .route(&BusMessage::new("tele/lamp/LWT", "Online"))
        .await
        .unwrap();
    let RouteOutcome::Connectivity {
        device,
        state,
        changed,
    } = outcome
    else {
        panic!("expected a connectivity outcome");
    };
    assert_eq!(state, Connectivity::Online);
    assert!(changed);
    assert_eq!(
        store.get(&format!("devices/list/{}/connected", device)),
        Some(json!("ONLINE"))
    );
    assert!(store
        .get(&format!("devices/list/{}/lastAccess", device))
        .is_some());
}

#[tokio::test]
async fn test_ignored_and_unprocessed_topics() {
    let store = Arc::new(MemoryStore::new());
    let (registry, _bus) = registry_with(store.clone());

    for topic in ["tele/lamp/STATE", "stat/lamp/POWER", "cmnd/lamp/POWER", "tele/lamp/SENSOR"] {
        let outcome = registry
            .route(&BusMessage::new(topic, r#"{"POWER":"ON"}"#))
            .await
            .unwrap();
        assert!(matches!(outcome, RouteOutcome::Ignored), "{}", topic);
    }

    for topic in ["homeassistant/lamp/config", "lamp"] {
        let outcome = registry.route(&BusMessage::new(topic, "x")).await.unwrap();
        assert!(matches!(outcome, RouteOutcome::Unprocessed), "{}", topic);
    }

    assert!(registry.devices().is_empty());
    assert!(store.writes().is_empty());
}

#[tokio::test]
async fn test_request_device_status_tolerates_failures() {
    let store = Arc::new(MemoryStore::with_data(json!({
        "devices": {"list": {
            "k1": {"topic": "lamp"},
            "k2": {"topic": "heater"}
        }}
    })));
    let (registry, bus) = registry_with(store);
    registry.bootstrap().await.unwrap();

    assert_eq!(registry.request_device_status(), 2);
    let mut topics: Vec<_> = bus.published().into_iter().map(|p| p.topic).collect();
    topics.sort();
    assert_eq!(topics, vec!["cmnd/heater/STATE", "cmnd/lamp/STATE"]);
    assert!(bus.published().iter().all(|p| p.payload.is_empty() && p.retain));

    bus.set_reject_publish(true);
    assert_eq!(registry.request_device_status(), 0);
}

#[tokio::test]
async fn test_initiate_then_close() {
    let store = Arc::new(MemoryStore::with_data(json!({
        "devices": {"list": {"k1": {"topic": "lamp"}}}
    })));
    let (registry, bus) = registry_with(store.clone());
    let (tx, rx) = tokio::sync::mpsc::channel(16);

    registry.initiate(rx, &["#".to_string()]).await.unwrap();
    assert_eq!(bus.subscriptions(), vec!["#".to_string()]);
    assert_eq!(bus.published_to("cmnd/lamp/STATE").len(), 1);

    tx.send(BusMessage::new("tele/lamp/LWT", "Offline")).await.unwrap();
    tx.send(BusMessage::new("stat/lamp/RESULT", r#"{"POWER":"OFF"}"#))
        .await
        .unwrap();

    let lamp = registry.get_device_by_key("k1").unwrap();
    for _ in 0..100 {
        if lamp.port_state("POWER") == PortState::Off {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(lamp.connected(), Connectivity::Offline);
    assert_eq!(lamp.port_state("POWER"), PortState::Off);

    registry.close().await;
    assert_eq!(bus.disconnect_count(), 1);
    assert!(registry.supervisor_stats().is_none());
    store.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_supervisor_recovers_lost_session() {
    let store = Arc::new(MemoryStore::new());
    let (registry, bus) = registry_with(store);
    let (_tx, rx) = tokio::sync::mpsc::channel(16);

    registry.initiate(rx, &[]).await.unwrap();
    let stats = registry.supervisor_stats().unwrap();

    bus.set_connected(false);
    bus.set_reconnect_restores(true);
    tokio::time::sleep(Duration::from_millis(1_500)).await;
    assert_eq!(bus.reconnect_count(), 1);
    assert!(bus.is_connected());

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(stats.recoveries(), 1);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(stats.recoveries(), 1);
    assert_eq!(bus.reconnect_count(), 1);

    registry.close().await;
}
