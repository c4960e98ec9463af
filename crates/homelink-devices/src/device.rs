//! A physical switch device addressed by its bus topic.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use homelink_core::config::RegistrySettings;
use homelink_core::{BusError, MessageBus, QoS, RemoteStore, StorePath};
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Map, Value};

use crate::error::{DeviceError, DispatchFailure, Result};
use crate::port::{NodeId, PortDispatcher, PortGraph, PortState, Power, StateChange};
use crate::topic::canonical;

/// Store layout.
pub mod paths {
    use homelink_core::StorePath;

    pub const DEVICES: &str = "devices";
    pub const LOOKUP: &str = "devices/lookup";
    pub const LIST: &str = "devices/list";
    pub const WIFI_SIGNAL_STATS: &str = "stats/wifiSignal";
    pub const CONTROL_UNITS: &str = "controlUnits";

    /// `devices/lookup/<TOPIC>`
    pub fn lookup(canonical_topic: &str) -> StorePath {
        StorePath::new(LOOKUP).child(canonical_topic)
    }

    pub fn device_list() -> StorePath {
        StorePath::new(LIST)
    }

    /// `devices/list/<id>`
    pub fn device(id: &str) -> StorePath {
        StorePath::new(LIST).child(id)
    }

    /// `devices/list/<id>/ports/<PORT>`
    pub fn port(id: &str, port: &str) -> StorePath {
        device(id).child("ports").child(port)
    }

    /// `controlUnits/<NAME>`
    pub fn control_unit(name: &str) -> StorePath {
        StorePath::new(CONTROL_UNITS).child(name)
    }
}

/// Width of a signal-strength statistics bucket.
pub const SIGNAL_BUCKET_SECS: i64 = 15 * 60;

/// Start of the statistics bucket containing `at`, in epoch milliseconds.
pub fn signal_bucket(at: DateTime<Utc>) -> i64 {
    let secs = at.timestamp();
    (secs - secs.rem_euclid(SIGNAL_BUCKET_SECS)) * 1000
}

/// Last-will connectivity of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Connectivity {
    #[default]
    Unknown,
    Online,
    Offline,
}

impl Connectivity {
    pub fn parse(token: &str) -> Self {
        let token = token.trim();
        if token.eq_ignore_ascii_case("ONLINE") {
            Connectivity::Online
        } else if token.eq_ignore_ascii_case("OFFLINE") {
            Connectivity::Offline
        } else {
            Connectivity::Unknown
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Connectivity::Unknown => "UNKNOWN",
            Connectivity::Online => "ONLINE",
            Connectivity::Offline => "OFFLINE",
        }
    }
}

impl fmt::Display for Connectivity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decoded status report.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusReport {
    /// `(port, token)` for every `POWER*` key, sorted by port name.
    pub power: Vec<(String, String)>,
    /// `WIFI.Signal`, when present.
    pub signal: Option<i64>,
}

impl StatusReport {
    /// Decode a status payload. The payload must be a JSON object.
    pub fn decode(payload: &str) -> Result<Self> {
        let value: Value =
            serde_json::from_str(payload).map_err(|e| DeviceError::Decode(e.to_string()))?;
        let Value::Object(fields) = value else {
            return Err(DeviceError::Decode(format!(
                "expected a JSON object, got {}",
                payload
            )));
        };

        let mut report = StatusReport::default();
        for (key, value) in fields {
            let upper = key.to_uppercase();
            if upper.starts_with("POWER") {
                let token = match value {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                report.power.push((upper, token));
            } else if upper == "WIFI" {
                report.signal = value.as_object().and_then(|wifi| {
                    wifi.iter()
                        .find(|(k, _)| k.eq_ignore_ascii_case("Signal"))
                        .and_then(|(_, v)| v.as_i64())
                });
            }
        }
        report.power.sort();
        Ok(report)
    }
}

/// Result of applying a status report.
#[derive(Debug, Default)]
pub struct StatusUpdate {
    pub ports: Vec<(String, StateChange)>,
    pub signal: Option<i64>,
    /// Propagation errors raised by external changes.
    pub errors: Vec<DeviceError>,
}

/// Shared handles every device needs.
#[derive(Clone)]
pub struct DeviceContext {
    pub graph: Arc<PortGraph>,
    pub bus: Arc<dyn MessageBus>,
    pub store: Arc<dyn RemoteStore>,
    pub settings: Arc<RegistrySettings>,
}

#[derive(Debug, Clone)]
struct DeviceTopic {
    canonical: String,
    /// As announced on the bus; command topics are case-sensitive.
    wire: String,
}

/// A bus-addressable switch with one or more ports.
pub struct Device {
    id: String,
    topic: RwLock<Option<DeviceTopic>>,
    ports: Mutex<HashMap<String, NodeId>>,
    connected: RwLock<Connectivity>,
    last_access: RwLock<Option<DateTime<Utc>>>,
    ctx: DeviceContext,
    me: Weak<Device>,
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id)
            .field("topic", &self.topic())
            .field("connected", &self.connected())
            .finish()
    }
}

impl Device {
    /// Create a device with no known topic.
    pub fn new(id: impl Into<String>, ctx: DeviceContext) -> Arc<Self> {
        let id = id.into();
        Arc::new_cyclic(|me| Device {
            id,
            topic: RwLock::new(None),
            ports: Mutex::new(HashMap::new()),
            connected: RwLock::new(Connectivity::Unknown),
            last_access: RwLock::new(None),
            ctx,
            me: me.clone(),
        })
    }

    /// Rebuild a device from its persisted entry without writing anything.
    pub fn restore(id: impl Into<String>, entry: &Value, ctx: DeviceContext) -> Arc<Self> {
        let device = Self::new(id, ctx);
        if let Some(topic) = entry.get("topic").and_then(Value::as_str) {
            device.replace_topic(topic);
        }
        if let Some(connected) = entry.get("connected").and_then(Value::as_str) {
            *device.connected.write() = Connectivity::parse(connected);
        }
        if let Some(ms) = entry.get("lastAccess").and_then(Value::as_i64) {
            *device.last_access.write() = DateTime::from_timestamp_millis(ms);
        }
        device
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Canonical (upper-case) topic.
    pub fn topic(&self) -> Option<String> {
        self.topic.read().as_ref().map(|t| t.canonical.clone())
    }

    /// Topic as used on the bus.
    pub fn wire_topic(&self) -> Option<String> {
        self.topic.read().as_ref().map(|t| t.wire.clone())
    }

    pub fn connected(&self) -> Connectivity {
        *self.connected.read()
    }

    pub fn last_access(&self) -> Option<DateTime<Utc>> {
        *self.last_access.read()
    }

    pub fn store_path(&self) -> StorePath {
        paths::device(&self.id)
    }

    /// Record the bus topic. Persists only when it changes.
    pub fn set_topic(&self, topic: &str) {
        if self.replace_topic(topic) {
            self.ctx
                .store
                .set_value(&self.store_path().child("topic"), json!(topic.trim()));
        }
    }

    fn replace_topic(&self, topic: &str) -> bool {
        let wire = topic.trim();
        let mut current = self.topic.write();
        if current.as_ref().is_some_and(|t| t.wire == wire) {
            return false;
        }
        *current = Some(DeviceTopic {
            canonical: canonical(wire),
            wire: wire.to_string(),
        });
        true
    }

    /// Node for a port, created on first use.
    pub fn get_port(&self, name: &str) -> NodeId {
        let name = canonical(name);
        let mut ports = self.ports.lock();
        if let Some(id) = ports.get(&name) {
            return *id;
        }
        let dispatcher: Weak<dyn PortDispatcher> = self.me.clone();
        let id = self.ctx.graph.add_node(
            &name,
            Some(paths::port(&self.id, &name)),
            Some(dispatcher),
        );
        ports.insert(name, id);
        id
    }

    /// Ports created so far, sorted by name.
    pub fn ports(&self) -> Vec<(String, NodeId)> {
        let mut ports: Vec<_> = self
            .ports
            .lock()
            .iter()
            .map(|(name, id)| (name.clone(), *id))
            .collect();
        ports.sort();
        ports
    }

    pub fn port_state(&self, name: &str) -> PortState {
        self.ctx.graph.state(self.get_port(name))
    }

    /// Command a port and everything that mirrors it.
    pub fn set_power(&self, port: &str, command: Power) -> Result<crate::port::Propagation> {
        self.ctx.graph.set_power(self.get_port(port), command)
    }

    /// Publish a command to `<namespace>/<topic>/<target>`.
    pub fn send(&self, target: &str, payload: &str) -> std::result::Result<(), DispatchFailure> {
        let namespace = &self.ctx.settings.command_namespace;
        let Some(topic) = self.wire_topic() else {
            return Err(DispatchFailure {
                address: format!("{}/<{}>/{}", namespace, self.id, target),
                payload: payload.to_string(),
                source: BusError::Publish {
                    topic: String::new(),
                    reason: "device topic is unknown".to_string(),
                },
            });
        };
        let address = format!("{}/{}/{}", namespace, topic, target);

        if !self.ctx.bus.is_connected() {
            return Err(DispatchFailure {
                address,
                payload: payload.to_string(),
                source: BusError::NotConnected,
            });
        }

        tracing::debug!("Sending {} '{}'", address, payload);
        self.ctx
            .bus
            .publish(&address, payload.as_bytes(), QoS::AtMostOnce, true)
            .map_err(|source| DispatchFailure {
                address,
                payload: payload.to_string(),
                source,
            })
    }

    /// Ask the device to publish its full state.
    pub fn request_status(&self) -> std::result::Result<(), DispatchFailure> {
        let directive = self.ctx.settings.status_directive.clone();
        self.send(&directive, "")
    }

    /// Apply a JSON status payload.
    pub fn update_status(&self, payload: &str) -> Result<StatusUpdate> {
        let report = StatusReport::decode(payload)?;
        Ok(self.apply_status(&report, Utc::now()))
    }

    /// Apply a decoded status report observed at `now`.
    pub fn apply_status(&self, report: &StatusReport, now: DateTime<Utc>) -> StatusUpdate {
        let mut update = StatusUpdate::default();

        for (port, token) in &report.power {
            match self.ctx.graph.set_state(self.get_port(port), token) {
                Ok(change) => update.ports.push((port.clone(), change)),
                Err(e) => {
                    tracing::warn!("Propagating {} of {} failed: {}", port, self.id, e);
                    update.errors.push(e);
                }
            }
        }

        if let Some(signal) = report.signal {
            self.record_signal(signal, now);
            update.signal = Some(signal);
        }

        update
    }

    fn record_signal(&self, signal: i64, now: DateTime<Utc>) {
        let store = &self.ctx.store;
        store.set_value(&self.store_path().child("wifi/signal"), json!(signal));
        let bucket = StorePath::new(paths::WIFI_SIGNAL_STATS)
            .child(&self.id)
            .child(&signal_bucket(now).to_string());
        store.set_value(&bucket, json!(signal));
    }

    /// Apply a last-will token. Returns true when connectivity changed.
    pub fn set_connected(&self, token: &str) -> bool {
        self.set_connected_at(token, Utc::now())
    }

    pub fn set_connected_at(&self, token: &str, now: DateTime<Utc>) -> bool {
        let state = Connectivity::parse(token);
        {
            let mut connected = self.connected.write();
            if *connected == state {
                return false;
            }
            *connected = state;
        }
        *self.last_access.write() = Some(now);

        tracing::info!("Device {} is {}", self.id, state);
        let mut children = Map::new();
        children.insert("connected".to_string(), json!(state.as_str()));
        children.insert("lastAccess".to_string(), json!(now.timestamp_millis()));
        self.ctx.store.update_children(&self.store_path(), children);
        true
    }

    /// Release the device. Nothing is held beyond shared handles.
    pub fn close(&self) {
        tracing::debug!("Closed device {}", self.id);
    }
}

impl PortDispatcher for Device {
    fn dispatch(&self, port: &str, command: Power) -> std::result::Result<(), DispatchFailure> {
        self.send(port, command.as_str())
    }
}
