//! Device registry and inbound message router.
//!
//! The registry owns every known [`Device`], keyed both by canonical topic
//! and by stable id. Topics are resolved to stable ids through the store's
//! lookup table; concurrent first sightings of the same topic share one
//! resolution so a topic is never bound to two ids.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use homelink_core::config::RegistrySettings;
use homelink_core::storage::read_with_timeout;
use homelink_core::{BusMessage, MessageBus, QoS, RemoteStore, StoreError};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, OnceCell};
use tokio::task::JoinHandle;

use crate::device::{paths, Connectivity, Device, DeviceContext, StatusReport, StatusUpdate};
use crate::error::{DeviceError, Result};
use crate::port::PortGraph;
use crate::supervisor::{ConnectionSupervisor, SupervisorStats};
use crate::topic::{canonical, channels, Namespace, TopicParts};

/// What happened to an inbound message.
#[derive(Debug)]
pub enum RouteOutcome {
    /// Status report applied to a device.
    Status { device: String, update: StatusUpdate },
    /// Last-will notice applied to a device.
    Connectivity {
        device: String,
        state: Connectivity,
        changed: bool,
    },
    /// Recognised but deliberately not handled.
    Ignored,
    /// Not understood.
    Unprocessed,
}

/// Registry of devices reachable over the bus.
pub struct DeviceRegistry {
    ctx: DeviceContext,
    read_timeout: Duration,
    by_topic: DashMap<String, Arc<Device>>,
    by_id: DashMap<String, Arc<Device>>,
    pending: DashMap<String, Arc<OnceCell<Arc<Device>>>>,
    supervisor: Mutex<Option<ConnectionSupervisor>>,
    delivery: Mutex<Option<JoinHandle<()>>>,
}

impl DeviceRegistry {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        store: Arc<dyn RemoteStore>,
        settings: RegistrySettings,
        read_timeout: Duration,
    ) -> Arc<Self> {
        let ctx = DeviceContext {
            graph: Arc::new(PortGraph::new(store.clone())),
            bus,
            store,
            settings: Arc::new(settings),
        };
        Arc::new(Self {
            ctx,
            read_timeout,
            by_topic: DashMap::new(),
            by_id: DashMap::new(),
            pending: DashMap::new(),
            supervisor: Mutex::new(None),
            delivery: Mutex::new(None),
        })
    }

    pub fn graph(&self) -> Arc<PortGraph> {
        self.ctx.graph.clone()
    }

    /// Device by stable id. Never touches the store.
    pub fn get_device_by_key(&self, id: &str) -> Option<Arc<Device>> {
        self.by_id.get(id).map(|d| d.value().clone())
    }

    /// Known devices, sorted by id.
    pub fn devices(&self) -> Vec<Arc<Device>> {
        let mut devices: Vec<_> = self.by_id.iter().map(|d| d.value().clone()).collect();
        devices.sort_by(|a, b| a.id().cmp(b.id()));
        devices
    }

    /// Resolve a bus topic to its device, creating it on first sight.
    ///
    /// A miss in memory blocks on the store's lookup table for at most the
    /// configured read timeout. A topic without a lookup entry gets a fresh
    /// stable id, which is persisted before the device's own metadata.
    pub async fn get_device_by_topic(&self, topic: &str) -> Result<Arc<Device>> {
        let key = canonical(topic);
        if key.is_empty() || key.contains('/') {
            return Err(DeviceError::InvalidTopic(topic.to_string()));
        }

        let cached = self.by_topic.get(&key).map(|d| d.value().clone());
        if let Some(device) = cached {
            device.set_topic(topic);
            return Ok(device);
        }

        let cell = self.pending.entry(key.clone()).or_default().value().clone();
        let device = cell
            .get_or_try_init(|| self.resolve(topic, &key))
            .await?
            .clone();
        // Failed resolutions leave the cell in place for the next caller.
        self.pending.remove(&key);
        device.set_topic(topic);
        Ok(device)
    }

    async fn resolve(&self, topic: &str, key: &str) -> Result<Arc<Device>> {
        let lookup = paths::lookup(key);
        let existing = read_with_timeout(self.ctx.store.as_ref(), &lookup, self.read_timeout)
            .await
            .map_err(|e| match e {
                StoreError::Timeout { timeout_ms, .. } => DeviceError::IdentityTimeout {
                    topic: topic.to_string(),
                    timeout_ms,
                },
                other => DeviceError::Store(other),
            })?;

        let id = match existing.as_ref().and_then(stable_id) {
            Some(id) => {
                tracing::debug!("Topic {} has stable id {}", key, id);
                id
            }
            None => {
                let id = self.ctx.store.generate_key();
                tracing::info!("Assigned stable id {} to topic {}", id, key);
                self.ctx.store.set_value(&lookup, Value::String(id.clone()));
                id
            }
        };

        let device = self
            .by_id
            .entry(id.clone())
            .or_insert_with(|| Device::new(id.clone(), self.ctx.clone()))
            .value()
            .clone();
        device.set_topic(topic);
        self.by_topic.insert(key.to_string(), device.clone());
        Ok(device)
    }

    /// Load persisted devices from the store.
    ///
    /// Entries without a topic are indexed by id only and pick up their
    /// topic on first sight.
    pub async fn bootstrap(&self) -> Result<usize> {
        let list = read_with_timeout(
            self.ctx.store.as_ref(),
            &paths::device_list(),
            self.read_timeout,
        )
        .await?;

        let Some(Value::Object(entries)) = list else {
            tracing::info!("No persisted devices");
            return Ok(0);
        };

        let mut loaded = 0;
        for (id, entry) in entries {
            let device = self
                .by_id
                .entry(id.clone())
                .or_insert_with(|| Device::restore(id.clone(), &entry, self.ctx.clone()))
                .value()
                .clone();
            if let Some(topic) = device.topic() {
                self.by_topic.entry(topic).or_insert_with(|| device.clone());
            }
            loaded += 1;
        }
        tracing::info!("Loaded {} persisted device(s)", loaded);
        Ok(loaded)
    }

    /// Route one inbound message.
    pub async fn route(&self, message: &BusMessage) -> Result<RouteOutcome> {
        let Some(parts) = TopicParts::parse(&message.topic) else {
            tracing::warn!("MQTT NOT PROCESSED: {}", message.topic);
            return Ok(RouteOutcome::Unprocessed);
        };
        let payload = message.payload_str();

        match parts.kind() {
            Namespace::Stat if parts.channel_is(channels::RESULT) => {
                tracing::info!("MQTT PROCESSED: {} {}", message.topic, payload);
                // Decode before resolving so bad payloads never create devices.
                let report = StatusReport::decode(&payload)?;
                let device = self.get_device_by_topic(parts.device).await?;
                let update = device.apply_status(&report, chrono::Utc::now());
                for e in &update.errors {
                    tracing::warn!("Status of {} not fully propagated: {}", device.id(), e);
                }
                Ok(RouteOutcome::Status {
                    device: device.id().to_string(),
                    update,
                })
            }
            Namespace::Tele if parts.channel_is(channels::LWT) => {
                tracing::info!("MQTT PROCESSED: {} {}", message.topic, payload);
                let device = self.get_device_by_topic(parts.device).await?;
                let changed = device.set_connected(&payload);
                Ok(RouteOutcome::Connectivity {
                    device: device.id().to_string(),
                    state: device.connected(),
                    changed,
                })
            }
            Namespace::Stat | Namespace::Tele | Namespace::Cmnd => {
                tracing::trace!("MQTT IGNORE MESSAGE: {}", message.topic);
                Ok(RouteOutcome::Ignored)
            }
            Namespace::Other(_) => {
                tracing::warn!("MQTT NOT PROCESSED: {}", message.topic);
                Ok(RouteOutcome::Unprocessed)
            }
        }
    }

    /// Deliver inbound messages one at a time, in arrival order.
    pub fn spawn_delivery(self: &Arc<Self>, mut inbound: mpsc::Receiver<BusMessage>) {
        let registry = Arc::clone(self);
        let task = tokio::spawn(async move {
            while let Some(message) = inbound.recv().await {
                if let Err(e) = registry.route(&message).await {
                    tracing::warn!("Failed to process {}: {}", message.topic, e);
                }
            }
            tracing::debug!("Inbound channel closed, delivery stopped");
        });
        if let Some(previous) = self.delivery.lock().replace(task) {
            previous.abort();
        }
    }

    /// Start the supervisor, load persisted devices, subscribe, start
    /// delivery and ask every known device for its status.
    pub async fn initiate(
        self: &Arc<Self>,
        inbound: mpsc::Receiver<BusMessage>,
        subscriptions: &[String],
    ) -> Result<()> {
        self.prepare(subscriptions).await?;
        self.start_delivery(inbound);
        Ok(())
    }

    /// First half of [`initiate`](Self::initiate): supervisor, bootstrap and
    /// subscriptions. No inbound message is handled yet, so links between
    /// ports can be set up before any status report arrives.
    pub async fn prepare(&self, subscriptions: &[String]) -> Result<()> {
        self.start_supervisor();

        if let Err(e) = self.bootstrap().await {
            tracing::warn!("Could not load persisted devices: {}", e);
        }

        for filter in subscriptions {
            self.ctx.bus.subscribe(filter, QoS::AtMostOnce).await?;
        }
        Ok(())
    }

    /// Second half of [`initiate`](Self::initiate): start delivery and poll
    /// every known device for its status.
    pub fn start_delivery(self: &Arc<Self>, inbound: mpsc::Receiver<BusMessage>) {
        self.spawn_delivery(inbound);
        self.request_device_status();
    }

    fn start_supervisor(&self) {
        let mut supervisor = self.supervisor.lock();
        if supervisor.is_none() {
            let every = Duration::from_millis(self.ctx.settings.supervisor_interval_ms);
            *supervisor = Some(ConnectionSupervisor::spawn(self.ctx.bus.clone(), every));
        }
    }

    pub fn supervisor_stats(&self) -> Option<Arc<SupervisorStats>> {
        self.supervisor.lock().as_ref().map(|s| s.stats())
    }

    /// Ask every device with a known topic for its status. Returns the
    /// number of requests sent.
    pub fn request_device_status(&self) -> usize {
        let devices: Vec<_> = self.by_topic.iter().map(|d| d.value().clone()).collect();
        let mut sent = 0;
        for device in devices {
            match device.request_status() {
                Ok(()) => sent += 1,
                Err(e) => tracing::warn!("Could not request status of {}: {}", device.id(), e),
            }
        }
        sent
    }

    /// Stop background work and disconnect from the bus. Errors are logged.
    pub async fn close(&self) {
        let timeout = Duration::from_millis(self.ctx.settings.shutdown_timeout_ms);

        let supervisor = self.supervisor.lock().take();
        if let Some(supervisor) = supervisor {
            supervisor.shutdown(timeout).await;
        }

        tracing::info!("Disconnecting MQTT client");
        match tokio::time::timeout(timeout, self.ctx.bus.disconnect()).await {
            Ok(Ok(())) => tracing::info!("Disconnected from MQTT broker"),
            Ok(Err(e)) => tracing::warn!("Disconnect failed: {}", e),
            Err(_) => tracing::warn!("Disconnect timed out after {:?}", timeout),
        }

        if let Some(task) = self.delivery.lock().take() {
            task.abort();
        }

        for device in self.devices() {
            device.close();
        }
    }
}

/// A lookup entry holding a usable id.
fn stable_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() && s != "null" => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
