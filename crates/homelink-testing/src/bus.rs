//! In-process bus for tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use homelink_core::bus::BusResult;
use homelink_core::{BusError, MessageBus, QoS};
use parking_lot::Mutex;

/// A message handed to [`RecordingBus::publish`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub topic: String,
    pub payload: String,
    pub qos: QoS,
    pub retain: bool,
}

/// Bus that records outbound traffic instead of sending it.
#[derive(Debug)]
pub struct RecordingBus {
    connected: AtomicBool,
    reject_publish: AtomicBool,
    reconnect_restores: AtomicBool,
    published: Mutex<Vec<Published>>,
    subscriptions: Mutex<Vec<String>>,
    reconnects: AtomicUsize,
    disconnects: AtomicUsize,
}

impl Default for RecordingBus {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingBus {
    /// A connected bus.
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
            reject_publish: AtomicBool::new(false),
            reconnect_restores: AtomicBool::new(false),
            published: Mutex::new(Vec::new()),
            subscriptions: Mutex::new(Vec::new()),
            reconnects: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Make every publish fail while connected.
    pub fn set_reject_publish(&self, reject: bool) {
        self.reject_publish.store(reject, Ordering::SeqCst);
    }

    /// Whether a reconnect request brings the session back.
    pub fn set_reconnect_restores(&self, restores: bool) {
        self.reconnect_restores.store(restores, Ordering::SeqCst);
    }

    pub fn published(&self) -> Vec<Published> {
        self.published.lock().clone()
    }

    pub fn published_to(&self, topic: &str) -> Vec<Published> {
        self.published
            .lock()
            .iter()
            .filter(|p| p.topic == topic)
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.published.lock().clear();
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().clone()
    }

    pub fn reconnect_count(&self) -> usize {
        self.reconnects.load(Ordering::SeqCst)
    }

    pub fn disconnect_count(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageBus for RecordingBus {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn publish(&self, topic: &str, payload: &[u8], qos: QoS, retain: bool) -> BusResult<()> {
        if !self.is_connected() {
            return Err(BusError::NotConnected);
        }
        if self.reject_publish.load(Ordering::SeqCst) {
            return Err(BusError::Publish {
                topic: topic.to_string(),
                reason: "rejected".to_string(),
            });
        }
        self.published.lock().push(Published {
            topic: topic.to_string(),
            payload: String::from_utf8_lossy(payload).into_owned(),
            qos,
            retain,
        });
        Ok(())
    }

    async fn subscribe(&self, filter: &str, _qos: QoS) -> BusResult<()> {
        self.subscriptions.lock().push(filter.to_string());
        Ok(())
    }

    async fn reconnect(&self) -> BusResult<()> {
        self.reconnects.fetch_add(1, Ordering::SeqCst);
        if self.reconnect_restores.load(Ordering::SeqCst) {
            self.set_connected(true);
        }
        Ok(())
    }

    async fn disconnect(&self) -> BusResult<()> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        self.set_connected(false);
        Ok(())
    }
}
