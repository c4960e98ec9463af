//! MQTT bus client built on rumqttc.
//!
//! The event loop runs in its own task. Inbound publishes are forwarded to a
//! bounded channel handed out by [`MqttBus::connect`]. When the connection
//! drops, the loop parks until [`MessageBus::reconnect`] is called, so the
//! retry cadence is owned by the connection supervisor.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use homelink_core::bus::BusResult;
use homelink_core::config::MqttSettings;
use homelink_core::{BusError, BusMessage, MessageBus, QoS};
use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Capacity of the inbound message channel.
pub const INBOUND_CAPACITY: usize = 1024;

/// Capacity of the rumqttc request queue.
const REQUEST_CAPACITY: usize = 64;

fn to_rumqtt_qos(qos: QoS) -> rumqttc::QoS {
    match qos {
        QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
        QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
        QoS::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
    }
}

/// Build client options from settings.
pub fn mqtt_options(settings: &MqttSettings) -> MqttOptions {
    let client_id = settings
        .client_id
        .clone()
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| format!("homelink-{}", Uuid::new_v4()));

    let mut options = MqttOptions::new(client_id, &settings.host, settings.port);
    options.set_keep_alive(Duration::from_secs(settings.keep_alive_secs));
    options.set_clean_session(settings.clean_session);
    if let (Some(user), Some(pass)) = (&settings.username, &settings.password) {
        options.set_credentials(user, pass);
    }
    options
}

/// Shared state between the client handle and its event loop.
struct Shared {
    broker_addr: String,
    connected: AtomicBool,
    running: AtomicBool,
    reconnect: Notify,
    /// Filters to restore when the broker did not keep our session.
    subscriptions: Mutex<Vec<(String, QoS)>>,
}

/// MQTT session implementing [`MessageBus`].
pub struct MqttBus {
    client: AsyncClient,
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MqttBus {
    /// Start a session. Returns the bus and the receiver of inbound messages.
    ///
    /// The first connection attempt happens in the background; use
    /// [`MessageBus::is_connected`] to observe it.
    pub fn connect(settings: &MqttSettings) -> (Arc<Self>, mpsc::Receiver<BusMessage>) {
        let (client, eventloop) = AsyncClient::new(mqtt_options(settings), REQUEST_CAPACITY);
        let (tx, rx) = mpsc::channel(INBOUND_CAPACITY);

        let shared = Arc::new(Shared {
            broker_addr: settings.full_broker_addr(),
            connected: AtomicBool::new(false),
            running: AtomicBool::new(true),
            reconnect: Notify::new(),
            subscriptions: Mutex::new(Vec::new()),
        });

        let task = tokio::spawn(run_event_loop(
            eventloop,
            client.clone(),
            shared.clone(),
            tx,
        ));

        info!("Connecting to MQTT broker {}", shared.broker_addr);
        let bus = Arc::new(Self {
            client,
            shared,
            task: Mutex::new(Some(task)),
        });
        (bus, rx)
    }

    pub fn broker_addr(&self) -> &str {
        &self.shared.broker_addr
    }
}

async fn run_event_loop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    shared: Arc<Shared>,
    tx: mpsc::Sender<BusMessage>,
) {
    while shared.running.load(Ordering::SeqCst) {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let message = BusMessage {
                    topic: publish.topic.clone(),
                    payload: publish.payload.to_vec(),
                    retain: publish.retain,
                };
                if tx.send(message).await.is_err() {
                    debug!("Inbound receiver dropped, stopping event loop");
                    break;
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                shared.connected.store(true, Ordering::SeqCst);
                info!(
                    "MQTT broker {} connection acknowledged (session present: {})",
                    shared.broker_addr, ack.session_present
                );
                if !ack.session_present {
                    let filters = shared.subscriptions.lock().clone();
                    for (filter, qos) in filters {
                        if let Err(e) = client.try_subscribe(filter.as_str(), to_rumqtt_qos(qos)) {
                            warn!("Failed to restore subscription {}: {}", filter, e);
                        }
                    }
                }
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                shared.connected.store(false, Ordering::SeqCst);
                break;
            }
            Ok(_) => {}
            Err(e) => {
                shared.connected.store(false, Ordering::SeqCst);
                if !shared.running.load(Ordering::SeqCst) {
                    break;
                }
                error!("MQTT connection to {} lost: {}", shared.broker_addr, e);
                // Wait for the supervisor before polling again.
                shared.reconnect.notified().await;
            }
        }
    }
    shared.connected.store(false, Ordering::SeqCst);
    info!("MQTT broker {} connection closed", shared.broker_addr);
}

#[async_trait]
impl MessageBus for MqttBus {
    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    fn publish(&self, topic: &str, payload: &[u8], qos: QoS, retain: bool) -> BusResult<()> {
        if !self.shared.running.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }
        if !self.is_connected() {
            return Err(BusError::NotConnected);
        }
        self.client
            .try_publish(topic, to_rumqtt_qos(qos), retain, payload.to_vec())
            .map_err(|e| BusError::Publish {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }

    async fn subscribe(&self, filter: &str, qos: QoS) -> BusResult<()> {
        {
            let mut subscriptions = self.shared.subscriptions.lock();
            if !subscriptions.iter().any(|(f, _)| f == filter) {
                subscriptions.push((filter.to_string(), qos));
            }
        }
        self.client
            .subscribe(filter, to_rumqtt_qos(qos))
            .await
            .map_err(|e| BusError::Subscribe {
                filter: filter.to_string(),
                reason: e.to_string(),
            })?;
        info!("Subscribed to {}", filter);
        Ok(())
    }

    async fn reconnect(&self) -> BusResult<()> {
        if !self.shared.running.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }
        self.shared.reconnect.notify_one();
        Ok(())
    }

    async fn disconnect(&self) -> BusResult<()> {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let result = if self.is_connected() {
            self.client
                .disconnect()
                .await
                .map_err(|e| BusError::Disconnect(e.to_string()))
        } else {
            Ok(())
        };
        // Wake a loop parked on a lost connection so it can observe the stop.
        self.shared.reconnect.notify_one();

        let task = self.task.lock().take();
        if let Some(task) = task {
            if task.await.is_err() {
                warn!("MQTT event loop task ended abnormally");
            }
        }
        result
    }
}
