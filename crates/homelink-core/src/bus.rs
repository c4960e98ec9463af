//! Publish/subscribe message bus abstraction.
//!
//! The bus delivers inbound messages through a channel owned by the
//! implementation; this trait only covers the outbound and session side.

use std::borrow::Cow;

use async_trait::async_trait;
use thiserror::Error;

/// Result type for bus operations.
pub type BusResult<T> = Result<T, BusError>;

/// Error type for bus operations.
#[derive(Debug, Error)]
pub enum BusError {
    /// No live session with the broker.
    #[error("Bus session is not connected")]
    NotConnected,

    /// The publish request was rejected.
    #[error("Publish to {topic} rejected: {reason}")]
    Publish { topic: String, reason: String },

    /// The subscribe request was rejected.
    #[error("Subscribe to {filter} rejected: {reason}")]
    Subscribe { filter: String, reason: String },

    /// Disconnect failed.
    #[error("Disconnect failed: {0}")]
    Disconnect(String),

    /// The client has been shut down.
    #[error("Bus client is closed")]
    Closed,
}

/// Delivery guarantee.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QoS {
    #[default]
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

/// Inbound message received from the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

impl BusMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            retain: false,
        }
    }

    /// Payload as text, replacing invalid UTF-8.
    pub fn payload_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

/// Publish/subscribe client session.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Whether the session is currently connected.
    fn is_connected(&self) -> bool;

    /// Queue a message for publishing. Never blocks.
    fn publish(&self, topic: &str, payload: &[u8], qos: QoS, retain: bool) -> BusResult<()>;

    /// Subscribe to a topic filter (wildcards `+` and `#` allowed).
    async fn subscribe(&self, filter: &str, qos: QoS) -> BusResult<()>;

    /// Start a reconnection attempt. Returns once the attempt has been issued.
    async fn reconnect(&self) -> BusResult<()>;

    /// Close the session.
    async fn disconnect(&self) -> BusResult<()>;
}
