//! Core traits and types for HomeLink.
//!
//! This crate defines the seams shared by every other crate in the workspace:
//! the hierarchical remote store, the publish/subscribe message bus, and the
//! configuration model loaded by the binary.

pub mod bus;
pub mod config;
pub mod storage;

// Bus exports
pub use bus::{BusError, BusMessage, MessageBus, QoS};

// Storage exports
pub use storage::{RemoteStore, StoreError, StorePath};

/// Re-exports commonly used types.
pub mod prelude {
    pub use crate::bus::{BusError, BusMessage, BusResult, MessageBus, QoS};
    pub use crate::config::{
        AppConfig, ControlUnitConfig, KeyBinding, MqttSettings, RegistrySettings, StoreSettings,
    };
    pub use crate::storage::{read_with_timeout, RemoteStore, StoreError, StorePath};
}
