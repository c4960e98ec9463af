//! HomeLink device layer.
//!
//! Mirrors switch devices between an MQTT bus and the remote store:
//! - [`port`]: the propagation graph linking ports to each other
//! - [`device`]: bus-addressed devices and their status handling
//! - [`registry`]: topic-to-device resolution and inbound routing
//! - [`control_unit`]: virtual switches over several ports
//! - [`supervisor`]: reconnect loop for the bus session
//! - [`mqtt`]: rumqttc-backed bus client

pub mod control_unit;
pub mod device;
pub mod error;
#[cfg(feature = "mqtt")]
pub mod mqtt;
pub mod port;
pub mod registry;
pub mod supervisor;
pub mod topic;

pub use control_unit::{ControlUnit, ControlUnitManager};
pub use device::{Connectivity, Device, DeviceContext, StatusReport, StatusUpdate};
pub use error::{DeviceError, DispatchFailure, Result};
#[cfg(feature = "mqtt")]
pub use mqtt::MqttBus;
pub use port::{EchoCounters, NodeId, PortGraph, PortState, Power, Propagation, StateChange};
pub use registry::{DeviceRegistry, RouteOutcome};
pub use supervisor::{ConnectionSupervisor, SupervisorStats};
