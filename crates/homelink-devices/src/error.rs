//! Error types for device operations.

use homelink_core::config::ConfigError;
use homelink_core::{BusError, StoreError};
use thiserror::Error;

/// Result type for device operations.
pub type Result<T> = std::result::Result<T, DeviceError>;

/// An outbound command that could not be handed to the bus.
#[derive(Debug, Error)]
#[error("Failed to dispatch '{payload}' to {address}: {source}")]
pub struct DispatchFailure {
    /// Full command address (`cmnd/<topic>/<port>`).
    pub address: String,
    pub payload: String,
    #[source]
    pub source: BusError,
}

/// Error type for device operations.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// A single command could not be dispatched.
    #[error(transparent)]
    Dispatch(#[from] DispatchFailure),

    /// Some commands of a propagation wave could not be dispatched.
    #[error("{} of {attempted} command(s) failed to dispatch", .failures.len())]
    PartialDispatch {
        attempted: usize,
        failures: Vec<DispatchFailure>,
    },

    /// Status payload could not be decoded.
    #[error("Undecodable status payload: {0}")]
    Decode(String),

    /// The identity lookup did not answer in time.
    #[error("Identity lookup for {topic} timed out after {timeout_ms}ms")]
    IdentityTimeout { topic: String, timeout_ms: u64 },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Invalid topic: {0}")]
    InvalidTopic(String),

    #[error("Unknown power command: {0}")]
    InvalidCommand(String),

    #[error("Unknown control unit: {0}")]
    UnknownControlUnit(String),
}

impl DeviceError {
    /// Dispatch failures carried by this error, if any.
    pub fn dispatch_failures(&self) -> Vec<&DispatchFailure> {
        match self {
            DeviceError::Dispatch(failure) => vec![failure],
            DeviceError::PartialDispatch { failures, .. } => failures.iter().collect(),
            _ => Vec::new(),
        }
    }
}
