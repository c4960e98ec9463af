//! Configuration model.
//!
//! The binary reads an optional TOML file, then applies environment
//! overrides. Every field has a default so an empty file is a valid
//! configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default values.
pub mod defaults {
    pub const MQTT_HOST: &str = "localhost";
    pub const MQTT_PORT: u16 = 1883;
    pub const MQTT_KEEP_ALIVE_SECS: u64 = 60;
    /// Subscribe to everything; routing filters by namespace.
    pub const MQTT_SUBSCRIPTION: &str = "#";

    pub const STORE_BACKEND: &str = "redb";
    pub const STORE_PATH: &str = "./data/homelink.redb";
    pub const STORE_READ_TIMEOUT_MS: u64 = 10_000;

    pub const COMMAND_NAMESPACE: &str = "cmnd";
    pub const STATUS_DIRECTIVE: &str = "STATE";
    pub const SUPERVISOR_INTERVAL_MS: u64 = 1_000;
    pub const SHUTDOWN_TIMEOUT_MS: u64 = 5_000;
}

/// Environment variable names.
pub mod env_vars {
    pub const MQTT_ADDRESS: &str = "mqttAddress";
    pub const MQTT_PORT: &str = "mqttPort";
    pub const MQTT_USERNAME: &str = "mqttUsername";
    pub const MQTT_PASSWORD: &str = "mqttPassword";
    pub const STORE_PATH: &str = "HOMELINK_STORE_PATH";
    pub const STORE_BACKEND: &str = "HOMELINK_STORE_BACKEND";
    pub const LOG_JSON: &str = "HOMELINK_LOG_JSON";
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },

    #[error("Invalid port reference '{0}', expected '<device>/<port>'")]
    InvalidPortRef(String),
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub mqtt: MqttSettings,
    pub store: StoreSettings,
    pub registry: RegistrySettings,
    pub control_units: Vec<ControlUnitConfig>,
    pub keys: Vec<KeyBinding>,
}

/// MQTT broker connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    /// Client ID (random if not provided)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    pub keep_alive_secs: u64,
    /// Keep the broker-side session (and its subscriptions) across reconnects.
    pub clean_session: bool,
    pub subscriptions: Vec<String>,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            host: defaults::MQTT_HOST.to_string(),
            port: defaults::MQTT_PORT,
            client_id: None,
            username: None,
            password: None,
            keep_alive_secs: defaults::MQTT_KEEP_ALIVE_SECS,
            clean_session: false,
            subscriptions: vec![defaults::MQTT_SUBSCRIPTION.to_string()],
        }
    }
}

impl MqttSettings {
    pub fn full_broker_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Remote store backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    /// "redb" or "memory"
    pub backend: String,
    pub path: String,
    /// Upper bound for the blocking identity lookup.
    pub read_timeout_ms: u64,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            backend: defaults::STORE_BACKEND.to_string(),
            path: defaults::STORE_PATH.to_string(),
            read_timeout_ms: defaults::STORE_READ_TIMEOUT_MS,
        }
    }
}

/// Device registry behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrySettings {
    /// Namespace of outbound commands (`<namespace>/<topic>/<port>`).
    pub command_namespace: String,
    /// Directive published to request a full status report.
    pub status_directive: String,
    pub supervisor_interval_ms: u64,
    pub shutdown_timeout_ms: u64,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            command_namespace: defaults::COMMAND_NAMESPACE.to_string(),
            status_directive: defaults::STATUS_DIRECTIVE.to_string(),
            supervisor_interval_ms: defaults::SUPERVISOR_INTERVAL_MS,
            shutdown_timeout_ms: defaults::SHUTDOWN_TIMEOUT_MS,
        }
    }
}

/// A virtual switch linking several device ports.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ControlUnitConfig {
    pub name: String,
    /// Member ports as `<device-topic>/<port>`.
    pub members: Vec<String>,
}

impl ControlUnitConfig {
    /// Split members into `(device topic, port name)` pairs.
    pub fn member_refs(&self) -> Result<Vec<(String, String)>, ConfigError> {
        self.members.iter().map(|m| parse_port_ref(m)).collect()
    }
}

/// Console key mapped to a port toggle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeyBinding {
    pub key: String,
    /// Device topic, or a control unit name when `port` is empty.
    pub device: String,
    #[serde(default)]
    pub port: String,
}

/// Parse `<device-topic>/<port>`. The port is the last segment.
pub fn parse_port_ref(reference: &str) -> Result<(String, String), ConfigError> {
    match reference.rsplit_once('/') {
        Some((device, port)) if !device.is_empty() && !port.is_empty() => {
            Ok((device.to_string(), port.to_string()))
        }
        _ => Err(ConfigError::InvalidPortRef(reference.to_string())),
    }
}

impl AppConfig {
    /// Load from a TOML file, or defaults when `path` is `None`.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => {
                let text = std::fs::read_to_string(path)?;
                Self::from_toml(&text)
            }
            None => Ok(Self::default()),
        }
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup(env_vars::MQTT_ADDRESS) {
            self.mqtt.host = host;
        }
        if let Some(port) = lookup(env_vars::MQTT_PORT) {
            self.mqtt.port = port.trim().parse().map_err(|_| ConfigError::InvalidValue {
                key: env_vars::MQTT_PORT.to_string(),
                value: port.clone(),
            })?;
        }
        if let Some(user) = lookup(env_vars::MQTT_USERNAME) {
            self.mqtt.username = Some(user);
        }
        if let Some(pass) = lookup(env_vars::MQTT_PASSWORD) {
            self.mqtt.password = Some(pass);
        }
        if let Some(path) = lookup(env_vars::STORE_PATH) {
            self.store.path = path;
        }
        if let Some(backend) = lookup(env_vars::STORE_BACKEND) {
            self.store.backend = backend;
        }
        Ok(())
    }
}

/// Whether JSON log output was requested through the environment.
pub fn json_logging() -> bool {
    std::env::var(env_vars::LOG_JSON)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = AppConfig::from_toml("").unwrap();
        assert_eq!(config.mqtt.port, 1883);
        assert!(!config.mqtt.clean_session);
        assert_eq!(config.mqtt.subscriptions, vec!["#".to_string()]);
        assert_eq!(config.registry.command_namespace, "cmnd");
        assert_eq!(config.registry.supervisor_interval_ms, 1_000);
        assert!(config.control_units.is_empty());
    }

    #[test]
    fn test_parse_full_file() {
        let text = r#"
            [mqtt]
            host = "broker.lan"
            port = 1884

            [store]
            backend = "memory"

            [[control_units]]
            name = "Wasgoedlyn"
            members = ["front-door-light-switch/power3", "washing-line-relay/power"]

            [[keys]]
            key = "1"
            device = "front-door-light-switch"
            port = "Power1"
        "#;
        let config = AppConfig::from_toml(text).unwrap();
        assert_eq!(config.mqtt.full_broker_addr(), "broker.lan:1884");
        assert_eq!(config.store.backend, "memory");
        assert_eq!(config.store.read_timeout_ms, defaults::STORE_READ_TIMEOUT_MS);

        let refs = config.control_units[0].member_refs().unwrap();
        assert_eq!(
            refs[0],
            ("front-door-light-switch".to_string(), "power3".to_string())
        );
        assert_eq!(config.keys[0].port, "Power1");
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("homelink.toml");
        std::fs::write(&path, "[registry]\nstatus_directive = \"STATUS\"\n").unwrap();

        let config = AppConfig::load(Some(&path)).unwrap();
        assert_eq!(config.registry.status_directive, "STATUS");
        assert!(AppConfig::load(Some(&dir.path().join("missing.toml"))).is_err());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            (env_vars::MQTT_ADDRESS, "10.0.0.2"),
            (env_vars::MQTT_PORT, "8883"),
            (env_vars::STORE_PATH, "/var/lib/homelink.redb"),
        ]
        .into_iter()
        .collect();

        let mut config = AppConfig::default();
        config
            .apply_env_from(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.mqtt.host, "10.0.0.2");
        assert_eq!(config.mqtt.port, 8883);
        assert_eq!(config.store.path, "/var/lib/homelink.redb");
    }

    #[test]
    fn test_invalid_port_env() {
        let mut config = AppConfig::default();
        let result = config.apply_env_from(|k| (k == env_vars::MQTT_PORT).then(|| "abc".into()));
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_parse_port_ref() {
        assert!(parse_port_ref("lamp").is_err());
        assert!(parse_port_ref("lamp/").is_err());
        assert_eq!(
            parse_port_ref("garden/shed/POWER2").unwrap(),
            ("garden/shed".to_string(), "POWER2".to_string())
        );
    }
}
