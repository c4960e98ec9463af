//! Command-line interface for the HomeLink coordinator.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use homelink_core::config::{self, AppConfig, KeyBinding};
use homelink_core::RemoteStore;
use homelink_devices::{ControlUnitManager, DeviceRegistry, MqttBus, Power};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

/// HomeLink - keep MQTT switches in sync with a device store.
#[derive(Parser, Debug)]
#[command(name = "homelink")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (TOML).
    #[arg(short, long, env = "HOMELINK_CONFIG")]
    config: Option<PathBuf>,

    /// MQTT broker host.
    #[arg(long)]
    mqtt_host: Option<String>,

    /// MQTT broker port.
    #[arg(long)]
    mqtt_port: Option<u16>,

    /// Store database path.
    #[arg(long)]
    store: Option<String>,

    /// Store backend (redb, memory).
    #[arg(long)]
    backend: Option<String>,

    /// Verbose output.
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    /// Flags win over the environment, which wins over the file.
    fn apply(&self, config: &mut AppConfig) {
        if let Some(host) = &self.mqtt_host {
            config.mqtt.host = host.clone();
        }
        if let Some(port) = self.mqtt_port {
            config.mqtt.port = port;
        }
        if let Some(path) = &self.store {
            config.store.path = path.clone();
        }
        if let Some(backend) = &self.backend {
            config.store.backend = backend.clone();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let mut config = AppConfig::load(args.config.as_deref()).context("Failed to load config")?;
    config.apply_env()?;
    args.apply(&mut config);

    run(config).await
}

fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(format!("warn,homelink={}", level)));

    if config::json_logging() {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_thread_ids(false)
            .compact()
            .init();
    }
}

async fn run(config: AppConfig) -> Result<()> {
    info!("MQTT Server: {}", config.mqtt.full_broker_addr());
    info!("Store: {} ({})", config.store.path, config.store.backend);

    let store = homelink_storage::create_store(&config.store).context("Failed to open store")?;
    let (bus, inbound) = MqttBus::connect(&config.mqtt);

    let registry = DeviceRegistry::new(
        bus,
        store.clone(),
        config.registry.clone(),
        Duration::from_millis(config.store.read_timeout_ms),
    );
    registry
        .prepare(&config.mqtt.subscriptions)
        .await
        .context("Failed to start device registry")?;

    // Units are linked before the first status report is delivered.
    let units = ControlUnitManager::from_config(&registry, &config.control_units)
        .await
        .context("Failed to link control units")?;
    info!("{} control unit(s) linked", units.units().len());
    registry.start_delivery(inbound);

    let keys = if config.keys.is_empty() {
        default_keys()
    } else {
        config.keys.clone()
    };
    console(&registry, &units, &keys).await;

    info!("Closing connections");
    registry.close().await;
    shutdown_store(store).await;
    Ok(())
}

/// Read single-key commands until an unbound key, end of input or Ctrl-C.
async fn console(registry: &Arc<DeviceRegistry>, units: &ControlUnitManager, keys: &[KeyBinding]) {
    let listed: Vec<&str> = keys.iter().map(|k| k.key.as_str()).collect();
    println!(
        "Press {} to toggle a switch, anything else to exit...",
        listed.join(",")
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line,
            _ = tokio::signal::ctrl_c() => break,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!("Failed to read console input: {}", e);
                break;
            }
        };

        let Some(binding) = find_binding(keys, &line) else {
            break;
        };
        toggle(registry, units, binding).await;
    }
}

fn find_binding<'a>(keys: &'a [KeyBinding], input: &str) -> Option<&'a KeyBinding> {
    let input = input.trim();
    keys.iter().find(|k| k.key == input)
}

async fn toggle(registry: &DeviceRegistry, units: &ControlUnitManager, binding: &KeyBinding) {
    let result = if binding.port.is_empty() {
        units.set_power(&binding.device, Power::Toggle)
    } else {
        match registry.get_device_by_topic(&binding.device).await {
            Ok(device) => device.set_power(&binding.port, Power::Toggle),
            Err(e) => Err(e),
        }
    };
    if let Err(e) = result {
        warn!("Toggle of {} {} failed: {}", binding.device, binding.port, e);
    }
}

/// Keys 1-3 toggle the three relays of the front door switch.
fn default_keys() -> Vec<KeyBinding> {
    (1..=3)
        .map(|n| KeyBinding {
            key: n.to_string(),
            device: "front-door-light-switch".to_string(),
            port: format!("POWER{}", n),
        })
        .collect()
}

async fn shutdown_store(store: Arc<dyn RemoteStore>) {
    if let Err(e) = store.close().await {
        warn!("Failed to close store: {}", e);
    }
}
