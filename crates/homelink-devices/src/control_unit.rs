//! Control units: virtual switches that keep several ports in step.

use std::sync::Arc;

use homelink_core::config::ControlUnitConfig;

use crate::device::paths;
use crate::error::{DeviceError, Result};
use crate::port::{NodeId, PortGraph, PortState, Power, Propagation};
use crate::registry::DeviceRegistry;
use crate::topic::canonical;

/// A virtual port linked both ways with its member ports.
///
/// Commanding the unit, or any member changing on its own, drives every
/// other member to the same state.
pub struct ControlUnit {
    name: String,
    node: NodeId,
    members: Vec<NodeId>,
    graph: Arc<PortGraph>,
}

impl ControlUnit {
    /// Create the unit node and wire it to `members`.
    ///
    /// Members keep any sources they already had.
    pub fn link(graph: Arc<PortGraph>, name: &str, members: &[NodeId]) -> Self {
        let name = canonical(name);
        let node = graph.add_node(&name, Some(paths::control_unit(&name)), None);
        graph.set_sources(node, members.iter().copied());
        for member in members {
            graph.add_source(*member, node);
        }
        tracing::info!("Linked control unit {} to {} port(s)", name, members.len());
        Self {
            name,
            node,
            members: members.to_vec(),
            graph,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn members(&self) -> &[NodeId] {
        &self.members
    }

    pub fn state(&self) -> PortState {
        self.graph.state(self.node)
    }

    pub fn set_power(&self, command: Power) -> Result<Propagation> {
        self.graph.set_power(self.node, command)
    }
}

/// Control units built from configuration.
#[derive(Default)]
pub struct ControlUnitManager {
    units: Vec<ControlUnit>,
}

impl ControlUnitManager {
    /// Resolve every member port through the registry and link the units.
    pub async fn from_config(
        registry: &DeviceRegistry,
        configs: &[ControlUnitConfig],
    ) -> Result<Self> {
        let mut units = Vec::with_capacity(configs.len());
        for config in configs {
            let mut members = Vec::new();
            for (topic, port) in config.member_refs()? {
                let device = registry.get_device_by_topic(&topic).await?;
                members.push(device.get_port(&port));
            }
            units.push(ControlUnit::link(registry.graph(), &config.name, &members));
        }
        Ok(Self { units })
    }

    pub fn units(&self) -> &[ControlUnit] {
        &self.units
    }

    pub fn get(&self, name: &str) -> Option<&ControlUnit> {
        let name = canonical(name);
        self.units.iter().find(|u| u.name == name)
    }

    pub fn set_power(&self, name: &str, command: Power) -> Result<Propagation> {
        self.get(name)
            .ok_or_else(|| DeviceError::UnknownControlUnit(name.to_string()))?
            .set_power(command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use homelink_storage::MemoryStore;
    use serde_json::json;

    #[test]
    fn test_link_is_bidirectional() {
        let store = Arc::new(MemoryStore::new());
        let graph = Arc::new(PortGraph::new(store));
        let x = graph.add_node("X", None, None);
        let y = graph.add_node("Y", None, None);

        let unit = ControlUnit::link(graph.clone(), "hall", &[x, y]);
        assert_eq!(unit.name(), "HALL");
        assert!(graph.sources(unit.node()).contains(&x));
        assert!(graph.sources(x).contains(&unit.node()));
        assert!(graph.listeners(x).contains(&unit.node()));
        assert!(graph.listeners(unit.node()).contains(&y));
    }

    #[test]
    fn test_unit_state_persisted() {
        let store = Arc::new(MemoryStore::new());
        let graph = Arc::new(PortGraph::new(store.clone()));
        let x = graph.add_node("X", None, None);
        let unit = ControlUnit::link(graph.clone(), "Wasgoedlyn", &[x]);

        unit.set_power(Power::On).unwrap();
        assert_eq!(unit.state(), PortState::On);
        assert_eq!(graph.state(x), PortState::On);
        assert_eq!(store.get("controlUnits/WASGOEDLYN/state"), Some(json!("ON")));
    }
}
