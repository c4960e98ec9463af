//! Port propagation graph.
//!
//! Every switchable endpoint (a physical device port or a virtual control
//! unit) is a node in one shared arena. A node mirrors the state of its
//! *sources*: commanding a node forwards the command to every live listener
//! and then to the node's own device. Cycles are cut with a per-path
//! provenance set, so a wave never revisits a node already on its path.
//!
//! Inbound state reports are reconciled against commands this process sent:
//! every successful dispatch raises the node's expected-echo counter, every
//! observed report raises the observed counter. A report that arrives without
//! a pending echo is treated as an external change and pushed to the
//! node's mirrors.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Weak};

use homelink_core::{RemoteStore, StorePath};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{DeviceError, DispatchFailure, Result};

/// Handle to a node in a [`PortGraph`].
///
/// Ids are only meaningful for the graph that issued them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// Last known state of a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PortState {
    #[default]
    Unknown,
    On,
    Off,
}

impl PortState {
    /// Parse a device-reported token. Anything unrecognised is `Unknown`.
    pub fn parse(token: &str) -> Self {
        let token = token.trim();
        if token.eq_ignore_ascii_case("ON") {
            PortState::On
        } else if token.eq_ignore_ascii_case("OFF") {
            PortState::Off
        } else {
            PortState::Unknown
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PortState::Unknown => "UNKNOWN",
            PortState::On => "ON",
            PortState::Off => "OFF",
        }
    }

    /// The command that would drive a port into this state.
    pub fn as_command(&self) -> Option<Power> {
        match self {
            PortState::On => Some(Power::On),
            PortState::Off => Some(Power::Off),
            PortState::Unknown => None,
        }
    }

    /// State after applying a command locally.
    pub fn apply(self, command: Power) -> Self {
        match (command, self) {
            (Power::On, _) => PortState::On,
            (Power::Off, _) => PortState::Off,
            (Power::Toggle, PortState::On) => PortState::Off,
            (Power::Toggle, _) => PortState::On,
        }
    }
}

impl fmt::Display for PortState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Power command sent to a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Power {
    On,
    Off,
    Toggle,
}

impl Power {
    pub fn as_str(&self) -> &'static str {
        match self {
            Power::On => "ON",
            Power::Off => "OFF",
            Power::Toggle => "TOGGLE",
        }
    }
}

impl fmt::Display for Power {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Power {
    type Err = DeviceError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ON" | "1" => Ok(Power::On),
            "OFF" | "0" => Ok(Power::Off),
            "TOGGLE" | "2" => Ok(Power::Toggle),
            _ => Err(DeviceError::InvalidCommand(s.to_string())),
        }
    }
}

/// Something that can deliver a power command for a named port.
pub trait PortDispatcher: Send + Sync {
    fn dispatch(&self, port: &str, command: Power) -> std::result::Result<(), DispatchFailure>;
}

/// Echo bookkeeping for one node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EchoCounters {
    /// Commands dispatched to the device whose report is still expected.
    pub expected: u64,
    /// Reports received from the device.
    pub observed: u64,
}

impl EchoCounters {
    fn await_echo(&mut self) {
        self.expected += 1;
    }

    /// Record a report. Returns true when no echo was pending for it.
    fn observe(&mut self) -> bool {
        self.observed += 1;
        if self.observed > self.expected {
            self.expected = self.observed;
            true
        } else {
            false
        }
    }
}

struct PortNode {
    name: String,
    state: PortState,
    sources: BTreeSet<NodeId>,
    listeners: BTreeSet<NodeId>,
    dispatcher: Option<Weak<dyn PortDispatcher>>,
    /// Store path of the node; state lives at `<path>/state`.
    path: Option<StorePath>,
    echoes: EchoCounters,
}

/// Outcome of one propagation wave.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Propagation {
    /// Nodes visited, in visit order.
    pub visited: Vec<NodeId>,
    /// Nodes whose device accepted the command.
    pub dispatched: Vec<NodeId>,
    /// Virtual nodes that applied the command locally.
    pub applied: Vec<NodeId>,
    /// Visits cut because the node was already on the path.
    pub suppressed: usize,
}

/// Outcome of an observed state report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    pub previous: PortState,
    pub current: PortState,
    /// True when the report was not the echo of a local command.
    pub external: bool,
    /// Wave triggered by an external change, if any.
    pub propagation: Option<Propagation>,
}

impl StateChange {
    pub fn changed(&self) -> bool {
        self.previous != self.current
    }
}

enum Step {
    Visit {
        node: NodeId,
        provenance: Arc<BTreeSet<NodeId>>,
    },
    Dispatch(NodeId),
}

/// Arena of ports and their mirroring edges.
pub struct PortGraph {
    nodes: RwLock<Vec<PortNode>>,
    store: Arc<dyn RemoteStore>,
}

impl PortGraph {
    pub fn new(store: Arc<dyn RemoteStore>) -> Self {
        Self {
            nodes: RwLock::new(Vec::new()),
            store,
        }
    }

    /// Add a node. Nodes without a dispatcher are virtual and apply
    /// commands to their own state.
    pub fn add_node(
        &self,
        name: &str,
        path: Option<StorePath>,
        dispatcher: Option<Weak<dyn PortDispatcher>>,
    ) -> NodeId {
        let mut nodes = self.nodes.write();
        let id = NodeId(nodes.len());
        nodes.push(PortNode {
            name: name.to_string(),
            state: PortState::Unknown,
            sources: BTreeSet::new(),
            listeners: BTreeSet::new(),
            dispatcher,
            path,
            echoes: EchoCounters::default(),
        });
        id
    }

    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }

    pub fn name(&self, id: NodeId) -> String {
        self.nodes.read()[id.0].name.clone()
    }

    pub fn state(&self, id: NodeId) -> PortState {
        self.nodes.read()[id.0].state
    }

    pub fn sources(&self, id: NodeId) -> BTreeSet<NodeId> {
        self.nodes.read()[id.0].sources.clone()
    }

    pub fn listeners(&self, id: NodeId) -> BTreeSet<NodeId> {
        self.nodes.read()[id.0].listeners.clone()
    }

    pub fn echoes(&self, id: NodeId) -> EchoCounters {
        self.nodes.read()[id.0].echoes
    }

    pub fn is_virtual(&self, id: NodeId) -> bool {
        self.nodes.read()[id.0].dispatcher.is_none()
    }

    /// Replace the sources of `id` and register `id` as a listener on each.
    ///
    /// Listener edges from former sources are left in place and dropped
    /// lazily the next time those sources propagate.
    pub fn set_sources(&self, id: NodeId, sources: impl IntoIterator<Item = NodeId>) {
        let sources: BTreeSet<NodeId> = sources.into_iter().filter(|s| *s != id).collect();
        let mut nodes = self.nodes.write();
        for source in &sources {
            nodes[source.0].listeners.insert(id);
        }
        nodes[id.0].sources = sources;
    }

    /// Add one source to `id`, keeping the existing ones.
    pub fn add_source(&self, id: NodeId, source: NodeId) {
        if id == source {
            return;
        }
        let mut nodes = self.nodes.write();
        nodes[source.0].listeners.insert(id);
        nodes[id.0].sources.insert(source);
    }

    /// Register `listener` on `id` without touching the listener's sources.
    ///
    /// The edge only carries commands while `listener` names `id` as a source.
    pub fn add_listener(&self, id: NodeId, listener: NodeId) {
        self.nodes.write()[id.0].listeners.insert(listener);
    }

    /// Command a node and everything that mirrors it.
    pub fn set_power(&self, id: NodeId, command: Power) -> Result<Propagation> {
        self.set_power_from(id, command, &BTreeSet::new())
    }

    /// Command a node on behalf of the nodes in `provenance`.
    ///
    /// Nodes already in `provenance` are not visited again. Every reachable
    /// device is attempted; dispatch failures are collected and returned
    /// together once the wave has finished.
    pub fn set_power_from(
        &self,
        id: NodeId,
        command: Power,
        provenance: &BTreeSet<NodeId>,
    ) -> Result<Propagation> {
        self.propagate(id, command, provenance, true)
    }

    fn propagate(
        &self,
        id: NodeId,
        command: Power,
        provenance: &BTreeSet<NodeId>,
        dispatch_origin: bool,
    ) -> Result<Propagation> {
        let mut report = Propagation::default();
        let mut failures = Vec::new();
        let mut stack = vec![Step::Visit {
            node: id,
            provenance: Arc::new(provenance.clone()),
        }];

        while let Some(step) = stack.pop() {
            match step {
                Step::Visit { node, provenance } => {
                    if provenance.contains(&node) {
                        report.suppressed += 1;
                        continue;
                    }
                    let mut path = (*provenance).clone();
                    path.insert(node);
                    let path = Arc::new(path);

                    report.visited.push(node);
                    // The node's own dispatch runs after all of its listeners.
                    if node != id || dispatch_origin {
                        stack.push(Step::Dispatch(node));
                    }
                    for listener in self.live_listeners(node).into_iter().rev() {
                        stack.push(Step::Visit {
                            node: listener,
                            provenance: Arc::clone(&path),
                        });
                    }
                }
                Step::Dispatch(node) => {
                    if let Err(failure) = self.dispatch(node, command, &mut report) {
                        tracing::warn!("{}", failure);
                        failures.push(failure);
                    }
                }
            }
        }

        let attempted = report.dispatched.len() + failures.len();
        match failures.len() {
            0 => Ok(report),
            1 if attempted == 1 => Err(DeviceError::Dispatch(failures.remove(0))),
            _ => Err(DeviceError::PartialDispatch {
                attempted,
                failures,
            }),
        }
    }

    /// Record a state report for a node.
    ///
    /// Unrecognised tokens are recorded as `Unknown`. A change of state is
    /// persisted. When the report was not the echo of a local command and
    /// names a definite state, the state is propagated to this node's
    /// listeners, even if it matches the recorded state, so mirrors that
    /// missed an earlier wave are brought back in line. The node's own
    /// device already is in that state and is not commanded again.
    pub fn set_state(&self, id: NodeId, token: &str) -> Result<StateChange> {
        let current = PortState::parse(token);
        let (previous, path, external, name) = {
            let mut nodes = self.nodes.write();
            let node = &mut nodes[id.0];
            let previous = node.state;
            node.state = current;
            let external = node.echoes.observe();
            (previous, node.path.clone(), external, node.name.clone())
        };

        if previous != current {
            if let Some(path) = path {
                self.persist_state(&path, current);
            }
        }

        let mut change = StateChange {
            previous,
            current,
            external,
            propagation: None,
        };

        if external {
            if let Some(command) = current.as_command() {
                tracing::info!(
                    "External change on {}: {} -> {}, propagating",
                    name,
                    previous,
                    current
                );
                change.propagation =
                    Some(self.propagate(id, command, &BTreeSet::new(), false)?);
            }
        }

        Ok(change)
    }

    /// Listeners of `node` that still name it as a source. Stale listener
    /// edges are removed.
    fn live_listeners(&self, node: NodeId) -> Vec<NodeId> {
        let mut nodes = self.nodes.write();
        let listeners: Vec<NodeId> = nodes[node.0].listeners.iter().copied().collect();
        let (live, stale): (Vec<NodeId>, Vec<NodeId>) = listeners
            .into_iter()
            .partition(|listener| nodes[listener.0].sources.contains(&node));
        for listener in stale {
            tracing::debug!(
                "Dropping stale listener {} of {}",
                nodes[listener.0].name,
                nodes[node.0].name
            );
            nodes[node.0].listeners.remove(&listener);
        }
        live
    }

    fn dispatch(
        &self,
        node: NodeId,
        command: Power,
        report: &mut Propagation,
    ) -> std::result::Result<(), DispatchFailure> {
        let (name, dispatcher) = {
            let nodes = self.nodes.read();
            let n = &nodes[node.0];
            (n.name.clone(), n.dispatcher.clone())
        };

        match dispatcher {
            Some(weak) => {
                let Some(target) = weak.upgrade() else {
                    tracing::debug!("Device of port {} is gone, skipping", name);
                    return Ok(());
                };
                target.dispatch(&name, command)?;
                self.nodes.write()[node.0].echoes.await_echo();
                report.dispatched.push(node);
            }
            None => {
                let (previous, current, path) = {
                    let mut nodes = self.nodes.write();
                    let n = &mut nodes[node.0];
                    let previous = n.state;
                    n.state = previous.apply(command);
                    (previous, n.state, n.path.clone())
                };
                if previous != current {
                    if let Some(path) = path {
                        self.persist_state(&path, current);
                    }
                }
                report.applied.push(node);
            }
        }
        Ok(())
    }

    fn persist_state(&self, path: &StorePath, state: PortState) {
        self.store
            .set_value(&path.child("state"), Value::String(state.as_str().to_string()));
    }
}
