use indexmap::{IndexMap, IndexSet};
use log::debug;

use crate::ll_interface::{EndpointRef, ForwardingNodeId, GateId, Identity, Name, Requirements};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateKind {
    /// bound to a live connection of a construction process
    DirectDown,
    /// backup left behind after a link failure, relays via other paths
    Rerouting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    Init,
    Operational,
    Shutdown,
}

/// Forwarding handle towards one lower-layer neighbor.
#[derive(Debug, Clone)]
pub struct Gate {
    id: GateId,
    pub kind: GateKind,
    state: GateState,
    /// attachment name of the neighbor
    pub peer_name: Name,
    pub endpoint: Option<EndpointRef>,
    pub peer_gate: Option<GateId>,
    pub peer_routing_name: Option<Name>,
    pub peer_identity: Option<Identity>,
    pub requirements: Requirements,
}

impl Gate {
    pub fn gate_id(&self) -> GateId {
        self.id
    }

    pub fn state(&self) -> GateState {
        self.state
    }

    /// Operational once the peer told us its own gate.
    pub fn is_operational(&self) -> bool {
        self.state == GateState::Operational
    }

    pub fn shutdown(&mut self) {
        if self.state != GateState::Shutdown {
            debug!("gate {} to '{}' shut down", self.id, self.peer_name);
            self.state = GateState::Shutdown;
        }
    }

    /// Stores what the peer advertised about its reverse gate.
    pub fn update(&mut self, peer_gate: GateId, routing_name: Option<Name>, identity: Option<Identity>) {
        self.peer_gate = Some(peer_gate);
        self.peer_routing_name = routing_name;
        if identity.is_some() {
            self.peer_identity = identity;
        }
        if self.state == GateState::Init {
            self.state = GateState::Operational;
        }
    }

    pub fn leads_to(&self, peer_name: &str) -> bool {
        self.peer_name == peer_name
    }
}

/// Forwarding node of a node: its central node or the multiplexer of one
/// medium attachment. Gates are numbered per forwarding node.
#[derive(Debug)]
pub struct ForwardingNode {
    id: ForwardingNodeId,
    name: Name,
    open: bool,
    gates: IndexMap<GateId, Gate>,
    links: IndexSet<ForwardingNodeId>,
    next_gate: GateId,
}

impl ForwardingNode {
    pub fn new(id: ForwardingNodeId, name: impl Into<Name>) -> Self {
        Self {
            id,
            name: name.into(),
            open: true,
            gates: IndexMap::new(),
            links: IndexSet::new(),
            next_gate: 1,
        }
    }

    pub fn id(&self) -> ForwardingNodeId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn open(&mut self) {
        self.open = true;
    }

    /// Closing shuts down every gate but keeps the registrations.
    pub fn close(&mut self) {
        self.open = false;
        for gate in self.gates.values_mut() {
            gate.shutdown();
        }
    }

    pub fn create_gate(
        &mut self,
        kind: GateKind,
        peer_name: &str,
        endpoint: Option<EndpointRef>,
        requirements: Requirements,
    ) -> GateId {
        let id = self.next_gate;
        self.next_gate += 1;

        self.gates.insert(
            id,
            Gate {
                id,
                kind,
                // rerouting gates have no handshake
                state: if kind == GateKind::Rerouting {
                    GateState::Operational
                } else {
                    GateState::Init
                },
                peer_name: peer_name.to_string(),
                endpoint,
                peer_gate: None,
                peer_routing_name: None,
                peer_identity: None,
                requirements,
            },
        );
        id
    }

    pub fn gate(&self, id: GateId) -> Option<&Gate> {
        self.gates.get(&id)
    }

    pub fn gate_mut(&mut self, id: GateId) -> Option<&mut Gate> {
        self.gates.get_mut(&id)
    }

    pub fn gates(&self) -> impl Iterator<Item = &Gate> {
        self.gates.values()
    }

    pub fn gate_count(&self) -> usize {
        self.gates.len()
    }

    /// Shuts the gate down and removes it.
    pub fn unregister_gate(&mut self, id: GateId) -> Option<Gate> {
        let mut gate = self.gates.shift_remove(&id)?;
        gate.shutdown();
        Some(gate)
    }

    pub fn find_rerouting(&self, peer_name: &str) -> Option<GateId> {
        self.gates
            .values()
            .find(|g| g.kind == GateKind::Rerouting && g.leads_to(peer_name))
            .map(|g| g.id)
    }

    pub fn gates_to(&self, peer_name: &str) -> Vec<GateId> {
        self.gates
            .values()
            .filter(|g| g.leads_to(peer_name))
            .map(|g| g.id)
            .collect()
    }

    /// Removes all gates; returns their ids.
    pub fn clear_gates(&mut self) -> Vec<GateId> {
        let ids: Vec<GateId> = self.gates.keys().copied().collect();
        for id in &ids {
            self.unregister_gate(*id);
        }
        ids
    }

    // ===== Links between forwarding nodes =====

    /// Links two forwarding nodes in both directions.
    pub fn connect_multiplexer(&mut self, other: &mut ForwardingNode) {
        self.links.insert(other.id);
        other.links.insert(self.id);
    }

    pub fn unlink(&mut self, other: &mut ForwardingNode) {
        self.links.shift_remove(&other.id);
        other.links.shift_remove(&self.id);
    }

    pub fn is_linked(&self, other: ForwardingNodeId) -> bool {
        self.links.contains(&other)
    }
}
