use std::collections::VecDeque;

use indexmap::IndexMap;
use log::{debug, trace, warn};

use crate::ll_connection::Connection;
use crate::ll_error::LinkError;
use crate::ll_interface::{
    BindingId, Capabilities, ConnectionId, EndpointRef, Identity, LayerEvent, LayerStatus,
    LowerLayer, Name, NeighborFilter, NodeId, Packet, Requirements, Side,
};
use crate::ll_medium::{BrokenTransition, Delivery, Medium};

// ============================================================================
// Bindings and entities
// ============================================================================

/// A name under which a node is reachable on the medium.
#[derive(Debug)]
pub struct Binding {
    pub id: BindingId,
    pub name: Name,
    pub owner: NodeId,
    pub requirements: Option<Requirements>,
    pub identity: Identity,
    /// false once closed; kept until no connection references it anymore
    pub active: bool,
    incoming: VecDeque<EndpointRef>,
}

#[derive(Debug, Default)]
struct Entity {
    /// `None` until the node subscribes to neighbor notifications
    filter: Option<NeighborFilter>,
}

// ============================================================================
// AttachmentLayer
// ============================================================================

/// Registry of bindings and connections of one medium.
///
/// Notifications for attached nodes are collected in an outbox and handed out
/// in order by `next_event`; the layer never calls into a node directly.
pub struct AttachmentLayer {
    medium: Medium,
    entities: IndexMap<NodeId, Entity>,
    bindings: IndexMap<BindingId, Binding>,
    // registration order drives round-robin transmission
    connections: IndexMap<ConnectionId, Connection>,
    next_binding: BindingId,
    next_connection: ConnectionId,
    rr_cursor: usize,
    outbox: VecDeque<LayerEvent>,
    deleted: bool,
}

impl AttachmentLayer {
    pub fn new(medium: Medium) -> Self {
        Self {
            medium,
            entities: IndexMap::new(),
            bindings: IndexMap::new(),
            connections: IndexMap::new(),
            next_binding: 1,
            next_connection: 1,
            rr_cursor: 0,
            outbox: VecDeque::new(),
            deleted: false,
        }
    }

    pub fn medium(&self) -> &Medium {
        &self.medium
    }

    pub fn medium_mut(&mut self) -> &mut Medium {
        &mut self.medium
    }

    pub fn entity(&mut self, node: NodeId) -> BusEntity<'_> {
        BusEntity { layer: self, node }
    }

    pub fn next_event(&mut self) -> Option<LayerEvent> {
        self.outbox.pop_front()
    }

    pub fn has_events(&self) -> bool {
        !self.outbox.is_empty()
    }

    // ===== Entities =====

    pub fn attach(&mut self, node: NodeId) -> Result<(), LinkError> {
        if self.deleted {
            return Err(LinkError::MediumDeleted);
        }
        self.entities.entry(node).or_default();
        Ok(())
    }

    pub fn is_attached(&self, node: NodeId) -> bool {
        self.entities.contains_key(&node)
    }

    pub fn attached_nodes(&self) -> Vec<NodeId> {
        self.entities.keys().copied().collect()
    }

    /// Removes a node: closes its endpoints and releases its bindings.
    pub fn detach(&mut self, node: NodeId) {
        if !self.entities.contains_key(&node) {
            return;
        }
        self.unsubscribe(node);

        let endpoints: Vec<EndpointRef> = self
            .connections
            .values()
            .flat_map(|conn| {
                [Side::Initiator, Side::Acceptor]
                    .into_iter()
                    .filter(|side| conn.endpoint(*side).entity == node)
                    .map(|side| EndpointRef::new(conn.id, side))
                    .collect::<Vec<_>>()
            })
            .collect();
        for endpoint in endpoints {
            self.close(endpoint);
        }

        let owned: Vec<BindingId> = self
            .bindings
            .values()
            .filter(|b| b.owner == node && b.active)
            .map(|b| b.id)
            .collect();
        for binding in owned {
            self.unbind(binding);
        }

        self.entities.shift_remove(&node);
        debug!("node {} detached from {}", node, self.medium.name());
    }

    pub fn subscribe(&mut self, node: NodeId, filter: NeighborFilter) {
        if let Some(entity) = self.entities.get_mut(&node) {
            entity.filter = Some(filter);
        }
    }

    pub fn unsubscribe(&mut self, node: NodeId) {
        if let Some(entity) = self.entities.get_mut(&node) {
            entity.filter = None;
        }
    }

    // ===== Bindings =====

    pub fn bind(
        &mut self,
        node: NodeId,
        name: &str,
        requirements: Option<&Requirements>,
        identity: &Identity,
    ) -> Result<BindingId, LinkError> {
        if self.deleted {
            return Err(LinkError::MediumDeleted);
        }
        if !self.entities.contains_key(&node) {
            return Err(LinkError::NotAttached);
        }
        if name.is_empty() {
            return Err(LinkError::InvalidName);
        }
        if self.find_binding(name).is_some() {
            return Err(LinkError::NameInUse(name.to_string()));
        }

        let id = self.next_binding;
        self.next_binding += 1;

        self.bindings.insert(
            id,
            Binding {
                id,
                name: name.to_string(),
                owner: node,
                requirements: requirements.copied(),
                identity: identity.clone(),
                active: true,
                incoming: VecDeque::new(),
            },
        );
        debug!("{} bound '{}' ({})", self.medium.name(), name, id);

        self.announce(node, name, true);
        Ok(id)
    }

    /// Closes a binding. Returns false if it was not active.
    pub fn unbind(&mut self, binding: BindingId) -> bool {
        let (owner, name) = match self.bindings.get_mut(&binding) {
            Some(b) if b.active => {
                b.active = false;
                b.incoming.clear();
                (b.owner, b.name.clone())
            }
            _ => return false,
        };
        debug!("{} unbound '{}'", self.medium.name(), name);

        self.drop_binding_if_unused(binding);
        self.announce(owner, &name, false);
        true
    }

    // fan-out to every other subscribed entity whose filter matches
    fn announce(&mut self, origin: NodeId, name: &str, appeared: bool) {
        for (node, entity) in &self.entities {
            if *node == origin {
                continue;
            }
            let matches = entity.filter.as_ref().map(|f| f.matches(name)).unwrap_or(false);
            if !matches {
                continue;
            }
            let name = name.to_string();
            self.outbox.push_back(if appeared {
                LayerEvent::NeighborAppeared { node: *node, name }
            } else {
                LayerEvent::NeighborDisappeared { node: *node, name }
            });
        }
    }

    fn find_binding(&self, name: &str) -> Option<&Binding> {
        self.bindings.values().find(|b| b.active && b.name == name)
    }

    pub fn binding(&self, binding: BindingId) -> Option<&Binding> {
        self.bindings.get(&binding)
    }

    fn drop_binding_if_unused(&mut self, binding: BindingId) {
        let inactive = self.bindings.get(&binding).map(|b| !b.active).unwrap_or(false);
        let referenced = self.connections.values().any(|c| c.binding == binding);
        if inactive && !referenced {
            self.bindings.shift_remove(&binding);
        }
    }

    pub fn is_known(&self, name: &str) -> bool {
        self.find_binding(name).is_some()
    }

    /// Names of active bindings owned by other nodes.
    pub fn neighbors(&self, node: NodeId, filter: Option<&NeighborFilter>) -> Vec<Name> {
        self.bindings
            .values()
            .filter(|b| b.active && b.owner != node)
            .filter(|b| filter.map(|f| f.matches(&b.name)).unwrap_or(true))
            .map(|b| b.name.clone())
            .collect()
    }

    // ===== Connections =====

    pub fn connect(
        &mut self,
        node: NodeId,
        name: &str,
        requirements: Option<&Requirements>,
        identity: &Identity,
    ) -> Result<EndpointRef, LinkError> {
        if self.deleted {
            return Err(LinkError::MediumDeleted);
        }
        if self.medium.is_broken() {
            return Err(LinkError::MediumBroken);
        }

        let (binding, owner, default_requirements) = match self.find_binding(name) {
            Some(b) => (b.id, b.owner, b.requirements),
            None => return Err(LinkError::NameUnknown(name.to_string())),
        };
        let requirements = requirements
            .copied()
            .or(default_requirements)
            .unwrap_or_default();

        self.medium.reserve(&requirements)?;

        let id = self.next_connection;
        self.next_connection += 1;

        let mut conn = Connection::new(
            id,
            binding,
            name.to_string(),
            requirements,
            Some(identity.clone()),
            node,
            owner,
        );
        conn.connect(Side::Initiator, false);
        self.connections.insert(id, conn);

        let incoming = EndpointRef::new(id, Side::Acceptor);
        if let Some(b) = self.bindings.get_mut(&binding) {
            b.incoming.push_back(incoming);
        }
        self.outbox.push_back(LayerEvent::IncomingConnection {
            node: owner,
            binding,
            endpoint: incoming,
        });

        trace!("{} connection {} to '{}'", self.medium.name(), id, name);
        Ok(EndpointRef::new(id, Side::Initiator))
    }

    pub fn connection(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn take_incoming(&mut self, binding: BindingId) -> Option<EndpointRef> {
        self.bindings.get_mut(&binding)?.incoming.pop_front()
    }

    pub fn accept(&mut self, endpoint: EndpointRef) -> Result<(), LinkError> {
        let broken = self.medium.is_broken();
        let conn = self
            .connections
            .get_mut(&endpoint.connection)
            .ok_or(LinkError::ConnectionClosed)?;

        for side in conn.connect(endpoint.side, broken) {
            self.outbox.push_back(LayerEvent::Connected {
                node: conn.endpoint(side).entity,
                endpoint: EndpointRef::new(conn.id, side),
            });
        }
        Ok(())
    }

    /// Closing twice is a no-op.
    pub fn close(&mut self, endpoint: EndpointRef) {
        let broken = self.medium.is_broken();
        let conn = match self.connections.get_mut(&endpoint.connection) {
            Some(conn) => conn,
            None => return,
        };

        let outcome = conn.close(endpoint.side, broken);
        for side in &outcome.closed {
            self.outbox.push_back(LayerEvent::Closed {
                node: conn.endpoint(*side).entity,
                endpoint: EndpointRef::new(conn.id, *side),
            });
        }

        if outcome.release {
            let requirements = conn.requirements;
            let binding = conn.binding;
            self.medium.free(&requirements);
            self.remove_connection(endpoint.connection);
            self.drop_binding_if_unused(binding);
        }
    }

    fn remove_connection(&mut self, id: ConnectionId) {
        if let Some((index, _, _)) = self.connections.shift_remove_full(&id) {
            if index < self.rr_cursor {
                self.rr_cursor -= 1;
            }
        }
    }

    pub fn is_connected(&self, endpoint: EndpointRef) -> bool {
        self.connections
            .get(&endpoint.connection)
            .map(|c| c.endpoint(endpoint.side).is_locally_connected())
            .unwrap_or(false)
    }

    /// The binding's identity for the initiator, the requester for the acceptor.
    pub fn peer_identity(&self, endpoint: EndpointRef) -> Option<Identity> {
        let conn = self.connections.get(&endpoint.connection)?;
        match endpoint.side {
            Side::Initiator => self.bindings.get(&conn.binding).map(|b| b.identity.clone()),
            Side::Acceptor => conn.requester.clone(),
        }
    }

    pub fn write(&mut self, endpoint: EndpointRef, packet: Packet) -> Result<(), LinkError> {
        if self.deleted {
            return Err(LinkError::MediumDeleted);
        }
        self.connections
            .get_mut(&endpoint.connection)
            .ok_or(LinkError::NotConnected)?
            .write(endpoint.side, packet)?;

        self.packet_available();
        Ok(())
    }

    pub fn read(&mut self, endpoint: EndpointRef) -> Option<Packet> {
        self.connections.get_mut(&endpoint.connection)?.read(endpoint.side)
    }

    // ===== Transmission =====

    /// Hands the next queued packet to the medium if it is idle.
    pub fn packet_available(&mut self) {
        self.select_next_packet();
    }

    // round-robin over connections, starting after the one served last
    fn select_next_packet(&mut self) {
        if self.medium.is_busy() || self.medium.is_broken() {
            return;
        }

        let count = self.connections.len();
        for offset in 0..count {
            let index = (self.rr_cursor + offset) % count;
            let Some((_, conn)) = self.connections.get_index_mut(index) else {
                continue;
            };
            let Some(side) = conn.pick_sender(None) else {
                continue;
            };
            let Some(packet) = conn.pop_outbound(side) else {
                continue;
            };

            let dest = EndpointRef::new(conn.id, side.other());
            match self.medium.transmit(packet.clone(), dest) {
                Ok(true) => {
                    self.rr_cursor = index + 1;
                }
                Ok(false) | Err(_) => {
                    conn.requeue_front(side, packet);
                }
            }
            return;
        }
    }

    /// Finishes the transmission in flight and starts the next one.
    pub fn on_delivery(&mut self) -> Option<Delivery> {
        let mut delivery = self.medium.complete_transmission()?;

        if let Some(packet) = delivery.packet.take() {
            let dest = delivery.dest;
            match self.connections.get_mut(&dest.connection) {
                Some(conn) if conn.endpoint(dest.side).is_locally_connected() => {
                    conn.deliver(dest.side, packet.clone());
                    self.outbox.push_back(LayerEvent::DataAvailable {
                        node: conn.endpoint(dest.side).entity,
                        endpoint: dest,
                    });
                }
                _ => trace!("{} discards packet for closed endpoint", self.medium.name()),
            }
            delivery.packet = Some(packet);
        }

        self.select_next_packet();
        Some(delivery)
    }

    // ===== Medium state =====

    pub fn set_broken(&mut self, broken: bool) -> BrokenTransition {
        let transition = self.medium.set_broken(broken);
        if transition == BrokenTransition::Broke {
            for node in self.entities.keys() {
                self.outbox.push_back(LayerEvent::LayerDisconnected { node: *node });
            }
        }
        transition
    }

    /// Deferred part of a repair. Returns false if the medium broke again in
    /// the meantime.
    pub fn on_repaired(&mut self) -> bool {
        if self.medium.is_broken() || self.deleted {
            return false;
        }
        for node in self.entities.keys() {
            self.outbox.push_back(LayerEvent::LayerConnected { node: *node });
        }
        self.select_next_packet();
        true
    }

    /// Marks the medium as deleted. Every active binding gets an error and the
    /// attached nodes are returned so the caller can detach them.
    pub fn delete(&mut self) -> Vec<NodeId> {
        if self.deleted {
            return Vec::new();
        }
        warn!("medium {} deleted", self.medium.name());

        self.deleted = true;
        self.medium.abort_transmission();
        self.medium.set_broken(true);

        for binding in self.bindings.values().filter(|b| b.active) {
            self.outbox.push_back(LayerEvent::BindingError {
                node: binding.owner,
                binding: binding.id,
                error: LinkError::MediumDeleted,
            });
        }
        self.attached_nodes()
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub fn status(&self) -> LayerStatus {
        if self.deleted {
            LayerStatus::Error
        } else if self.medium.is_broken() {
            LayerStatus::Disconnected
        } else {
            LayerStatus::Operating
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        self.medium.capabilities()
    }
}

// ============================================================================
// BusEntity
// ============================================================================

/// One node's view onto a simulated medium.
pub struct BusEntity<'a> {
    layer: &'a mut AttachmentLayer,
    node: NodeId,
}

impl<'a> BusEntity<'a> {
    pub fn node(&self) -> NodeId {
        self.node
    }
}

impl<'a> LowerLayer for BusEntity<'a> {
    fn bind(
        &mut self,
        name: &str,
        requirements: Option<&Requirements>,
        identity: &Identity,
    ) -> Result<BindingId, LinkError> {
        self.layer.bind(self.node, name, requirements, identity)
    }

    fn unbind(&mut self, binding: BindingId) -> bool {
        match self.layer.binding(binding) {
            Some(b) if b.owner == self.node => self.layer.unbind(binding),
            _ => false,
        }
    }

    fn connect(
        &mut self,
        name: &str,
        requirements: Option<&Requirements>,
        identity: &Identity,
    ) -> Result<EndpointRef, LinkError> {
        self.layer.connect(self.node, name, requirements, identity)
    }

    fn is_known(&self, name: &str) -> bool {
        self.layer.is_known(name)
    }

    fn neighbors(&self, filter: Option<&NeighborFilter>) -> Vec<Name> {
        self.layer.neighbors(self.node, filter)
    }

    fn capabilities(&self) -> Capabilities {
        self.layer.capabilities()
    }

    fn status(&self) -> LayerStatus {
        self.layer.status()
    }

    fn subscribe(&mut self, filter: NeighborFilter) {
        self.layer.subscribe(self.node, filter);
    }

    fn unsubscribe(&mut self) {
        self.layer.unsubscribe(self.node);
    }

    fn take_incoming(&mut self, binding: BindingId) -> Option<EndpointRef> {
        self.layer.take_incoming(binding)
    }

    fn accept(&mut self, endpoint: EndpointRef) -> Result<(), LinkError> {
        self.layer.accept(endpoint)
    }

    fn write(&mut self, endpoint: EndpointRef, packet: Packet) -> Result<(), LinkError> {
        self.layer.write(endpoint, packet)
    }

    fn read(&mut self, endpoint: EndpointRef) -> Option<Packet> {
        self.layer.read(endpoint)
    }

    fn close(&mut self, endpoint: EndpointRef) {
        self.layer.close(endpoint);
    }

    fn is_connected(&self, endpoint: EndpointRef) -> bool {
        self.layer.is_connected(endpoint)
    }

    fn peer_identity(&self, endpoint: EndpointRef) -> Option<Identity> {
        self.layer.peer_identity(endpoint)
    }
}
