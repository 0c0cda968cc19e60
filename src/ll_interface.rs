use std::cell::RefCell;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::ll_error::LinkError;

// simulated seconds
pub type SimTime = f64;

// all ids are plain counters handed out by their owning registry
pub type NodeId = u32;
pub type MediumId = u32;
pub type ForwardingNodeId = u32;
pub type GateId = u32;
pub type BindingId = u64;
pub type ConnectionId = u64;
pub type ProcessId = u64;
pub type RequestId = u64;

pub type Name = String;

// opaque placeholder, no real authentication is performed
pub type Signature = u64;

/// Leading payload bytes that bit errors never touch.
pub const PROTECTED_HEADER_BYTES: usize = 64;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Identity {
    pub name: Name,
    pub signature: Signature,
}

impl Identity {
    pub fn new(name: impl Into<Name>) -> Self {
        let name = name.into();
        // stable, cheap stand-in for a signature over the name
        let signature = name
            .bytes()
            .fold(0xcbf2_9ce4_8422_2325u64, |acc, b| {
                (acc ^ b as u64).wrapping_mul(0x0100_0000_01b3)
            });
        Self { name, signature }
    }
}

/// Which end of a connection an endpoint is.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Side {
    /// peer1, the side that called `connect`
    Initiator,
    /// peer2, the side owning the binding
    Acceptor,
}

impl Side {
    pub fn other(self) -> Side {
        match self {
            Side::Initiator => Side::Acceptor,
            Side::Acceptor => Side::Initiator,
        }
    }
}

/// Id-based back reference to a `ConnectionEndPoint`, resolved through the
/// owning `AttachmentLayer`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct EndpointRef {
    pub connection: ConnectionId,
    pub side: Side,
}

impl EndpointRef {
    pub fn new(connection: ConnectionId, side: Side) -> Self {
        Self { connection, side }
    }

    pub fn peer(&self) -> EndpointRef {
        EndpointRef::new(self.connection, self.side.other())
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PacketKind {
    Data,
    /// in-band control traffic, exempt from loss and bit errors
    Signaling,
    /// bookkeeping traffic that must not be disturbed either
    Invisible,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Packet {
    pub kind: PacketKind,
    pub data: Vec<u8>,
    pub corrupted: bool,
}

impl Packet {
    pub fn data(data: Vec<u8>) -> Self {
        Self {
            kind: PacketKind::Data,
            data,
            corrupted: false,
        }
    }

    pub fn signaling(data: Vec<u8>) -> Self {
        Self {
            kind: PacketKind::Signaling,
            data,
            corrupted: false,
        }
    }

    pub fn invisible(data: Vec<u8>) -> Self {
        Self {
            kind: PacketKind::Invisible,
            data,
            corrupted: false,
        }
    }

    /// Size in bytes used for the transmission delay.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn is_special(&self) -> bool {
        matches!(self.kind, PacketKind::Signaling | PacketKind::Invisible)
    }
}

/// QoS requirements for a connection. `None` fields are not constrained.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requirements {
    /// data rate to reserve in kbit/s
    #[serde(default)]
    pub datarate_kbit: Option<u64>,

    /// upper bound for the one-way medium delay in ms
    #[serde(default)]
    pub max_delay_ms: Option<u64>,
}

impl Requirements {
    pub fn best_effort() -> Self {
        Self::default()
    }

    pub fn with_datarate(kbit: u64) -> Self {
        Self {
            datarate_kbit: Some(kbit),
            max_delay_ms: None,
        }
    }

    pub fn is_best_effort(&self) -> bool {
        self.datarate_kbit.is_none() && self.max_delay_ms.is_none()
    }
}

/// What a lower layer advertises about itself.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Capabilities {
    pub delay_ms: u64,
    /// remaining data rate, `None` = infinite
    pub bandwidth_kbit: Option<u64>,
    pub loss_rate: f64,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LayerStatus {
    Operating,
    Disconnected,
    Error,
}

/// Which neighbor announcements an attached entity wants to see.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NeighborFilter {
    All,
    Names(Vec<Name>),
}

impl NeighborFilter {
    pub fn matches(&self, name: &str) -> bool {
        match self {
            NeighborFilter::All => true,
            NeighborFilter::Names(names) => names.iter().any(|n| n == name),
        }
    }
}

/// Notifications an attachment layer hands to the entities attached to it.
/// Delivered in order, synchronously, within the event that caused them.
#[derive(Clone, Debug, PartialEq)]
pub enum LayerEvent {
    NeighborAppeared { node: NodeId, name: Name },
    NeighborDisappeared { node: NodeId, name: Name },
    IncomingConnection { node: NodeId, binding: BindingId, endpoint: EndpointRef },
    Connected { node: NodeId, endpoint: EndpointRef },
    Closed { node: NodeId, endpoint: EndpointRef },
    DataAvailable { node: NodeId, endpoint: EndpointRef },
    LayerConnected { node: NodeId },
    LayerDisconnected { node: NodeId },
    BindingError { node: NodeId, binding: BindingId, error: LinkError },
}

impl LayerEvent {
    pub fn node(&self) -> NodeId {
        match self {
            LayerEvent::NeighborAppeared { node, .. }
            | LayerEvent::NeighborDisappeared { node, .. }
            | LayerEvent::IncomingConnection { node, .. }
            | LayerEvent::Connected { node, .. }
            | LayerEvent::Closed { node, .. }
            | LayerEvent::DataAvailable { node, .. }
            | LayerEvent::LayerConnected { node }
            | LayerEvent::LayerDisconnected { node }
            | LayerEvent::BindingError { node, .. } => *node,
        }
    }
}

/// Capability interface of a lower layer as seen by one attached node.
///
/// `LinkObserver` and `GateConstructionProcess` only talk to this trait, so
/// the link establishment protocol does not care which substrate carries it.
pub trait LowerLayer {
    fn bind(
        &mut self,
        name: &str,
        requirements: Option<&Requirements>,
        identity: &Identity,
    ) -> Result<BindingId, LinkError>;

    fn unbind(&mut self, binding: BindingId) -> bool;

    fn connect(
        &mut self,
        name: &str,
        requirements: Option<&Requirements>,
        identity: &Identity,
    ) -> Result<EndpointRef, LinkError>;

    fn is_known(&self, name: &str) -> bool;

    fn neighbors(&self, filter: Option<&NeighborFilter>) -> Vec<Name>;

    fn capabilities(&self) -> Capabilities;

    fn status(&self) -> LayerStatus;

    /// Start neighbor notifications for this entity.
    fn subscribe(&mut self, filter: NeighborFilter);

    fn unsubscribe(&mut self);

    /// Pops the next queued incoming connection of a binding.
    fn take_incoming(&mut self, binding: BindingId) -> Option<EndpointRef>;

    /// Locally accept (connect) an endpoint.
    fn accept(&mut self, endpoint: EndpointRef) -> Result<(), LinkError>;

    fn write(&mut self, endpoint: EndpointRef, packet: Packet) -> Result<(), LinkError>;

    fn read(&mut self, endpoint: EndpointRef) -> Option<Packet>;

    fn close(&mut self, endpoint: EndpointRef);

    fn is_connected(&self, endpoint: EndpointRef) -> bool;

    /// Identity of whoever sits on the other end of the connection.
    fn peer_identity(&self, endpoint: EndpointRef) -> Option<Identity>;
}

/// Events scheduled on the simulation time line.
#[derive(Clone, Debug, PartialEq)]
pub enum SimEvent {
    /// end of the transmission currently on a medium
    Delivery { medium: MediumId },
    /// deferred "connected" after a broken medium got repaired
    MediumRepaired { medium: MediumId },
    DelayedDiscovery { node: NodeId, medium: MediumId, neighbor: Name },
    /// backup gates to a rediscovered neighbor get looked at again
    RepairCheck { node: NodeId, medium: MediumId, neighbor: Name },
    Reattach { node: NodeId, medium: MediumId },
    SignalingRetry { node: NodeId, medium: MediumId, process: ProcessId },
    SignalingTimeout { node: NodeId, medium: MediumId, process: ProcessId },
}

// ============================================================================
// Event Logging System
// ============================================================================

/// Events emitted by the simulation for debugging and analysis
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// A transmission finished on a medium (delivered or dropped)
    Transmission {
        medium: MediumId,
        started: SimTime,
        size: usize,
        delivered: bool,
        corrupted: bool,
    },
    MediumBroken {
        medium: MediumId,
    },
    MediumRepaired {
        medium: MediumId,
    },
    Attached {
        node: NodeId,
        medium: MediumId,
        name: Name,
    },
    Detached {
        node: NodeId,
        medium: MediumId,
    },
    NeighborDiscovered {
        node: NodeId,
        medium: MediumId,
        neighbor: Name,
        initiator: bool,
    },
    NeighborLost {
        node: NodeId,
        medium: MediumId,
        neighbor: Name,
        removed: usize,
    },
    LayerDisconnected {
        node: NodeId,
        medium: MediumId,
    },
    LayerConnected {
        node: NodeId,
        medium: MediumId,
    },
    ProcessStateChange {
        node: NodeId,
        process: ProcessId,
        from_state: &'static str,
        to_state: &'static str,
    },
    SignalingSent {
        node: NodeId,
        process: ProcessId,
        message: &'static str,
    },
    ProtocolViolation {
        node: NodeId,
        process: ProcessId,
        reason: String,
    },
    GateEstablished {
        node: NodeId,
        medium: MediumId,
        gate: GateId,
        peer_gate: GateId,
    },
    GateRemoved {
        node: NodeId,
        medium: MediumId,
        gate: GateId,
    },
    RequestCompleted {
        node: NodeId,
        requester: RequestId,
        gate: Option<GateId>,
    },
}

/// Trait for consuming events from the simulation
pub trait EventSink {
    fn log(&mut self, time: SimTime, event: Event);
}

/// No-op event sink (zero overhead)
pub struct NoOpSink;

impl EventSink for NoOpSink {
    #[inline(always)]
    fn log(&mut self, _time: SimTime, _event: Event) {}
}

/// Keeps every event; clones share the same buffer so a test can keep one
/// handle while the simulation owns the other.
#[derive(Clone, Default)]
pub struct CollectingSink {
    events: Rc<RefCell<Vec<(SimTime, Event)>>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<(SimTime, Event)> {
        self.events.borrow().clone()
    }

    pub fn count(&self, pred: impl Fn(&Event) -> bool) -> usize {
        self.events.borrow().iter().filter(|(_, e)| pred(e)).count()
    }

    pub fn clear(&self) {
        self.events.borrow_mut().clear();
    }
}

impl EventSink for CollectingSink {
    fn log(&mut self, time: SimTime, event: Event) {
        self.events.borrow_mut().push((time, event));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_signature_is_stable() {
        let a = Identity::new("node_1");
        let b = Identity::new("node_1");
        let c = Identity::new("node_2");

        assert_eq!(a, b);
        assert_ne!(a.signature, c.signature);
    }

    #[test]
    fn test_special_packets() {
        assert!(!Packet::data(vec![1, 2]).is_special());
        assert!(Packet::signaling(vec![]).is_special());
        assert!(Packet::invisible(vec![]).is_special());
    }

    #[test]
    fn test_neighbor_filter() {
        assert!(NeighborFilter::All.matches("anything"));

        let filter = NeighborFilter::Names(vec!["a_1".to_string()]);
        assert!(filter.matches("a_1"));
        assert!(!filter.matches("b_1"));
    }

    #[test]
    fn test_collecting_sink_shares_buffer() {
        let sink = CollectingSink::new();
        let mut handle = sink.clone();

        handle.log(1.0, Event::MediumBroken { medium: 3 });

        assert_eq!(sink.events().len(), 1);
        assert_eq!(sink.count(|e| matches!(e, Event::MediumBroken { .. })), 1);
    }
}
