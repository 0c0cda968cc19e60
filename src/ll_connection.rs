use std::collections::VecDeque;

use crate::ll_error::LinkError;
use crate::ll_interface::{BindingId, ConnectionId, Identity, Name, NodeId, Packet, Requirements, Side};

/// One end of a `Connection`.
#[derive(Debug)]
pub struct ConnectionEndPoint {
    /// node that holds this end
    pub entity: NodeId,
    locally_connected: bool,
    outbound: VecDeque<Packet>,
    inbound: VecDeque<Packet>,
}

impl ConnectionEndPoint {
    fn new(entity: NodeId) -> Self {
        Self {
            entity,
            locally_connected: false,
            outbound: VecDeque::new(),
            inbound: VecDeque::new(),
        }
    }

    pub fn is_locally_connected(&self) -> bool {
        self.locally_connected
    }

    pub fn has_outbound(&self) -> bool {
        !self.outbound.is_empty()
    }

    pub fn inbound_len(&self) -> usize {
        self.inbound.len()
    }
}

/// What `Connection::close` changed.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct CloseOutcome {
    /// sides that went from connected to closed, in closing order
    pub closed: Vec<Side>,
    /// true if no side is connected anymore and the reservation made for
    /// the connection has to be returned (reported once)
    pub release: bool,
}

/// A link instance on a medium between an initiator (peer1) and the owner of
/// a binding (peer2).
#[derive(Debug)]
pub struct Connection {
    pub id: ConnectionId,
    pub binding: BindingId,
    pub binding_name: Name,
    pub requirements: Requirements,
    /// who asked for the connection, used to authenticate the initiator
    pub requester: Option<Identity>,
    peer1: ConnectionEndPoint,
    peer2: ConnectionEndPoint,
    released: bool,
}

impl Connection {
    pub fn new(
        id: ConnectionId,
        binding: BindingId,
        binding_name: Name,
        requirements: Requirements,
        requester: Option<Identity>,
        initiator: NodeId,
        acceptor: NodeId,
    ) -> Self {
        Self {
            id,
            binding,
            binding_name,
            requirements,
            requester,
            peer1: ConnectionEndPoint::new(initiator),
            peer2: ConnectionEndPoint::new(acceptor),
            released: false,
        }
    }

    pub fn endpoint(&self, side: Side) -> &ConnectionEndPoint {
        match side {
            Side::Initiator => &self.peer1,
            Side::Acceptor => &self.peer2,
        }
    }

    fn endpoint_mut(&mut self, side: Side) -> &mut ConnectionEndPoint {
        match side {
            Side::Initiator => &mut self.peer1,
            Side::Acceptor => &mut self.peer2,
        }
    }

    pub fn is_established(&self) -> bool {
        self.peer1.locally_connected && self.peer2.locally_connected
    }

    pub fn has_packet(&self) -> bool {
        self.peer1.has_outbound() || self.peer2.has_outbound()
    }

    /// Side whose queue should be served next. Without a hint peer1 is
    /// checked before peer2.
    pub fn pick_sender(&self, hint: Option<Side>) -> Option<Side> {
        if let Some(side) = hint {
            if self.endpoint(side).has_outbound() {
                return Some(side);
            }
        }

        if self.peer1.has_outbound() {
            Some(Side::Initiator)
        } else if self.peer2.has_outbound() {
            Some(Side::Acceptor)
        } else {
            None
        }
    }

    pub fn pop_outbound(&mut self, side: Side) -> Option<Packet> {
        self.endpoint_mut(side).outbound.pop_front()
    }

    /// Puts a packet back at the head of the queue, e.g. if the medium
    /// refused it.
    pub fn requeue_front(&mut self, side: Side, packet: Packet) {
        self.endpoint_mut(side).outbound.push_front(packet);
    }

    /// Locally connects `side`. Returns the sides that now observe
    /// "connected": the peer first (if it was waiting for us), then `side`.
    ///
    /// While the medium is broken the peer is not told about the accept.
    pub fn connect(&mut self, side: Side, medium_broken: bool) -> Vec<Side> {
        let mut notify = Vec::new();
        if self.endpoint(side).locally_connected {
            return notify;
        }
        self.endpoint_mut(side).locally_connected = true;

        if !medium_broken && self.endpoint(side.other()).locally_connected {
            notify.push(side.other());
        }
        if self.is_established() {
            notify.push(side);
        }

        notify
    }

    /// Closes `side` and, unless the medium is broken, the still open peer.
    /// Closing twice is a no-op.
    pub fn close(&mut self, side: Side, medium_broken: bool) -> CloseOutcome {
        let mut outcome = CloseOutcome::default();

        if self.close_one(side) {
            outcome.closed.push(side);
        }
        if !medium_broken && self.close_one(side.other()) {
            outcome.closed.push(side.other());
        }

        if self.is_idle() && !self.released {
            self.released = true;
            outcome.release = true;
        }

        outcome
    }

    fn close_one(&mut self, side: Side) -> bool {
        let endpoint = self.endpoint_mut(side);
        if !endpoint.locally_connected {
            return false;
        }
        endpoint.locally_connected = false;
        endpoint.outbound.clear();
        true
    }

    /// Queues `packet` for transmission from `side`.
    pub fn write(&mut self, side: Side, packet: Packet) -> Result<(), LinkError> {
        if !self.endpoint(side).locally_connected {
            return Err(LinkError::NotConnected);
        }
        if !self.is_established() {
            return Err(LinkError::ConnectionClosed);
        }
        self.endpoint_mut(side).outbound.push_back(packet);
        Ok(())
    }

    pub fn deliver(&mut self, side: Side, packet: Packet) {
        self.endpoint_mut(side).inbound.push_back(packet);
    }

    pub fn read(&mut self, side: Side) -> Option<Packet> {
        self.endpoint_mut(side).inbound.pop_front()
    }

    /// Neither side is connected anymore.
    pub fn is_idle(&self) -> bool {
        !self.peer1.locally_connected && !self.peer2.locally_connected
    }

    pub fn is_released(&self) -> bool {
        self.released
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection() -> Connection {
        Connection::new(
            1,
            7,
            "b_1".to_string(),
            Requirements::best_effort(),
            Some(Identity::new("a_1")),
            10,
            20,
        )
    }

    #[test]
    fn test_handshake_notifies_both_once_established() {
        let mut conn = connection();

        // initiator connects first, acceptor is not there yet
        assert!(conn.connect(Side::Initiator, false).is_empty());
        assert!(!conn.is_established());

        assert_eq!(
            conn.connect(Side::Acceptor, false),
            vec![Side::Initiator, Side::Acceptor]
        );
        assert!(conn.is_established());

        // repeated connect changes nothing
        assert!(conn.connect(Side::Acceptor, false).is_empty());
    }

    #[test]
    fn test_write_requires_connection() {
        let mut conn = connection();
        assert_eq!(
            conn.write(Side::Initiator, Packet::data(vec![1])),
            Err(LinkError::NotConnected)
        );

        conn.connect(Side::Initiator, false);
        assert_eq!(
            conn.write(Side::Initiator, Packet::data(vec![1])),
            Err(LinkError::ConnectionClosed)
        );

        conn.connect(Side::Acceptor, false);
        conn.write(Side::Initiator, Packet::data(vec![1])).unwrap();
        assert!(conn.has_packet());
    }

    #[test]
    fn test_sender_tie_break() {
        let mut conn = connection();
        conn.connect(Side::Initiator, false);
        conn.connect(Side::Acceptor, false);

        conn.write(Side::Acceptor, Packet::data(vec![2])).unwrap();
        conn.write(Side::Initiator, Packet::data(vec![1])).unwrap();

        assert_eq!(conn.pick_sender(None), Some(Side::Initiator));
        assert_eq!(conn.pick_sender(Some(Side::Acceptor)), Some(Side::Acceptor));

        conn.pop_outbound(Side::Initiator);
        assert_eq!(conn.pick_sender(None), Some(Side::Acceptor));
    }

    #[test]
    fn test_close_drains_pair_and_is_idempotent() {
        let mut conn = connection();
        conn.connect(Side::Initiator, false);
        conn.connect(Side::Acceptor, false);

        let first = conn.close(Side::Acceptor, false);
        assert_eq!(first.closed, vec![Side::Acceptor, Side::Initiator]);
        assert!(first.release);
        assert!(conn.is_idle());

        let second = conn.close(Side::Acceptor, false);
        assert_eq!(second, CloseOutcome::default());
        assert!(conn.is_released());
    }

    #[test]
    fn test_close_on_broken_medium_keeps_peer() {
        let mut conn = connection();
        conn.connect(Side::Initiator, false);
        conn.connect(Side::Acceptor, false);

        let outcome = conn.close(Side::Initiator, true);
        assert_eq!(outcome.closed, vec![Side::Initiator]);
        assert!(!outcome.release);
        assert!(conn.endpoint(Side::Acceptor).is_locally_connected());

        // resources go back once the last side is closed
        let later = conn.close(Side::Acceptor, false);
        assert_eq!(later.closed, vec![Side::Acceptor]);
        assert!(later.release);
        assert!(!conn.close(Side::Acceptor, false).release);
    }

    #[test]
    fn test_unaccepted_close_releases() {
        let mut conn = connection();
        conn.connect(Side::Initiator, false);

        let outcome = conn.close(Side::Initiator, false);
        assert_eq!(outcome.closed, vec![Side::Initiator]);
        assert!(outcome.release);
    }
}
