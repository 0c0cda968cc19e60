use std::cell::RefCell;
use std::rc::Rc;

use indexmap::IndexMap;
use log::{debug, info};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

use crate::ll_config::SimulationConfig;
use crate::ll_error::LinkError;
use crate::ll_gate::{ForwardingNode, Gate};
use crate::ll_interface::{
    Event, EventSink, ForwardingNodeId, Identity, MediumId, Name, NodeId, NoOpSink, Packet,
    RequestId, Requirements, SimEvent, SimTime,
};
use crate::ll_layer::AttachmentLayer;
use crate::ll_medium::{BrokenTransition, Medium, MediumConfig};
use crate::ll_naming::{NameMappingService, NamingScope};
use crate::ll_observer::{LinkObserver, NodeContext};
use crate::ll_scheduler::SimScheduler;

/// A simulated node: its central forwarding node plus one observer per
/// attached medium.
pub struct SimNode {
    pub id: NodeId,
    pub name: Name,
    pub identity: Identity,
    central: ForwardingNode,
    observers: IndexMap<MediumId, LinkObserver>,
}

impl SimNode {
    pub fn central(&self) -> &ForwardingNode {
        &self.central
    }

    pub fn observer(&self, medium: MediumId) -> Option<&LinkObserver> {
        self.observers.get(&medium)
    }
}

/// Owns every component of one simulation run and drives the event loop.
///
/// Components refer to each other by id only; all cross-component calls go
/// through here.
pub struct Simulation {
    config: SimulationConfig,
    scheduler: SimScheduler,
    media: IndexMap<MediumId, AttachmentLayer>,
    nodes: IndexMap<NodeId, SimNode>,
    naming: Rc<RefCell<NameMappingService<ForwardingNodeId>>>,
    sink: Box<dyn EventSink>,
    rng: StdRng,
    next_medium: MediumId,
    next_node: NodeId,
    next_forwarding_node: ForwardingNodeId,
    next_request: RequestId,
}

impl Simulation {
    /// Create a simulation with default NoOpSink
    pub fn new(config: SimulationConfig) -> Self {
        Self::new_with_sink(config, Box::new(NoOpSink))
    }

    /// Create a simulation with a custom event sink for debugging/analysis
    pub fn new_with_sink(config: SimulationConfig, sink: Box<dyn EventSink>) -> Self {
        let naming = Rc::new(RefCell::new(NameMappingService::new("simulation")));
        Self::new_with_naming(config, sink, naming)
    }

    /// Uses `naming` as name service; it may delegate to a parent service.
    pub fn new_with_naming(
        config: SimulationConfig,
        sink: Box<dyn EventSink>,
        naming: Rc<RefCell<NameMappingService<ForwardingNodeId>>>,
    ) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Self {
            config,
            scheduler: SimScheduler::new(),
            media: IndexMap::new(),
            nodes: IndexMap::new(),
            naming,
            sink,
            rng,
            next_medium: 1,
            next_node: 1,
            next_forwarding_node: 1,
            next_request: 1,
        }
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    pub fn now(&self) -> SimTime {
        self.scheduler.now()
    }

    pub fn scheduler(&self) -> &SimScheduler {
        &self.scheduler
    }

    pub fn naming(&self) -> Rc<RefCell<NameMappingService<ForwardingNodeId>>> {
        Rc::clone(&self.naming)
    }

    // ===== Topology =====

    /// Adds a medium; `None` uses the configured default medium parameters.
    pub fn add_medium(&mut self, name: &str, config: Option<MediumConfig>) -> MediumId {
        let id = self.next_medium;
        self.next_medium += 1;

        let config = config.unwrap_or_else(|| self.config.medium.clone());
        let medium = Medium::new(id, name, config, self.scheduler.clone(), self.rng.next_u64());
        self.media.insert(id, AttachmentLayer::new(medium));
        debug!("medium {} '{}' added", id, name);
        id
    }

    pub fn add_node(&mut self, name: &str) -> NodeId {
        let id = self.next_node;
        self.next_node += 1;

        let central_id = self.allocate_forwarding_node();
        self.naming
            .borrow_mut()
            .register(name, central_id, NamingScope::Global);

        self.nodes.insert(
            id,
            SimNode {
                id,
                name: name.to_string(),
                identity: Identity::new(name),
                central: ForwardingNode::new(central_id, name),
                observers: IndexMap::new(),
            },
        );
        id
    }

    fn allocate_forwarding_node(&mut self) -> ForwardingNodeId {
        let id = self.next_forwarding_node;
        self.next_forwarding_node += 1;
        id
    }

    pub fn node(&self, node: NodeId) -> Option<&SimNode> {
        self.nodes.get(&node)
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.keys().copied().collect()
    }

    pub fn medium(&self, medium: MediumId) -> Option<&Medium> {
        self.media.get(&medium).map(|layer| layer.medium())
    }

    pub fn medium_mut(&mut self, medium: MediumId) -> Option<&mut Medium> {
        self.media.get_mut(&medium).map(|layer| layer.medium_mut())
    }

    pub fn medium_ids(&self) -> Vec<MediumId> {
        self.media.keys().copied().collect()
    }

    pub fn layer(&self, medium: MediumId) -> Option<&AttachmentLayer> {
        self.media.get(&medium)
    }

    pub fn observer(&self, node: NodeId, medium: MediumId) -> Option<&LinkObserver> {
        self.nodes.get(&node)?.observers.get(&medium)
    }

    pub fn observer_mut(&mut self, node: NodeId, medium: MediumId) -> Option<&mut LinkObserver> {
        self.nodes.get_mut(&node)?.observers.get_mut(&medium)
    }

    /// Gates of a node's multiplexer on one medium.
    pub fn gates(&self, node: NodeId, medium: MediumId) -> Vec<Gate> {
        self.observer(node, medium)
            .and_then(|o| o.mux())
            .map(|mux| mux.gates().cloned().collect())
            .unwrap_or_default()
    }

    // ===== Dispatch =====

    fn with_observer<R>(
        &mut self,
        node: NodeId,
        medium: MediumId,
        f: impl FnOnce(&mut LinkObserver, &mut NodeContext) -> R,
    ) -> Option<R> {
        let layer = self.media.get_mut(&medium)?;
        let sim_node = self.nodes.get_mut(&node)?;
        let observer = sim_node.observers.get_mut(&medium)?;
        let mut naming = self.naming.borrow_mut();
        let mut entity = layer.entity(node);

        let mut ctx = NodeContext {
            layer: &mut entity,
            central: &mut sim_node.central,
            naming: &mut *naming,
            scheduler: &self.scheduler,
            sink: &mut *self.sink,
        };
        Some(f(observer, &mut ctx))
    }

    /// Hands all queued notifications of a medium to the addressed observers,
    /// in order.
    fn pump(&mut self, medium: MediumId) {
        loop {
            let Some(event) = self.media.get_mut(&medium).and_then(|l| l.next_event()) else {
                break;
            };
            let node = event.node();
            self.with_observer(node, medium, |observer, ctx| {
                observer.handle_layer_event(ctx, event)
            });
        }
    }

    // ===== Operations =====

    /// Attaches a node to a medium, creating its observer on first use.
    pub fn attach(&mut self, node: NodeId, medium: MediumId) -> Result<(), LinkError> {
        if !self.nodes.contains_key(&node) {
            return Err(LinkError::NotAttached);
        }
        let layer = self.media.get_mut(&medium).ok_or(LinkError::MediumDeleted)?;
        layer.attach(node)?;

        if self.observer(node, medium).is_none() {
            let mux_id = self.allocate_forwarding_node();
            let seed = self.rng.next_u64();
            let link = self.config.link.clone();
            if let Some(sim_node) = self.nodes.get_mut(&node) {
                let observer = LinkObserver::new(node, medium, &sim_node.name, mux_id, link, seed);
                sim_node.observers.insert(medium, observer);
            }
        }

        let result = self
            .with_observer(node, medium, |observer, ctx| observer.attach(ctx))
            .unwrap_or(Err(LinkError::NotAttached));
        self.pump(medium);
        result
    }

    pub fn detach(&mut self, node: NodeId, medium: MediumId) {
        self.with_observer(node, medium, |observer, ctx| {
            observer.disable_reattach(ctx);
            observer.detach(ctx);
        });
        if let Some(layer) = self.media.get_mut(&medium) {
            layer.detach(node);
        }
        self.pump(medium);
    }

    pub fn enable_reattach(&mut self, node: NodeId, medium: MediumId) {
        self.with_observer(node, medium, |observer, ctx| observer.enable_reattach(ctx));
    }

    /// Node outage: wipes forwarding state on all media, bindings survive.
    pub fn node_outage(&mut self, node: NodeId) {
        let media: Vec<MediumId> = match self.nodes.get(&node) {
            Some(sim_node) => sim_node.observers.keys().copied().collect(),
            None => return,
        };
        info!("node {} outage", node);
        for medium in media {
            self.with_observer(node, medium, |observer, ctx| observer.wipe(ctx));
            self.pump(medium);
        }
    }

    /// Restores a node after an outage; reports the first failure.
    pub fn repair_node(&mut self, node: NodeId) -> Result<(), LinkError> {
        let media: Vec<MediumId> = match self.nodes.get(&node) {
            Some(sim_node) => sim_node.observers.keys().copied().collect(),
            None => return Err(LinkError::NotAttached),
        };
        let mut result = Ok(());
        for medium in media {
            let outcome = self
                .with_observer(node, medium, |observer, ctx| observer.repair(ctx))
                .unwrap_or(Err(LinkError::MediumDeleted));
            self.pump(medium);
            if result.is_ok() {
                result = outcome;
            }
        }
        result
    }

    pub fn set_medium_broken(&mut self, medium: MediumId, broken: bool) -> Result<BrokenTransition, LinkError> {
        let layer = self.media.get_mut(&medium).ok_or(LinkError::MediumDeleted)?;
        let transition = layer.set_broken(broken);
        if transition == BrokenTransition::Broke {
            self.sink.log(self.scheduler.now(), Event::MediumBroken { medium });
        }
        self.pump(medium);
        Ok(transition)
    }

    /// Deletes a medium: bindings are errored, every node is detached.
    pub fn remove_medium(&mut self, medium: MediumId) {
        let nodes = match self.media.get_mut(&medium) {
            Some(layer) => layer.delete(),
            None => return,
        };
        self.sink.log(self.scheduler.now(), Event::MediumBroken { medium });
        self.pump(medium);

        for node in nodes {
            self.detach(node, medium);
            if let Some(sim_node) = self.nodes.get_mut(&node) {
                sim_node.observers.shift_remove(&medium);
            }
        }
        self.media.shift_remove(&medium);
    }

    /// Asks `node` for a gate to `peer` on `medium`. The outcome is reported
    /// as `Event::RequestCompleted` with the returned id.
    pub fn request_gate(
        &mut self,
        node: NodeId,
        medium: MediumId,
        peer: &str,
        requirements: Requirements,
    ) -> Result<RequestId, LinkError> {
        let requester = self.next_request;
        self.next_request += 1;

        let result = self
            .with_observer(node, medium, |observer, ctx| {
                observer.request_gate(ctx, peer, requirements, requester)
            })
            .unwrap_or(Err(LinkError::NotAttached));
        self.pump(medium);
        result.map(|_| requester)
    }

    /// Sends payload over the established link from `node` to `peer`.
    pub fn send_data(&mut self, node: NodeId, medium: MediumId, peer: &str, data: Vec<u8>) -> Result<(), LinkError> {
        let endpoint = self
            .observer(node, medium)
            .ok_or(LinkError::NotAttached)?
            .processes()
            .find(|p| p.is_established() && p.peer_name() == peer)
            .and_then(|p| p.endpoint())
            .ok_or(LinkError::NotConnected)?;

        let layer = self.media.get_mut(&medium).ok_or(LinkError::MediumDeleted)?;
        let result = layer.write(endpoint, Packet::data(data));
        self.pump(medium);
        result
    }

    // ===== Event loop =====

    /// Handles the next scheduled event. Returns false if there is none.
    pub fn step(&mut self) -> bool {
        let Some((time, event)) = self.scheduler.next() else {
            return false;
        };

        match event {
            SimEvent::Delivery { medium } => {
                if let Some(layer) = self.media.get_mut(&medium) {
                    if let Some(delivery) = layer.on_delivery() {
                        self.sink.log(
                            time,
                            Event::Transmission {
                                medium,
                                started: delivery.started,
                                size: delivery.size,
                                delivered: delivery.delivered(),
                                corrupted: delivery.corrupted,
                            },
                        );
                    }
                }
                self.pump(medium);
            }
            SimEvent::MediumRepaired { medium } => {
                let repaired = self
                    .media
                    .get_mut(&medium)
                    .map(|layer| layer.on_repaired())
                    .unwrap_or(false);
                if repaired {
                    self.sink.log(time, Event::MediumRepaired { medium });
                }
                self.pump(medium);
            }
            SimEvent::DelayedDiscovery { node, medium, neighbor } => {
                self.with_observer(node, medium, |observer, ctx| {
                    observer.on_delayed_discovery(ctx, &neighbor)
                });
                self.pump(medium);
            }
            SimEvent::RepairCheck { node, medium, neighbor } => {
                self.with_observer(node, medium, |observer, ctx| {
                    observer.on_repair_check(ctx, &neighbor)
                });
                self.pump(medium);
            }
            SimEvent::Reattach { node, medium } => {
                self.with_observer(node, medium, |observer, ctx| observer.on_reattach(ctx));
                self.pump(medium);
            }
            SimEvent::SignalingRetry { node, medium, process } => {
                self.with_observer(node, medium, |observer, ctx| {
                    observer.on_signaling_retry(ctx, process)
                });
                self.pump(medium);
            }
            SimEvent::SignalingTimeout { node, medium, process } => {
                self.with_observer(node, medium, |observer, ctx| {
                    observer.on_signaling_timeout(ctx, process)
                });
                self.pump(medium);
            }
        }
        true
    }

    /// Handles all events up to and including time `until`.
    pub fn run_until(&mut self, until: SimTime) -> usize {
        let mut handled = 0;
        while let Some(next) = self.scheduler.peek_time() {
            if next > until {
                break;
            }
            self.step();
            handled += 1;
        }
        self.scheduler.advance_to(until);
        handled
    }

    /// Runs until no event is pending or `max_events` were handled.
    pub fn run_until_idle(&mut self, max_events: usize) -> usize {
        let mut handled = 0;
        while handled < max_events && self.step() {
            handled += 1;
        }
        handled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ll_gate::GateKind;
    use crate::ll_interface::{CollectingSink, EndpointRef, Side};
    use crate::ll_process::ProcessRole;

    const MAX_EVENTS: usize = 10_000;

    fn simulation(medium: MediumConfig) -> (Simulation, CollectingSink, MediumId) {
        let sink = CollectingSink::new();
        let mut sim = Simulation::new_with_sink(SimulationConfig::with_seed(7), Box::new(sink.clone()));
        let bus = sim.add_medium("bus", Some(medium));
        (sim, sink, bus)
    }

    fn pair(sim: &mut Simulation, bus: MediumId, a_first: bool) -> (NodeId, NodeId) {
        let a = sim.add_node("a");
        let b = sim.add_node("b");
        if a_first {
            sim.attach(a, bus).unwrap();
            sim.attach(b, bus).unwrap();
        } else {
            sim.attach(b, bus).unwrap();
            sim.attach(a, bus).unwrap();
        }
        sim.run_until_idle(MAX_EVENTS);
        (a, b)
    }

    fn direct_gates(sim: &Simulation, node: NodeId, bus: MediumId) -> Vec<Gate> {
        sim.gates(node, bus)
            .into_iter()
            .filter(|g| g.kind == GateKind::DirectDown)
            .collect()
    }

    fn assert_cross_referenced(sim: &Simulation, a: NodeId, b: NodeId, bus: MediumId) {
        let gates_a = direct_gates(sim, a, bus);
        let gates_b = direct_gates(sim, b, bus);
        assert_eq!(gates_a.len(), 1);
        assert_eq!(gates_b.len(), 1);

        let (ga, gb) = (&gates_a[0], &gates_b[0]);
        assert!(ga.is_operational() && gb.is_operational());
        assert_eq!(ga.peer_gate, Some(gb.gate_id()));
        assert_eq!(gb.peer_gate, Some(ga.gate_id()));
        assert_eq!(ga.peer_routing_name.as_deref(), Some("b"));
        assert_eq!(gb.peer_routing_name.as_deref(), Some("a"));
    }

    #[test]
    fn test_one_gate_pair_for_both_orders() {
        for a_first in [true, false] {
            let (mut sim, sink, bus) = simulation(MediumConfig::default());
            let (a, b) = pair(&mut sim, bus, a_first);

            assert_cross_referenced(&sim, a, b, bus);
            assert_eq!(sink.count(|e| matches!(e, Event::GateEstablished { .. })), 2);

            // the lower name initiated
            assert!(sink.count(|e| matches!(
                e,
                Event::NeighborDiscovered { initiator: true, neighbor, .. } if neighbor == "b_1"
            )) >= 1);
            assert!(sim.scheduler().is_idle());
        }
    }

    fn live_endpoint(sim: &Simulation, node: NodeId, bus: MediumId) -> (ProcessRole, EndpointRef) {
        let mut live = sim
            .observer(node, bus)
            .unwrap()
            .processes()
            .filter(|p| !p.is_terminated());
        let process = live.next().unwrap();
        assert!(live.next().is_none());
        (process.role(), process.endpoint().unwrap())
    }

    #[test]
    fn test_simultaneous_open_keeps_lower_name_connection() {
        let (mut sim, sink, bus) = simulation(MediumConfig::default());
        let (a, b) = pair(&mut sim, bus, true);

        // drop the link underneath both observers without telling them
        let (_, old) = live_endpoint(&sim, a, bus);
        sim.media.get_mut(&bus).unwrap().close(old);

        // both rediscover each other and connect before any event is handed out
        sim.with_observer(b, bus, |o, ctx| o.neighbor_discovered(ctx, "a_1", true));
        sim.with_observer(a, bus, |o, ctx| o.neighbor_discovered(ctx, "b_1", true));
        assert_eq!(sim.layer(bus).unwrap().connection_count(), 2);

        sim.pump(bus);
        sim.run_until_idle(MAX_EVENTS);

        assert_cross_referenced(&sim, a, b, bus);
        assert_eq!(sim.gates(a, bus).len(), 1);
        assert_eq!(sim.gates(b, bus).len(), 1);

        let (role_a, ep_a) = live_endpoint(&sim, a, bus);
        let (role_b, ep_b) = live_endpoint(&sim, b, bus);
        assert_eq!(role_a, ProcessRole::Active);
        assert_eq!(role_b, ProcessRole::Passive);
        assert_eq!(ep_a.side, Side::Initiator);
        assert_eq!(ep_b, EndpointRef::new(ep_a.connection, Side::Acceptor));
        assert_eq!(sim.layer(bus).unwrap().connection_count(), 1);

        // b's own attempt was given up in favour of a's connection
        assert!(sink.count(|e| matches!(
            e,
            Event::ProcessStateChange { node, to_state: "FAILED", .. } if *node == b
        )) >= 1);
        assert!(sim.scheduler().is_idle());
    }

    #[test]
    fn test_bandwidth_delay_on_the_wire() {
        let (mut sim, sink, bus) = simulation(MediumConfig {
            bandwidth_kbit: Some(1000),
            ..MediumConfig::default()
        });
        let (a, _) = pair(&mut sim, bus, true);
        sink.clear();

        sim.send_data(a, bus, "b_1", vec![0; 1000]).unwrap();
        sim.run_until_idle(MAX_EVENTS);

        let events = sink.events();
        let (end, started) = events
            .iter()
            .find_map(|(time, e)| match e {
                Event::Transmission { size: 1000, started, .. } => Some((*time, *started)),
                _ => None,
            })
            .unwrap();
        assert!((end - started - 0.008).abs() < 1e-9);
    }

    #[test]
    fn test_single_packet_in_flight() {
        let (mut sim, sink, bus) = simulation(MediumConfig {
            bandwidth_kbit: Some(64),
            ..MediumConfig::default()
        });
        let (a, b) = pair(&mut sim, bus, true);

        for i in 0..5u8 {
            sim.send_data(a, bus, "b_1", vec![i; 100]).unwrap();
            sim.send_data(b, bus, "a_1", vec![i; 300]).unwrap();
        }
        sim.run_until_idle(MAX_EVENTS);

        let transmissions: Vec<(SimTime, SimTime)> = sink
            .events()
            .iter()
            .filter_map(|(time, e)| match e {
                Event::Transmission { started, .. } => Some((*started, *time)),
                _ => None,
            })
            .collect();
        assert!(transmissions.len() >= 10);
        for window in transmissions.windows(2) {
            assert!(window[1].0 >= window[0].1, "overlap: {:?}", window);
        }
    }

    #[test]
    fn test_no_loss_at_zero_rate() {
        let (mut sim, _, bus) = simulation(MediumConfig {
            bit_error_rate: 1.0,
            ..MediumConfig::default()
        });
        let (a, _) = pair(&mut sim, bus, true);

        for _ in 0..20 {
            sim.send_data(a, bus, "b_1", vec![1; 200]).unwrap();
        }
        sim.run_until_idle(MAX_EVENTS);

        let stats = sim.medium(bus).unwrap().stats();
        assert_eq!(stats.dropped, 0);
        assert_eq!(stats.corrupted, 0);
    }

    #[test]
    fn test_full_loss_drops_data_not_signaling() {
        let (mut sim, _, bus) = simulation(MediumConfig {
            loss_rate: 1.0,
            ..MediumConfig::default()
        });
        let (a, b) = pair(&mut sim, bus, true);

        // signaling is exempt, so the gates still come up
        assert_cross_referenced(&sim, a, b, bus);
        let signaling = sim.medium(bus).unwrap().stats().delivered;

        for _ in 0..10 {
            sim.send_data(a, bus, "b_1", vec![1; 10]).unwrap();
        }
        sim.run_until_idle(MAX_EVENTS);

        let stats = sim.medium(bus).unwrap().stats();
        assert_eq!(stats.dropped, 10);
        assert_eq!(stats.delivered, signaling);
    }

    #[test]
    fn test_broken_and_repaired_seen_once_each() {
        let (mut sim, sink, bus) = simulation(MediumConfig::default());
        let (a, b) = pair(&mut sim, bus, true);

        sim.set_medium_broken(bus, true).unwrap();
        assert_eq!(sim.observer(a, bus).unwrap().stats().layer_disconnected, 1);
        assert_eq!(sim.observer(b, bus).unwrap().stats().layer_disconnected, 1);

        // breaking twice changes nothing
        assert_eq!(sim.set_medium_broken(bus, true), Ok(BrokenTransition::Unchanged));
        assert_eq!(sim.observer(a, bus).unwrap().stats().layer_disconnected, 1);

        sim.set_medium_broken(bus, false).unwrap();
        // not inline, only on the next tick
        assert_eq!(sim.observer(a, bus).unwrap().stats().layer_connected, 0);
        assert_eq!(sim.observer(b, bus).unwrap().stats().layer_connected, 0);

        assert!(sim.step());
        assert_eq!(sim.observer(a, bus).unwrap().stats().layer_connected, 1);
        assert_eq!(sim.observer(b, bus).unwrap().stats().layer_connected, 1);

        sim.run_until_idle(MAX_EVENTS);
        assert_eq!(sink.count(|e| matches!(e, Event::MediumRepaired { .. })), 1);
        // the links survived
        assert_cross_referenced(&sim, a, b, bus);
    }

    #[test]
    fn test_disappearance_removes_primary_and_backup() {
        let (mut sim, sink, bus) = simulation(MediumConfig::default());
        let (a, b) = pair(&mut sim, bus, true);

        // a residual backup gate next to the primary one
        sim.observer_mut(a, bus)
            .unwrap()
            .mux_mut()
            .unwrap()
            .create_gate(GateKind::Rerouting, "b_1", None, Requirements::best_effort());
        assert_eq!(sim.gates(a, bus).len(), 2);

        // b's binding goes away while its connection is still up
        let binding = sim.observer(b, bus).unwrap().binding().unwrap();
        sim.media.get_mut(&bus).unwrap().unbind(binding);
        sim.pump(bus);

        assert!(sim.gates(a, bus).is_empty());
        assert_eq!(
            sink.count(|e| matches!(e, Event::NeighborLost { removed: 2, .. })),
            1
        );
    }

    #[test]
    fn test_outage_leaves_backup_until_repair() {
        let (mut sim, _, bus) = simulation(MediumConfig::default());
        let (a, b) = pair(&mut sim, bus, true);

        sim.node_outage(b);
        let gates = sim.gates(a, bus);
        assert_eq!(gates.len(), 1);
        assert_eq!(gates[0].kind, GateKind::Rerouting);
        assert!(sim.gates(b, bus).is_empty());

        sim.repair_node(b).unwrap();
        sim.run_until_idle(MAX_EVENTS);

        assert_cross_referenced(&sim, a, b, bus);
        assert!(sim.gates(a, bus).iter().all(|g| g.kind == GateKind::DirectDown));
    }

    #[test]
    fn test_request_gate_reports_completion() {
        let (mut sim, sink, bus) = simulation(MediumConfig::default());
        let (a, b) = pair(&mut sim, bus, true);

        let request = sim.request_gate(a, bus, "b_1", Requirements::best_effort()).unwrap();
        sim.run_until_idle(MAX_EVENTS);

        assert_eq!(
            sink.count(|e| matches!(
                e,
                Event::RequestCompleted { requester, gate: Some(_), .. } if *requester == request
            )),
            1
        );
        assert_cross_referenced(&sim, a, b, bus);
        assert_eq!(sim.gates(b, bus).len(), 1);
    }

    #[test]
    fn test_request_gate_to_unknown_peer() {
        let (mut sim, _, bus) = simulation(MediumConfig::default());
        let (a, _) = pair(&mut sim, bus, true);

        assert_eq!(
            sim.request_gate(a, bus, "nobody_1", Requirements::best_effort()),
            Err(LinkError::NameUnknown("nobody_1".into()))
        );
    }

    #[test]
    fn test_detach_tears_down_peer_side() {
        let (mut sim, _, bus) = simulation(MediumConfig::default());
        let (a, b) = pair(&mut sim, bus, true);

        sim.detach(b, bus);
        sim.run_until_idle(MAX_EVENTS);

        assert!(sim.gates(a, bus).is_empty());
        assert_eq!(sim.observer(a, bus).unwrap().processes().count(), 0);
        assert_eq!(sim.layer(bus).unwrap().connection_count(), 0);
    }

    #[test]
    fn test_remove_medium_detaches_all() {
        let (mut sim, sink, bus) = simulation(MediumConfig::default());
        let (a, b) = pair(&mut sim, bus, true);

        sim.remove_medium(bus);
        sim.run_until_idle(MAX_EVENTS);

        assert!(sim.medium(bus).is_none());
        assert!(sim.observer(a, bus).is_none());
        assert!(sim.observer(b, bus).is_none());
        assert!(sink.count(|e| matches!(e, Event::Detached { .. })) >= 2);
        assert!(!sim.node(a).unwrap().central().is_linked(3));
    }

    #[test]
    fn test_name_collision_on_second_medium_node() {
        let (mut sim, _, bus) = simulation(MediumConfig::default());
        let first = sim.add_node("a");
        let second = sim.add_node("a");

        sim.attach(first, bus).unwrap();
        sim.attach(second, bus).unwrap();
        sim.run_until_idle(MAX_EVENTS);

        let one = sim.observer(first, bus).unwrap().attachment_name().unwrap().to_string();
        let two = sim.observer(second, bus).unwrap().attachment_name().unwrap().to_string();
        assert_eq!(one, "a_1");
        assert_ne!(one, two);
        assert_eq!(direct_gates(&sim, first, bus).len(), 1);
    }

    #[test]
    fn test_runs_are_reproducible_and_independent() {
        let run = || {
            let sink = CollectingSink::new();
            let mut sim = Simulation::new_with_sink(SimulationConfig::with_seed(11), Box::new(sink.clone()));
            let bus = sim.add_medium(
                "lossy",
                Some(MediumConfig {
                    bandwidth_kbit: Some(256),
                    loss_rate: 0.3,
                    ..MediumConfig::default()
                }),
            );
            let (a, _) = pair(&mut sim, bus, true);
            for _ in 0..50 {
                sim.send_data(a, bus, "b_1", vec![3; 64]).unwrap();
            }
            sim.run_until_idle(MAX_EVENTS);
            let stats = sim.medium(bus).unwrap().stats().clone();
            (stats.delivered, stats.dropped, sink.events().len())
        };

        let handles: Vec<_> = (0..2).map(|_| std::thread::spawn(run)).collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(results[0], results[1]);
        let dropped = results[0].1;
        assert!(dropped > 0 && dropped < 50);
    }
}
