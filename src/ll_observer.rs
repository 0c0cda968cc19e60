use indexmap::{IndexMap, IndexSet};
use log::{debug, error, info, warn};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

use crate::ll_config::LinkConfig;
use crate::ll_error::LinkError;
use crate::ll_gate::{ForwardingNode, GateKind};
use crate::ll_interface::{
    BindingId, EndpointRef, Event, EventSink, ForwardingNodeId, Identity, LayerEvent,
    LayerStatus, LowerLayer, MediumId, Name, NeighborFilter, NodeId, ProcessId, RequestId,
    Requirements, SimEvent, SimTime,
};
use crate::ll_naming::{NameMappingService, NamingScope, RoutingNames};
use crate::ll_process::{GateConstructionProcess, ProcessContext, ProcessRole};
use crate::ll_scheduler::{EventHandle, SimScheduler};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObserverState {
    Detached,
    Attaching,
    Attached,
}

/// Node-level resources an observer works with while handling one event.
pub struct NodeContext<'a> {
    pub layer: &'a mut dyn LowerLayer,
    pub central: &'a mut ForwardingNode,
    pub naming: &'a mut NameMappingService<ForwardingNodeId>,
    pub scheduler: &'a SimScheduler,
    pub sink: &'a mut dyn EventSink,
}

impl<'a> NodeContext<'a> {
    fn log(&mut self, event: Event) {
        let now = self.scheduler.now();
        self.sink.log(now, event);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObserverStats {
    pub layer_disconnected: u64,
    pub layer_connected: u64,
    pub processes_started: u64,
    pub data_packets: u64,
}

/// Keeps one node attached to one lower layer and maintains a gate to every
/// neighbor found there.
pub struct LinkObserver {
    node: NodeId,
    medium: MediumId,
    node_name: Name,
    state: ObserverState,
    attachment_name: Option<Name>,
    attachment_identity: Option<Identity>,
    binding: Option<BindingId>,
    mux_id: ForwardingNodeId,
    mux: Option<ForwardingNode>,
    // neighbors whose discovery was deferred once
    delayed_discovery: IndexSet<Name>,
    processes: IndexMap<ProcessId, GateConstructionProcess>,
    next_process: ProcessId,
    reattach: Option<EventHandle>,
    reattach_enabled: bool,
    rng: StdRng,
    config: LinkConfig,
    stats: ObserverStats,
}

impl LinkObserver {
    pub fn new(
        node: NodeId,
        medium: MediumId,
        node_name: &str,
        mux_id: ForwardingNodeId,
        config: LinkConfig,
        seed: u64,
    ) -> Self {
        Self {
            node,
            medium,
            node_name: node_name.to_string(),
            state: ObserverState::Detached,
            attachment_name: None,
            attachment_identity: None,
            binding: None,
            mux_id,
            mux: None,
            delayed_discovery: IndexSet::new(),
            processes: IndexMap::new(),
            next_process: 1,
            reattach: None,
            reattach_enabled: false,
            rng: StdRng::seed_from_u64(seed),
            config,
            stats: ObserverStats::default(),
        }
    }

    // ===== Accessors =====

    pub fn state(&self) -> ObserverState {
        self.state
    }

    pub fn is_attached(&self) -> bool {
        self.state == ObserverState::Attached
    }

    pub fn attachment_name(&self) -> Option<&str> {
        self.attachment_name.as_deref()
    }

    pub fn binding(&self) -> Option<BindingId> {
        self.binding
    }

    pub fn mux(&self) -> Option<&ForwardingNode> {
        self.mux.as_ref()
    }

    pub fn mux_mut(&mut self) -> Option<&mut ForwardingNode> {
        self.mux.as_mut()
    }

    pub fn stats(&self) -> &ObserverStats {
        &self.stats
    }

    pub fn processes(&self) -> impl Iterator<Item = &GateConstructionProcess> {
        self.processes.values()
    }

    pub fn process(&self, id: ProcessId) -> Option<&GateConstructionProcess> {
        self.processes.get(&id)
    }

    pub fn is_delayed(&self, neighbor: &str) -> bool {
        self.delayed_discovery.contains(neighbor)
    }

    fn live_process_for(&self, neighbor: &str) -> Option<ProcessId> {
        self.processes
            .values()
            .find(|p| !p.is_terminated() && p.peer_name() == neighbor)
            .map(|p| p.id())
    }

    // runs `f` on a process with a context made from our own state
    fn with_process<R>(
        &mut self,
        ctx: &mut NodeContext,
        id: ProcessId,
        f: impl FnOnce(&mut GateConstructionProcess, &mut ProcessContext) -> R,
    ) -> Option<R> {
        let routing_name = ctx.naming.name_for(ctx.central.id());
        let process = self.processes.get_mut(&id)?;
        let mux = self.mux.as_mut()?;
        let attachment_name = self.attachment_name.as_deref()?;
        let attachment_identity = self.attachment_identity.as_ref()?;

        let mut pctx = ProcessContext {
            node: self.node,
            medium: self.medium,
            layer: &mut *ctx.layer,
            mux,
            attachment_name,
            attachment_identity,
            routing_name,
            scheduler: ctx.scheduler,
            sink: &mut *ctx.sink,
        };
        Some(f(process, &mut pctx))
    }

    // ===== Attachment =====

    /// Attaches to the lower layer. Idempotent while attached; a failure
    /// leaves the observer fully detached.
    pub fn attach(&mut self, ctx: &mut NodeContext) -> Result<(), LinkError> {
        if self.state == ObserverState::Attached {
            return Ok(());
        }
        self.state = ObserverState::Attaching;

        match self.try_attach(ctx) {
            Ok(()) => {
                self.neighbor_check(ctx);
                self.maintain(ctx);
                Ok(())
            }
            Err(e) => {
                warn!("node {} can not attach to medium {}: {}", self.node_name, self.medium, e);
                self.detach(ctx);
                Err(e)
            }
        }
    }

    fn try_attach(&mut self, ctx: &mut NodeContext) -> Result<(), LinkError> {
        if ctx.layer.status() == LayerStatus::Error {
            return Err(LinkError::MediumDeleted);
        }
        ctx.layer.subscribe(NeighborFilter::All);

        let mux = self.mux.get_or_insert_with(|| {
            ForwardingNode::new(self.mux_id, format!("{}@{}", self.node_name, self.medium))
        });
        mux.open();
        ctx.central.connect_multiplexer(mux);

        let name = self.generate_name(ctx)?;
        let identity = Identity::new(name.as_str());
        let binding = ctx.layer.bind(&name, None, &identity)?;

        ctx.naming.register(&name, self.mux_id, NamingScope::Local);
        info!("node {} attached to medium {} as '{}'", self.node_name, self.medium, name);
        ctx.log(Event::Attached {
            node: self.node,
            medium: self.medium,
            name: name.clone(),
        });

        self.attachment_name = Some(name);
        self.attachment_identity = Some(identity);
        self.binding = Some(binding);
        self.state = ObserverState::Attached;
        Ok(())
    }

    /// `<node>_1` first, random suffixes afterwards.
    fn generate_name(&mut self, ctx: &mut NodeContext) -> Result<Name, LinkError> {
        let mut candidate = format!("{}_1", self.node_name);
        for _ in 0..self.config.max_name_attempts {
            if !ctx.layer.is_known(&candidate) {
                return Ok(candidate);
            }
            candidate = format!("{}_{}", self.node_name, self.rng.next_u64());
        }
        Err(LinkError::NameGeneration(self.config.max_name_attempts))
    }

    /// Releases binding and forwarding state. Safe to call in any state.
    pub fn detach(&mut self, ctx: &mut NodeContext) {
        let ids: Vec<ProcessId> = self.processes.keys().copied().collect();
        for id in ids {
            self.with_process(ctx, id, |p, pctx| p.terminate(pctx, LinkError::NotAttached));
        }
        self.processes.clear();
        self.delayed_discovery.clear();

        ctx.layer.unsubscribe();
        if let Some(binding) = self.binding.take() {
            ctx.layer.unbind(binding);
        }

        if let Some(mux) = self.mux.as_mut() {
            ctx.central.unlink(mux);
            for gate in mux.clear_gates() {
                ctx.sink.log(
                    ctx.scheduler.now(),
                    Event::GateRemoved {
                        node: self.node,
                        medium: self.medium,
                        gate,
                    },
                );
            }
        }

        self.attachment_name = None;
        self.attachment_identity = None;
        ctx.naming.unregister_all(&self.mux_id);

        let was = self.state;
        self.state = ObserverState::Detached;
        if was != ObserverState::Detached {
            debug!("node {} detached from medium {}", self.node_name, self.medium);
            ctx.log(Event::Detached {
                node: self.node,
                medium: self.medium,
            });
        }
    }

    /// Re-links forwarding state after a node outage. Attaches from scratch if
    /// there is no binding.
    pub fn repair(&mut self, ctx: &mut NodeContext) -> Result<(), LinkError> {
        if self.binding.is_none() {
            return self.attach(ctx);
        }
        if let Some(mux) = self.mux.as_mut() {
            mux.open();
            ctx.central.connect_multiplexer(mux);
        }
        self.neighbor_check(ctx);
        self.maintain(ctx);
        Ok(())
    }

    /// Node outage: forwarding state is lost, the binding survives.
    pub fn wipe(&mut self, ctx: &mut NodeContext) {
        let ids: Vec<ProcessId> = self.processes.keys().copied().collect();
        for id in ids {
            self.with_process(ctx, id, |p, pctx| p.terminate(pctx, LinkError::NotAttached));
        }
        // no backup gates for a wiped node
        self.processes.clear();
        self.delayed_discovery.clear();

        if let Some(mux) = self.mux.as_mut() {
            ctx.central.unlink(mux);
            mux.close();
            mux.clear_gates();
        }
        info!("node {}: forwarding state on medium {} wiped", self.node_name, self.medium);
    }

    pub fn enable_reattach(&mut self, ctx: &mut NodeContext) {
        self.reattach_enabled = true;
        self.schedule_reattach(ctx);
    }

    pub fn disable_reattach(&mut self, ctx: &mut NodeContext) {
        self.reattach_enabled = false;
        if let Some(handle) = self.reattach.take() {
            ctx.scheduler.cancel(handle);
        }
    }

    fn schedule_reattach(&mut self, ctx: &mut NodeContext) {
        if self.reattach.is_none() {
            self.reattach = Some(ctx.scheduler.schedule_in(
                self.config.reattach_interval,
                SimEvent::Reattach {
                    node: self.node,
                    medium: self.medium,
                },
            ));
        }
    }

    /// Periodic check: re-scan if attached, otherwise try to attach again.
    /// Rescheduled while it does not succeed.
    pub fn on_reattach(&mut self, ctx: &mut NodeContext) {
        self.reattach = None;
        if !self.reattach_enabled {
            return;
        }

        let ok = if self.is_attached() {
            let operating = ctx.layer.status() == LayerStatus::Operating;
            if operating {
                self.neighbor_check(ctx);
                self.maintain(ctx);
            }
            operating
        } else {
            self.attach(ctx).is_ok()
        };

        if !ok {
            self.schedule_reattach(ctx);
        }
    }

    // ===== Neighbors =====

    /// Runs discovery for every neighbor currently known to the layer.
    pub fn neighbor_check(&mut self, ctx: &mut NodeContext) {
        for neighbor in ctx.layer.neighbors(None) {
            self.neighbor_discovered(ctx, &neighbor, false);
        }
    }

    fn default_timeout(&self, ctx: &NodeContext) -> SimTime {
        let delay_ms = ctx.layer.capabilities().delay_ms;
        if delay_ms > 0 {
            2.0 * delay_ms as f64 / 1000.0
        } else {
            self.config.fallback_rtt
        }
    }

    /// The lower name initiates; the other side waits one round trip and only
    /// then starts on its own.
    pub fn neighbor_discovered(&mut self, ctx: &mut NodeContext, neighbor: &str, already_delayed: bool) {
        if !self.is_attached() {
            return;
        }
        let Some(own) = self.attachment_name.clone() else {
            return;
        };
        if own == neighbor {
            return;
        }

        if let Some(existing) = self.live_process_for(neighbor) {
            let alive = self
                .processes
                .get(&existing)
                .and_then(|p| p.endpoint())
                .map(|ep| ctx.layer.is_connected(ep))
                .unwrap_or(false);
            if alive {
                debug!("{}: duplicate discovery of '{}'", own, neighbor);
                return;
            }
            debug!("{}: refreshing stale process to '{}'", own, neighbor);
            self.with_process(ctx, existing, |p, pctx| p.terminate(pctx, LinkError::ConnectionClosed));
            self.processes.shift_remove(&existing);
        }

        if !already_delayed && self.delayed_discovery.contains(neighbor) {
            // deferred retry still pending
            return;
        }

        let initiator = own.as_str() < neighbor || already_delayed;
        ctx.log(Event::NeighborDiscovered {
            node: self.node,
            medium: self.medium,
            neighbor: neighbor.to_string(),
            initiator,
        });

        if initiator {
            self.delayed_discovery.shift_remove(neighbor);
            if self.mux.as_ref().and_then(|mux| mux.find_rerouting(neighbor)).is_some() {
                debug!("{}: backup gate to '{}' exists, repair check scheduled", own, neighbor);
                ctx.scheduler.schedule_in(
                    self.config.repair_delay,
                    SimEvent::RepairCheck {
                        node: self.node,
                        medium: self.medium,
                        neighbor: neighbor.to_string(),
                    },
                );
            }
            self.start_process(ctx, neighbor, Requirements::best_effort(), None);
        } else {
            self.delayed_discovery.insert(neighbor.to_string());
            let delay = self.default_timeout(ctx);
            debug!("{}: deferring '{}' by {:.3}s", own, neighbor, delay);
            ctx.scheduler.schedule_in(
                delay,
                SimEvent::DelayedDiscovery {
                    node: self.node,
                    medium: self.medium,
                    neighbor: neighbor.to_string(),
                },
            );
        }
    }

    /// Deferred discovery fired. A neighbor that left in the meantime was
    /// removed from the delayed set and is ignored.
    pub fn on_delayed_discovery(&mut self, ctx: &mut NodeContext, neighbor: &str) {
        if self.delayed_discovery.contains(neighbor) {
            self.neighbor_discovered(ctx, neighbor, true);
            self.maintain(ctx);
        }
    }

    /// A neighbor we held backup gates for was rediscovered a while ago.
    /// Backups next to an established gate go; if no construction is under
    /// way any more, a new one starts.
    pub fn on_repair_check(&mut self, ctx: &mut NodeContext, neighbor: &str) {
        if !self.is_attached() || !ctx.layer.is_known(neighbor) {
            return;
        }
        let backup = self.mux.as_ref().and_then(|mux| mux.find_rerouting(neighbor)).is_some();
        if backup && self.live_process_for(neighbor).is_none() {
            info!("node {}: repairing backup gate to '{}'", self.node_name, neighbor);
            self.start_process(ctx, neighbor, Requirements::best_effort(), None);
        }
        self.maintain(ctx);
    }

    /// Removes every process and backup gate leading to `neighbor`.
    pub fn neighbor_disappeared(&mut self, ctx: &mut NodeContext, neighbor: &str) -> usize {
        self.delayed_discovery.shift_remove(neighbor);

        let mut removed = 0;
        while let Some(id) = self.processes.values().find(|p| p.peer_name() == neighbor).map(|p| p.id()) {
            self.with_process(ctx, id, |p, pctx| p.terminate(pctx, LinkError::NameUnknown(neighbor.to_string())));
            self.processes.shift_remove(&id);
            removed += 1;
        }

        // backup gates and anything a process left behind
        if let Some(mux) = self.mux.as_mut() {
            for gate in mux.gates_to(neighbor) {
                if mux.unregister_gate(gate).is_some() {
                    ctx.log(Event::GateRemoved {
                        node: self.node,
                        medium: self.medium,
                        gate,
                    });
                    removed += 1;
                }
            }
        }

        info!("node {}: neighbor '{}' gone ({} removed)", self.node_name, neighbor, removed);
        ctx.log(Event::NeighborLost {
            node: self.node,
            medium: self.medium,
            neighbor: neighbor.to_string(),
            removed,
        });
        removed
    }

    // ===== Processes =====

    fn start_process(
        &mut self,
        ctx: &mut NodeContext,
        neighbor: &str,
        requirements: Requirements,
        requester: Option<RequestId>,
    ) -> ProcessId {
        let id = self.next_process;
        self.next_process += 1;
        self.stats.processes_started += 1;

        let process = GateConstructionProcess::active(id, neighbor, requirements, requester, &self.config);
        self.processes.insert(id, process);

        // a failed start is a recoverable transport error, the process is
        // terminated already and gets reaped
        if let Some(Err(e)) = self.with_process(ctx, id, |p, pctx| p.start(pctx)) {
            info!("node {}: gate construction to '{}' failed: {}", self.node_name, neighbor, e);
        }
        id
    }

    /// Incoming connection on our binding. Only known, authenticated
    /// requesters are served.
    fn incoming_connection(&mut self, ctx: &mut NodeContext, endpoint: EndpointRef) {
        let Some(own) = self.attachment_name.clone() else {
            ctx.layer.close(endpoint);
            return;
        };
        let peer = match ctx.layer.peer_identity(endpoint) {
            Some(identity) if ctx.layer.is_known(&identity.name) => identity.name,
            other => {
                warn!("{}: refusing connection from {:?}", own, other.map(|i| i.name));
                ctx.layer.close(endpoint);
                return;
            }
        };

        if let Some(existing) = self.live_process_for(&peer) {
            let ours_active = self
                .processes
                .get(&existing)
                .map(|p| p.role() == ProcessRole::Active)
                .unwrap_or(false);

            // both sides opened a connection: the one opened by the lower
            // name survives
            if ours_active && own.as_str() < peer.as_str() {
                debug!("{}: keeping own connection to '{}'", own, peer);
                ctx.layer.close(endpoint);
                return;
            }
            debug!("{}: connection from '{}' replaces process {}", own, peer, existing);
            self.with_process(ctx, existing, |p, pctx| p.terminate(pctx, LinkError::ConnectionClosed));
            self.processes.shift_remove(&existing);
        }
        self.delayed_discovery.shift_remove(peer.as_str());

        let id = self.next_process;
        self.next_process += 1;
        self.stats.processes_started += 1;
        self.processes
            .insert(id, GateConstructionProcess::passive(id, &peer, endpoint, &self.config));

        if let Some(Err(e)) = self.with_process(ctx, id, |p, pctx| p.start(pctx)) {
            info!("{}: accepting '{}' failed: {}", own, peer, e);
        }
    }

    fn process_for_endpoint(&self, endpoint: EndpointRef) -> Option<ProcessId> {
        self.processes
            .values()
            .find(|p| !p.is_terminated() && p.endpoint() == Some(endpoint))
            .map(|p| p.id())
    }

    /// Explicit request for a gate to `peer`. An existing construction to the
    /// same neighbor is replaced.
    pub fn request_gate(
        &mut self,
        ctx: &mut NodeContext,
        peer: &str,
        requirements: Requirements,
        requester: RequestId,
    ) -> Result<ProcessId, LinkError> {
        if !self.is_attached() {
            return Err(LinkError::NotAttached);
        }
        if !ctx.layer.is_known(peer) {
            return Err(LinkError::NameUnknown(peer.to_string()));
        }

        if let Some(existing) = self.live_process_for(peer) {
            self.with_process(ctx, existing, |p, pctx| p.terminate(pctx, LinkError::ConnectionClosed));
            self.processes.shift_remove(&existing);
        }
        self.delayed_discovery.shift_remove(peer);

        let id = self.start_process(ctx, peer, requirements, Some(requester));
        let error = self.processes.get(&id).and_then(|p| p.error().cloned());
        self.maintain(ctx);

        match error {
            Some(e) => Err(e),
            None => Ok(id),
        }
    }

    pub fn on_signaling_retry(&mut self, ctx: &mut NodeContext, process: ProcessId) {
        self.with_process(ctx, process, |p, pctx| p.on_retry(pctx));
        self.maintain(ctx);
    }

    pub fn on_signaling_timeout(&mut self, ctx: &mut NodeContext, process: ProcessId) {
        self.with_process(ctx, process, |p, pctx| p.on_wait_timeout(pctx));
        self.maintain(ctx);
    }

    /// Reaps terminated processes and keeps backup gates consistent.
    ///
    /// A process that ends after being established leaves a rerouting gate if
    /// the neighbor is still there. An established process replaces all
    /// rerouting gates to its neighbor.
    fn maintain(&mut self, ctx: &mut NodeContext) {
        let terminated: Vec<ProcessId> = self
            .processes
            .values()
            .filter(|p| p.is_terminated())
            .map(|p| p.id())
            .collect();

        for id in terminated {
            let Some(process) = self.processes.shift_remove(&id) else {
                continue;
            };
            self.stats.data_packets += process.data_packets();

            let peer = process.peer_name();
            let replaced = self.live_process_for(peer).is_some();
            if !process.was_established() || replaced || !self.is_attached() || !ctx.layer.is_known(peer) {
                continue;
            }
            if let Some(mux) = self.mux.as_mut() {
                if mux.is_open() && mux.find_rerouting(peer).is_none() {
                    let gate = mux.create_gate(GateKind::Rerouting, peer, None, Requirements::best_effort());
                    info!("node {}: backup gate {} to '{}'", self.node_name, gate, peer);
                }
            }
        }

        let established: Vec<Name> = self
            .processes
            .values()
            .filter(|p| p.is_established())
            .map(|p| p.peer_name().to_string())
            .collect();
        if let Some(mux) = self.mux.as_mut() {
            for peer in established {
                while let Some(gate) = mux.find_rerouting(&peer) {
                    mux.unregister_gate(gate);
                    ctx.sink.log(
                        ctx.scheduler.now(),
                        Event::GateRemoved {
                            node: self.node,
                            medium: self.medium,
                            gate,
                        },
                    );
                }
            }
        }
    }

    // ===== Layer events =====

    pub fn handle_layer_event(&mut self, ctx: &mut NodeContext, event: LayerEvent) {
        match event {
            LayerEvent::NeighborAppeared { name, .. } => {
                self.neighbor_discovered(ctx, &name, false);
            }
            LayerEvent::NeighborDisappeared { name, .. } => {
                self.neighbor_disappeared(ctx, &name);
            }
            LayerEvent::IncomingConnection { binding, .. } => {
                if self.binding == Some(binding) && self.is_attached() {
                    if let Some(endpoint) = ctx.layer.take_incoming(binding) {
                        self.incoming_connection(ctx, endpoint);
                    }
                }
            }
            LayerEvent::Connected { endpoint, .. } => {
                if let Some(id) = self.process_for_endpoint(endpoint) {
                    self.with_process(ctx, id, |p, pctx| p.connected(pctx));
                }
            }
            LayerEvent::Closed { endpoint, .. } => {
                if let Some(id) = self.process_for_endpoint(endpoint) {
                    self.with_process(ctx, id, |p, pctx| p.closed(pctx));
                }
            }
            LayerEvent::DataAvailable { endpoint, .. } => match self.process_for_endpoint(endpoint) {
                Some(id) => {
                    self.with_process(ctx, id, |p, pctx| p.handle_data(pctx));
                }
                None => {
                    while ctx.layer.read(endpoint).is_some() {}
                    debug!("node {}: data for unknown endpoint dropped", self.node_name);
                }
            },
            LayerEvent::LayerDisconnected { .. } => {
                self.stats.layer_disconnected += 1;
                ctx.log(Event::LayerDisconnected {
                    node: self.node,
                    medium: self.medium,
                });
            }
            LayerEvent::LayerConnected { .. } => {
                self.stats.layer_connected += 1;
                ctx.log(Event::LayerConnected {
                    node: self.node,
                    medium: self.medium,
                });
                self.neighbor_check(ctx);
            }
            LayerEvent::BindingError { binding, error, .. } => {
                if self.binding == Some(binding) {
                    error!("node {}: binding on medium {} failed: {}", self.node_name, self.medium, error);
                    self.detach(ctx);
                }
            }
        }

        self.maintain(ctx);
    }
}
