use log::{debug, info, trace, warn};

use crate::ll_config::LinkConfig;
use crate::ll_error::{ErrorClass, LinkError};
use crate::ll_gate::{ForwardingNode, GateKind};
use crate::ll_interface::{
    EndpointRef, Event, EventSink, GateId, Identity, LowerLayer, MediumId, Name, NodeId,
    ProcessId, RequestId, Requirements, SimEvent,
};
use crate::ll_scheduler::{EventHandle, SimScheduler};
use crate::ll_signaling::{LinkResponse, SignalingMessage};
use crate::ll_timer::{RetryStep, RetryTimer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Starting,
    Connecting,
    Signaling,
    Established,
    Failed,
    Terminated,
}

impl ProcessState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessState::Starting => "STARTING",
            ProcessState::Connecting => "CONNECTING",
            ProcessState::Signaling => "SIGNALING",
            ProcessState::Established => "ESTABLISHED",
            ProcessState::Failed => "FAILED",
            ProcessState::Terminated => "TERMINATED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessRole {
    /// opens the connection itself
    Active,
    /// serves a connection that arrived at our binding
    Passive,
}

/// Everything a process may touch while handling one event.
pub struct ProcessContext<'a> {
    pub node: NodeId,
    pub medium: MediumId,
    pub layer: &'a mut dyn LowerLayer,
    pub mux: &'a mut ForwardingNode,
    pub attachment_name: &'a str,
    pub attachment_identity: &'a Identity,
    pub routing_name: Option<Name>,
    pub scheduler: &'a SimScheduler,
    pub sink: &'a mut dyn EventSink,
}

impl<'a> ProcessContext<'a> {
    fn log(&mut self, event: Event) {
        let now = self.scheduler.now();
        self.sink.log(now, event);
    }
}

/// Builds one down gate to a neighbor and pairs it with the neighbor's
/// reverse gate via in-band signaling.
#[derive(Debug)]
pub struct GateConstructionProcess {
    id: ProcessId,
    role: ProcessRole,
    state: ProcessState,
    peer_name: Name,
    requester: Option<RequestId>,
    requirements: Requirements,
    endpoint: Option<EndpointRef>,
    gate: Option<GateId>,
    timer: Option<RetryTimer<SignalingMessage>>,
    wait: Option<EventHandle>,
    authenticated: bool,
    sent: bool,
    established_once: bool,
    error: Option<LinkError>,
    retries: u32,
    timeout: f64,
    data_packets: u64,
}

impl GateConstructionProcess {
    pub fn active(
        id: ProcessId,
        peer_name: &str,
        requirements: Requirements,
        requester: Option<RequestId>,
        config: &LinkConfig,
    ) -> Self {
        Self::new(id, ProcessRole::Active, peer_name, requirements, requester, None, config)
    }

    pub fn passive(id: ProcessId, peer_name: &str, endpoint: EndpointRef, config: &LinkConfig) -> Self {
        Self::new(
            id,
            ProcessRole::Passive,
            peer_name,
            Requirements::best_effort(),
            None,
            Some(endpoint),
            config,
        )
    }

    fn new(
        id: ProcessId,
        role: ProcessRole,
        peer_name: &str,
        requirements: Requirements,
        requester: Option<RequestId>,
        endpoint: Option<EndpointRef>,
        config: &LinkConfig,
    ) -> Self {
        Self {
            id,
            role,
            state: ProcessState::Starting,
            peer_name: peer_name.to_string(),
            requester,
            requirements,
            endpoint,
            gate: None,
            timer: None,
            wait: None,
            authenticated: false,
            sent: false,
            established_once: false,
            error: None,
            retries: config.signaling_retries,
            timeout: config.process_timeout,
            data_packets: 0,
        }
    }

    // ===== Accessors =====

    pub fn id(&self) -> ProcessId {
        self.id
    }

    pub fn role(&self) -> ProcessRole {
        self.role
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn peer_name(&self) -> &str {
        &self.peer_name
    }

    pub fn requester(&self) -> Option<RequestId> {
        self.requester
    }

    pub fn endpoint(&self) -> Option<EndpointRef> {
        self.endpoint
    }

    pub fn gate(&self) -> Option<GateId> {
        self.gate
    }

    pub fn error(&self) -> Option<&LinkError> {
        self.error.as_ref()
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    pub fn is_terminated(&self) -> bool {
        self.state == ProcessState::Terminated
    }

    pub fn is_established(&self) -> bool {
        self.state == ProcessState::Established
    }

    /// True if the process reached ESTABLISHED at some point.
    pub fn was_established(&self) -> bool {
        self.established_once
    }

    pub fn data_packets(&self) -> u64 {
        self.data_packets
    }

    fn set_state(&mut self, ctx: &mut ProcessContext, state: ProcessState) {
        if self.state == state {
            return;
        }
        trace!(
            "process {} ({}): {} -> {}",
            self.id,
            self.peer_name,
            self.state.as_str(),
            state.as_str()
        );
        ctx.log(Event::ProcessStateChange {
            node: ctx.node,
            process: self.id,
            from_state: self.state.as_str(),
            to_state: state.as_str(),
        });
        self.state = state;
    }

    // ===== Entry points =====

    /// Active processes open the connection, passive ones accept theirs and
    /// start waiting for the peer's request.
    pub fn start(&mut self, ctx: &mut ProcessContext) -> Result<(), LinkError> {
        if self.state != ProcessState::Starting {
            return Ok(());
        }
        self.set_state(ctx, ProcessState::Connecting);

        let result = match self.role {
            ProcessRole::Active => ctx
                .layer
                .connect(&self.peer_name, Some(&self.requirements), ctx.attachment_identity)
                .map(|endpoint| self.endpoint = Some(endpoint)),
            ProcessRole::Passive => match self.endpoint {
                Some(endpoint) => {
                    self.arm_wait(ctx);
                    ctx.layer.accept(endpoint)
                }
                None => Err(LinkError::NotConnected),
            },
        };

        if let Err(e) = result {
            warn!("process {} to '{}' failed to start: {}", self.id, self.peer_name, e);
            self.terminate(ctx, e.clone());
            return Err(e);
        }
        Ok(())
    }

    fn arm_wait(&mut self, ctx: &mut ProcessContext) {
        if self.wait.is_none() {
            self.wait = Some(ctx.scheduler.schedule_in(
                self.timeout,
                SimEvent::SignalingTimeout {
                    node: ctx.node,
                    medium: ctx.medium,
                    process: self.id,
                },
            ));
        }
    }

    /// The connection is up on both sides: build the gate and start signaling.
    pub fn connected(&mut self, ctx: &mut ProcessContext) {
        if self.state != ProcessState::Connecting {
            return;
        }

        if !ctx.mux.is_open() {
            let error = LinkError::GateConstruction("multiplexer closed".to_string());
            if self.requester.is_some() {
                self.send(ctx, &SignalingMessage::rejected(&error));
            }
            self.terminate(ctx, error);
            return;
        }

        let gate = ctx.mux.create_gate(
            GateKind::DirectDown,
            &self.peer_name,
            self.endpoint,
            self.requirements,
        );
        self.gate = Some(gate);
        self.set_state(ctx, ProcessState::Signaling);

        if self.requester.is_some() {
            let response = SignalingMessage::accepted(gate, ctx.routing_name.clone());
            if self.send(ctx, &response) {
                self.sent = true;
            }
            if !self.is_terminated() {
                self.arm_wait(ctx);
            }
        } else if self.role == ProcessRole::Active {
            let request = SignalingMessage::request(ctx.attachment_name, gate, ctx.routing_name.clone());
            let mut timer = RetryTimer::new(request, self.retries, self.timeout);
            let event = SimEvent::SignalingRetry {
                node: ctx.node,
                medium: ctx.medium,
                process: self.id,
            };
            let payload = timer.start(ctx.scheduler, event).clone();
            self.timer = Some(timer);
            if self.send(ctx, &payload) {
                self.sent = true;
            }
        }
    }

    /// A retry sub-interval elapsed.
    pub fn on_retry(&mut self, ctx: &mut ProcessContext) {
        let event = SimEvent::SignalingRetry {
            node: ctx.node,
            medium: ctx.medium,
            process: self.id,
        };
        let answered = self.authenticated;

        // Some(Ok) resend, Some(Err) expired
        let outcome = match self.timer.as_mut() {
            Some(timer) => match timer.fire(ctx.scheduler, event, answered) {
                RetryStep::Resend(message) => Some(Ok(message.clone())),
                RetryStep::Expired => Some(Err(LinkError::Timeout)),
                RetryStep::Answered | RetryStep::Inactive => None,
            },
            None => None,
        };

        match outcome {
            Some(Ok(message)) => {
                debug!("process {} re-sends {}", self.id, message.kind());
                self.send(ctx, &message);
            }
            Some(Err(error)) => {
                info!("process {} to '{}': no answer, giving up", self.id, self.peer_name);
                self.terminate(ctx, error);
            }
            None => {}
        }
    }

    /// Waiting for the peer's signaling timed out.
    pub fn on_wait_timeout(&mut self, ctx: &mut ProcessContext) {
        self.wait = None;
        if !self.authenticated && !self.is_terminated() {
            info!("process {} to '{}': peer stayed silent", self.id, self.peer_name);
            self.terminate(ctx, LinkError::Timeout);
        }
    }

    /// Reads everything that arrived on the connection.
    pub fn handle_data(&mut self, ctx: &mut ProcessContext) {
        let Some(endpoint) = self.endpoint else {
            return;
        };

        while let Some(packet) = ctx.layer.read(endpoint) {
            if self.is_terminated() {
                continue;
            }
            match SignalingMessage::from_packet(&packet) {
                Some(Ok(message)) => self.handle_message(ctx, message),
                Some(Err(error)) => self.protocol_error(ctx, error),
                None if self.authenticated => {
                    // payload for the forwarding layer
                    self.data_packets += 1;
                }
                None => self.protocol_error(
                    ctx,
                    LinkError::UnexpectedMessage("data before authentication".to_string()),
                ),
            }
        }
    }

    fn handle_message(&mut self, ctx: &mut ProcessContext, message: SignalingMessage) {
        if self.state == ProcessState::Connecting {
            let connected = self.endpoint.map(|ep| ctx.layer.is_connected(ep)).unwrap_or(false);
            if connected {
                self.connected(ctx);
            }
        }
        let Some(gate) = self.gate else {
            self.protocol_error(ctx, LinkError::UnexpectedMessage(message.kind().to_string()));
            return;
        };

        let was_request = message.is_request();
        let identity = self.endpoint.and_then(|ep| ctx.layer.peer_identity(ep));

        match message {
            SignalingMessage::OpenLinkRequest {
                local_attachment_name,
                local_gate_id,
                local_routing_name,
            } => {
                if local_attachment_name != self.peer_name {
                    self.protocol_error(
                        ctx,
                        LinkError::BindingMismatch {
                            expected: self.peer_name.clone(),
                            actual: local_attachment_name,
                        },
                    );
                    return;
                }
                if let Some(g) = ctx.mux.gate_mut(gate) {
                    g.update(local_gate_id, local_routing_name, identity);
                }
            }
            SignalingMessage::OpenLinkResponse(LinkResponse::Rejected { error }) => {
                info!("process {}: '{}' rejected the link: {}", self.id, self.peer_name, error);
                self.terminate(ctx, LinkError::PeerRejected(error));
                return;
            }
            SignalingMessage::OpenLinkResponse(LinkResponse::Accepted { gate_id, routing_name }) => {
                if let Some(g) = ctx.mux.gate_mut(gate) {
                    g.update(gate_id, routing_name, identity);
                }
            }
        }

        self.authenticated = true;
        self.cancel_timers(ctx);

        // passive side answers every request, both sides answer a response once
        let reply = (was_request && self.timer.is_none()) || (!was_request && !self.sent);
        if reply {
            let response = SignalingMessage::accepted(gate, ctx.routing_name.clone());
            if self.send(ctx, &response) {
                self.sent = true;
            }
        }

        if self.state != ProcessState::Established && !self.is_terminated() {
            self.set_state(ctx, ProcessState::Established);
            self.established_once = true;

            let peer_gate = ctx.mux.gate(gate).and_then(|g| g.peer_gate).unwrap_or_default();
            info!(
                "node {}: gate {} to '{}' established (peer gate {})",
                ctx.node, gate, self.peer_name, peer_gate
            );
            ctx.log(Event::GateEstablished {
                node: ctx.node,
                medium: ctx.medium,
                gate,
                peer_gate,
            });
            if let Some(requester) = self.requester {
                ctx.log(Event::RequestCompleted {
                    node: ctx.node,
                    requester,
                    gate: Some(gate),
                });
            }
        }
    }

    // logged and dropped, the process keeps running
    fn protocol_error(&mut self, ctx: &mut ProcessContext, error: LinkError) {
        debug_assert_eq!(error.class(), ErrorClass::Protocol);
        warn!("process {} to '{}': {}", self.id, self.peer_name, error);
        ctx.log(Event::ProtocolViolation {
            node: ctx.node,
            process: self.id,
            reason: error.to_string(),
        });
    }

    fn send(&mut self, ctx: &mut ProcessContext, message: &SignalingMessage) -> bool {
        let Some(endpoint) = self.endpoint else {
            return false;
        };

        let result = message.to_packet().and_then(|packet| ctx.layer.write(endpoint, packet));
        match result {
            Ok(()) => {
                ctx.log(Event::SignalingSent {
                    node: ctx.node,
                    process: self.id,
                    message: message.kind(),
                });
                true
            }
            Err(e) => {
                warn!("process {} can not send {}: {}", self.id, message.kind(), e);
                if e.is_fatal_for_process() {
                    self.terminate(ctx, e);
                }
                false
            }
        }
    }

    fn cancel_timers(&mut self, ctx: &mut ProcessContext) {
        if let Some(timer) = self.timer.as_mut() {
            timer.cancel(ctx.scheduler);
        }
        if let Some(wait) = self.wait.take() {
            ctx.scheduler.cancel(wait);
        }
    }

    /// The connection was closed underneath us.
    pub fn closed(&mut self, ctx: &mut ProcessContext) {
        if !self.is_terminated() {
            self.terminate(ctx, LinkError::ConnectionClosed);
        }
    }

    /// Tears down connection and gate. Returns false if the process was
    /// already terminated.
    pub fn terminate(&mut self, ctx: &mut ProcessContext, error: LinkError) -> bool {
        if self.is_terminated() {
            return false;
        }
        debug!("process {} to '{}' terminates: {}", self.id, self.peer_name, error);

        self.cancel_timers(ctx);

        if let Some(endpoint) = self.endpoint {
            if ctx.layer.is_connected(endpoint) {
                ctx.layer.close(endpoint);
            }
        }

        if let Some(gate) = self.gate.take() {
            if ctx.mux.unregister_gate(gate).is_some() {
                ctx.log(Event::GateRemoved {
                    node: ctx.node,
                    medium: ctx.medium,
                    gate,
                });
            }
        }

        if let Some(requester) = self.requester {
            if !self.established_once {
                ctx.log(Event::RequestCompleted {
                    node: ctx.node,
                    requester,
                    gate: None,
                });
            }
        }

        if !self.established_once {
            self.set_state(ctx, ProcessState::Failed);
        }
        self.error.get_or_insert(error);
        self.set_state(ctx, ProcessState::Terminated);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ll_interface::{CollectingSink, LayerEvent, NodeId};
    use crate::ll_layer::AttachmentLayer;
    use crate::ll_medium::{Medium, MediumConfig};

    const A: NodeId = 1;
    const B: NodeId = 2;

    /// Two nodes on one medium with a process each, driven by hand.
    struct Harness {
        layer: AttachmentLayer,
        sched: SimScheduler,
        sink: CollectingSink,
        mux_a: ForwardingNode,
        mux_b: ForwardingNode,
        id_a: Identity,
        id_b: Identity,
        config: LinkConfig,
    }

    impl Harness {
        fn new() -> Self {
            let sched = SimScheduler::new();
            let medium = Medium::new(1, "bus", MediumConfig::default(), sched.clone(), 1);
            let mut layer = AttachmentLayer::new(medium);
            layer.attach(A).unwrap();
            layer.attach(B).unwrap();

            let id_a = Identity::new("a_1");
            let id_b = Identity::new("b_1");
            layer.bind(A, "a_1", None, &id_a).unwrap();
            layer.bind(B, "b_1", None, &id_b).unwrap();

            Self {
                layer,
                sched,
                sink: CollectingSink::new(),
                mux_a: ForwardingNode::new(1, "mux-a"),
                mux_b: ForwardingNode::new(2, "mux-b"),
                id_a,
                id_b,
                config: LinkConfig::default(),
            }
        }

        fn with<R>(
            &mut self,
            node: NodeId,
            f: impl FnOnce(&mut ProcessContext) -> R,
        ) -> R {
            let mut sink = self.sink.clone();
            let mut entity = self.layer.entity(node);
            let (mux, name, identity) = if node == A {
                (&mut self.mux_a, "a_1", &self.id_a)
            } else {
                (&mut self.mux_b, "b_1", &self.id_b)
            };
            let mut ctx = ProcessContext {
                node,
                medium: 1,
                layer: &mut entity,
                mux,
                attachment_name: name,
                attachment_identity: identity,
                routing_name: Some(format!("routing-{}", node)),
                scheduler: &self.sched,
                sink: &mut sink,
            };
            f(&mut ctx)
        }

        /// Delivers queued layer events and scheduled events until quiet.
        fn run(&mut self, a: &mut GateConstructionProcess, b: &mut Option<GateConstructionProcess>) {
            loop {
                while let Some(event) = self.layer.next_event() {
                    self.dispatch(event, a, b);
                }
                match self.sched.next() {
                    Some((_, SimEvent::Delivery { .. })) => {
                        self.layer.on_delivery();
                    }
                    Some((_, SimEvent::SignalingRetry { node, .. })) => {
                        let p = if node == A { Some(&mut *a) } else { b.as_mut() };
                        if let Some(p) = p {
                            self.with(node, |ctx| p.on_retry(ctx));
                        }
                    }
                    Some((_, SimEvent::SignalingTimeout { node, .. })) => {
                        let p = if node == A { Some(&mut *a) } else { b.as_mut() };
                        if let Some(p) = p {
                            self.with(node, |ctx| p.on_wait_timeout(ctx));
                        }
                    }
                    Some(_) => {}
                    None => break,
                }
            }
        }

        fn dispatch(
            &mut self,
            event: LayerEvent,
            a: &mut GateConstructionProcess,
            b: &mut Option<GateConstructionProcess>,
        ) {
            match event {
                LayerEvent::IncomingConnection { node: B, binding, .. } => {
                    let endpoint = self.layer.take_incoming(binding).unwrap();
                    let mut passive = GateConstructionProcess::passive(2, "a_1", endpoint, &self.config);
                    self.with(B, |ctx| passive.start(ctx)).unwrap();
                    *b = Some(passive);
                }
                LayerEvent::Connected { node, .. } => {
                    let p = if node == A { Some(&mut *a) } else { b.as_mut() };
                    if let Some(p) = p {
                        self.with(node, |ctx| p.connected(ctx));
                    }
                }
                LayerEvent::DataAvailable { node, .. } => {
                    let p = if node == A { Some(&mut *a) } else { b.as_mut() };
                    if let Some(p) = p {
                        self.with(node, |ctx| p.handle_data(ctx));
                    }
                }
                LayerEvent::Closed { node, .. } => {
                    let p = if node == A { Some(&mut *a) } else { b.as_mut() };
                    if let Some(p) = p {
                        self.with(node, |ctx| p.closed(ctx));
                    }
                }
                _ => {}
            }
        }
    }

    #[test]
    fn test_request_response_pairs_gates() {
        let mut h = Harness::new();
        let config = h.config.clone();
        let mut a = GateConstructionProcess::active(1, "b_1", Requirements::best_effort(), None, &config);
        let mut b = None;

        h.with(A, |ctx| a.start(ctx)).unwrap();
        h.run(&mut a, &mut b);
        let b = b.unwrap();

        assert!(a.is_established());
        assert!(b.is_established());

        let gate_a = h.mux_a.gate(a.gate().unwrap()).unwrap();
        let gate_b = h.mux_b.gate(b.gate().unwrap()).unwrap();
        assert_eq!(gate_a.peer_gate, Some(gate_b.gate_id()));
        assert_eq!(gate_b.peer_gate, Some(gate_a.gate_id()));
        assert_eq!(gate_a.peer_routing_name.as_deref(), Some("routing-2"));
        assert_eq!(gate_b.peer_routing_name.as_deref(), Some("routing-1"));
        assert_eq!(gate_a.peer_identity, Some(Identity::new("b_1")));

        // the retry timer was cancelled, nothing was sent twice
        let sent = h.sink.count(|e| matches!(e, Event::SignalingSent { .. }));
        assert_eq!(sent, 2);
        assert!(h.sched.is_idle());
    }

    #[test]
    fn test_connect_to_unknown_peer_terminates() {
        let mut h = Harness::new();
        let config = h.config.clone();
        let mut a = GateConstructionProcess::active(1, "gone_1", Requirements::best_effort(), None, &config);

        let result = h.with(A, |ctx| a.start(ctx));
        assert_eq!(result, Err(LinkError::NameUnknown("gone_1".into())));
        assert!(a.is_terminated());
        assert_eq!(a.error(), Some(&LinkError::NameUnknown("gone_1".into())));
        assert_eq!(a.error().unwrap().class(), ErrorClass::Transport);
    }

    #[test]
    fn test_terminate_twice_is_noop() {
        let mut h = Harness::new();
        let config = h.config.clone();
        let mut a = GateConstructionProcess::active(1, "b_1", Requirements::best_effort(), None, &config);
        let mut b = None;

        h.with(A, |ctx| a.start(ctx)).unwrap();
        h.run(&mut a, &mut b);
        assert_eq!(h.mux_a.gate_count(), 1);

        assert!(h.with(A, |ctx| a.terminate(ctx, LinkError::ConnectionClosed)));
        let events = h.sink.events().len();
        let gates = h.mux_a.gate_count();

        assert!(!h.with(A, |ctx| a.terminate(ctx, LinkError::Timeout)));
        assert_eq!(h.sink.events().len(), events);
        assert_eq!(h.mux_a.gate_count(), gates);
        assert_eq!(gates, 0);
        assert_eq!(a.error(), Some(&LinkError::ConnectionClosed));

        // the peer sees the close and tears down its side as well
        h.run(&mut a, &mut b);
        assert!(b.unwrap().is_terminated());
        assert_eq!(h.mux_b.gate_count(), 0);
    }

    #[test]
    fn test_silent_peer_times_out() {
        let mut h = Harness::new();
        let config = h.config.clone();

        // B's process never answers: it is never created because the
        // incoming connection is accepted by hand without a process
        let mut a = GateConstructionProcess::active(1, "b_1", Requirements::best_effort(), None, &config);
        h.with(A, |ctx| a.start(ctx)).unwrap();

        let binding = h.layer.binding(2).map(|b| b.id).unwrap();
        let incoming = h.layer.take_incoming(binding).unwrap();
        h.layer.accept(incoming).unwrap();

        let mut none = None;
        loop {
            while let Some(event) = h.layer.next_event() {
                if matches!(event, LayerEvent::IncomingConnection { .. }) {
                    continue;
                }
                h.dispatch(event, &mut a, &mut none);
            }
            match h.sched.next() {
                Some((_, SimEvent::Delivery { .. })) => {
                    h.layer.on_delivery();
                    // swallow B's side of the traffic
                    while h.layer.read(incoming).is_some() {}
                }
                Some((_, SimEvent::SignalingRetry { .. })) => h.with(A, |ctx| a.on_retry(ctx)),
                Some(_) => {}
                None => break,
            }
        }

        assert!(a.is_terminated());
        assert_eq!(a.error(), Some(&LinkError::Timeout));
        // initial request plus three retries
        assert_eq!(h.sink.count(|e| matches!(e, Event::SignalingSent { .. })), 4);
        assert_eq!(h.sched.now(), config.process_timeout);
    }

    #[test]
    fn test_mismatched_request_is_dropped() {
        let mut h = Harness::new();
        let config = h.config.clone();
        let mut a = GateConstructionProcess::active(1, "b_1", Requirements::best_effort(), None, &config);
        let mut b = None;

        h.with(A, |ctx| a.start(ctx)).unwrap();
        h.run(&mut a, &mut b);

        // B receives a request that claims to come from someone else
        let bogus = SignalingMessage::request("mallory_1", 9, None).to_packet().unwrap();
        let endpoint = a.endpoint().unwrap();
        h.layer.write(endpoint, bogus).unwrap();
        h.run(&mut a, &mut b);

        assert_eq!(
            h.sink.count(|e| matches!(e, Event::ProtocolViolation { .. })),
            1
        );
        assert!(b.unwrap().is_established());
    }

    #[test]
    fn test_rejection_terminates() {
        let mut h = Harness::new();
        let config = h.config.clone();
        let mut a = GateConstructionProcess::active(1, "b_1", Requirements::best_effort(), None, &config);
        let mut b = None;

        h.with(A, |ctx| a.start(ctx)).unwrap();
        // deliver only the connection setup, B rejects instead of answering
        while let Some(event) = h.layer.next_event() {
            h.dispatch(event, &mut a, &mut b);
        }
        let b_endpoint = b.as_ref().unwrap().endpoint().unwrap();
        let reject = SignalingMessage::rejected(&LinkError::GateConstruction("full".into()));
        h.layer.write(b_endpoint, reject.to_packet().unwrap()).unwrap();
        b = None;
        h.run(&mut a, &mut b);

        assert!(a.is_terminated());
        assert!(matches!(a.error(), Some(LinkError::PeerRejected(_))));
        assert_eq!(h.mux_a.gate_count(), 0);
    }

    #[test]
    fn test_data_after_authentication_counts() {
        let mut h = Harness::new();
        let config = h.config.clone();
        let mut a = GateConstructionProcess::active(1, "b_1", Requirements::best_effort(), None, &config);
        let mut b = None;

        h.with(A, |ctx| a.start(ctx)).unwrap();
        h.run(&mut a, &mut b);

        let endpoint = a.endpoint().unwrap();
        h.layer.write(endpoint, crate::ll_interface::Packet::data(vec![1, 2])).unwrap();
        h.run(&mut a, &mut b);

        assert_eq!(b.unwrap().data_packets(), 1);
    }

    #[test]
    fn test_passive_side_gives_up_on_silent_peer() {
        let mut h = Harness::new();
        let config = h.config.clone();

        // a bare connection from A: nobody on A's side ever signals
        let id_a = h.id_a.clone();
        h.layer.connect(A, "b_1", None, &id_a).unwrap();
        let mut idle = GateConstructionProcess::active(1, "b_1", Requirements::best_effort(), None, &config);
        let mut b = None;

        while let Some(event) = h.layer.next_event() {
            h.dispatch(event, &mut idle, &mut b);
        }
        let gate = b.as_ref().and_then(|p| p.gate()).unwrap();
        let endpoint = b.as_ref().and_then(|p| p.endpoint()).unwrap();
        assert!(h.mux_b.gate(gate).is_some());

        h.run(&mut idle, &mut b);
        let b = b.unwrap();

        assert_eq!(h.sched.now(), config.process_timeout);
        assert!(b.is_terminated());
        assert_eq!(b.error(), Some(&LinkError::Timeout));
        assert_eq!(b.error().unwrap().class(), ErrorClass::Transport);
        assert_eq!(h.mux_b.gate_count(), 0);
        assert!(!h.layer.is_connected(endpoint));

        let transitions: Vec<&str> = h
            .sink
            .events()
            .into_iter()
            .filter_map(|(_, e)| match e {
                Event::ProcessStateChange { node: B, to_state, .. } => Some(to_state),
                _ => None,
            })
            .collect();
        assert_eq!(transitions, ["CONNECTING", "SIGNALING", "FAILED", "TERMINATED"]);
        assert_eq!(
            h.sink.count(|e| matches!(e, Event::GateRemoved { node: B, gate: g, .. } if *g == gate)),
            1
        );
    }

    #[test]
    fn test_failed_answer_leaves_no_wait_timer() {
        let mut h = Harness::new();
        let config = h.config.clone();
        let mut a = GateConstructionProcess::active(1, "b_1", Requirements::best_effort(), Some(7), &config);
        h.with(A, |ctx| a.start(ctx)).unwrap();

        // B accepts and hangs up before A learns it is connected
        let binding = h.layer.binding(2).map(|b| b.id).unwrap();
        let incoming = h.layer.take_incoming(binding).unwrap();
        h.layer.accept(incoming).unwrap();
        h.layer.close(incoming);

        let mut none = None;
        while let Some(event) = h.layer.next_event() {
            if matches!(event, LayerEvent::IncomingConnection { .. }) {
                continue;
            }
            h.dispatch(event, &mut a, &mut none);
        }

        assert!(a.is_terminated());
        assert_eq!(a.error(), Some(&LinkError::NotConnected));
        assert_eq!(h.mux_a.gate_count(), 0);
        assert_eq!(
            h.sink.count(|e| matches!(e, Event::RequestCompleted { requester: 7, gate: None, .. })),
            1
        );
        assert!(h.sched.is_idle());
    }
}
