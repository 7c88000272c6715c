//! Per-node runtime context
//!
//! Everything one node owns lives here: ports, actors, the tunnel
//! manager, the token tunnel façade, the scheduler's task list and the
//! continuations of outstanding requests. The node is a state machine
//! without I/O. The driver feeds it envelopes, link changes and timer
//! ticks, and drains the outbox afterwards:
//!
//! ```text
//!   LinkEvent ──► handle_link_event ─┐
//!   NodeCommand ─► connect / ...     ├─► Node ──► Outbox ──► driver ──► link
//!   deadline ───► on_timer ──────────┘
//! ```

use crate::actor::{Actor, ActorIo};
use crate::completion::Completion;
use crate::connection::{DisconnectGroup, PendingReply, TunnelConnect, Waiter};
use crate::directory::{PortDirectory, PortRecord};
use crate::endpoint::{Endpoint, TokenSender, Wake};
use crate::error::{Result, RuntimeError};
use crate::metrics::{EndpointMetrics, EndpointStats, SchedulerMetrics, SchedulerStats};
use crate::port::{Port, PortTable};
use crate::queue::QueueConfig;
use crate::scheduler::{Scheduler, Task};
use crate::token_tunnel::TokenTunnel;
use flow_codec::{Command, Envelope, TokenAck, TokenMessage};
use flow_config::RuntimeConfig;
use flow_network::{LinkEvent, OutboundAction, Outbox, TunnelEventKind, TunnelManager};
use flow_types::{ActorId, Disconnect, NodeId, PortId, PortProperties, Response, Status};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// Outstanding quiesce: ports still draining and the deadline task
#[derive(Debug)]
pub(crate) struct Quiesce {
    remaining: HashSet<PortId>,
    failure: Option<Status>,
    deadline: u64,
    completion: Completion,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeStats {
    pub ports: usize,
    pub actors: usize,
    pub tunnels: usize,
    pub pending_replies: usize,
    pub endpoint: EndpointStats,
    pub scheduler: SchedulerStats,
}

pub struct Node {
    pub(crate) id: NodeId,
    pub(crate) config: RuntimeConfig,
    pub(crate) ports: PortTable,
    pub(crate) port_names: HashMap<ActorId, HashMap<String, PortId>>,
    pub(crate) actors: BTreeMap<ActorId, Box<dyn Actor>>,
    pub(crate) tunnels: TunnelManager,
    pub(crate) outbox: Outbox,
    pub(crate) token_tunnel: TokenTunnel<TunnelConnect>,
    pub(crate) scheduler: Scheduler,
    pub(crate) pending: HashMap<Uuid, PendingReply>,
    pub(crate) groups: HashMap<u64, DisconnectGroup>,
    pub(crate) next_group: u64,
    pub(crate) quiesce: Option<Quiesce>,
    pub(crate) directory: Arc<dyn PortDirectory>,
    pub(crate) endpoint_metrics: Arc<EndpointMetrics>,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("ports", &self.ports.len())
            .field("actors", &self.actors.len())
            .field("tunnels", &self.tunnels.len())
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl Node {
    pub fn new(id: NodeId, config: RuntimeConfig, directory: Arc<dyn PortDirectory>) -> Self {
        let mut tunnels = TunnelManager::new();
        TokenTunnel::<TunnelConnect>::register(&mut tunnels);
        let scheduler = Scheduler::new(&config.scheduler, Arc::new(SchedulerMetrics::default()));
        info!(node = %id, strategy = ?config.scheduler.strategy, "Node created");
        Self {
            outbox: Outbox::new(id.clone()),
            id,
            config,
            ports: PortTable::new(),
            port_names: HashMap::new(),
            actors: BTreeMap::new(),
            tunnels,
            token_tunnel: TokenTunnel::new(),
            scheduler,
            pending: HashMap::new(),
            groups: HashMap::new(),
            next_group: 0,
            quiesce: None,
            directory,
            endpoint_metrics: Arc::new(EndpointMetrics::default()),
        }
    }

    /// Arm the recurring tasks
    pub fn start(&mut self, now: Instant) {
        self.scheduler.schedule_maintenance(now);
        self.scheduler.trigger(now);
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn port(&self, port_id: &PortId) -> Option<&Port> {
        self.ports.get(port_id)
    }

    pub fn port_mut(&mut self, port_id: &PortId) -> Option<&mut Port> {
        self.ports.get_mut(port_id)
    }

    /// Port of `actor` named `name`
    pub fn port_id(&self, actor: &ActorId, name: &str) -> Option<&PortId> {
        self.port_names.get(actor).and_then(|names| names.get(name))
    }

    /// Create a port for `actor` and publish its location
    pub fn add_port(&mut self, actor: &ActorId, name: &str, properties: PortProperties) -> PortId {
        let port = Port::new(name, actor.clone(), properties, self.config.queue.default_length);
        let port_id = port.id().clone();
        self.directory.register(PortRecord {
            port_id: port_id.clone(),
            node: self.id.clone(),
            actor_id: actor.clone(),
            port_name: name.to_string(),
            properties: port.properties().clone(),
        });
        self.port_names
            .entry(actor.clone())
            .or_default()
            .insert(name.to_string(), port_id.clone());
        self.ports.insert(port_id.clone(), port);
        debug!(node = %self.id, actor = %actor, port = name, port_id = %port_id, "Port added");
        port_id
    }

    pub fn set_port_config(&mut self, port_id: &PortId, config: &QueueConfig) -> Result<()> {
        let port = self
            .ports
            .get_mut(port_id)
            .ok_or_else(|| RuntimeError::unknown_port(port_id))?;
        port.set_config(config)?;
        Ok(())
    }

    pub fn add_actor(&mut self, actor: Box<dyn Actor>, now: Instant) {
        let id = actor.id().clone();
        info!(node = %self.id, actor = %id, "Actor added");
        self.actors.insert(id, actor);
        self.scheduler.trigger(now);
    }

    /// Serialized state of a port
    pub fn port_state(&self, port_id: &PortId) -> Result<Value> {
        let port = self.ports.get(port_id).ok_or_else(|| RuntimeError::unknown_port(port_id))?;
        Ok(port.state(None)?)
    }

    pub fn stats(&self) -> NodeStats {
        NodeStats {
            ports: self.ports.len(),
            actors: self.actors.len(),
            tunnels: self.tunnels.len(),
            pending_replies: self.pending.len(),
            endpoint: self.endpoint_metrics.snapshot(),
            scheduler: self.scheduler.metrics().snapshot(),
        }
    }

    // -- driver interface --

    pub fn next_deadline(&self) -> Option<Instant> {
        self.scheduler.next_deadline()
    }

    pub fn drain_outbox(&mut self) -> Vec<OutboundAction> {
        self.outbox.drain()
    }

    pub fn handle_link_event(&mut self, event: LinkEvent, now: Instant) {
        match event {
            LinkEvent::Up(peer) => self.link_up(&peer, now),
            LinkEvent::Lost(peer) => self.link_lost(&peer, now),
            LinkEvent::Frame { from, payload } => match flow_codec::decode_frame(&payload) {
                Ok(envelope) => self.handle_envelope(envelope, now),
                Err(e) => warn!(node = %self.id, peer = %from, error = %e, "Dropping undecodable frame"),
            },
        }
    }

    pub fn link_up(&mut self, peer: &NodeId, now: Instant) {
        debug!(node = %self.id, peer = %peer, "Link up");
        self.tunnels.link_up(peer, &mut self.outbox);
        self.process_tunnel_events(now);
    }

    /// The link failed: tunnels go down and requests to the peer fail
    pub fn link_lost(&mut self, peer: &NodeId, now: Instant) {
        warn!(node = %self.id, peer = %peer, "Link lost");
        self.tunnels.link_lost(peer);
        let orphaned: Vec<Uuid> = self
            .pending
            .iter()
            .filter(|(_, p)| p.peer_node() == peer)
            .map(|(uuid, _)| *uuid)
            .collect();
        for uuid in orphaned {
            self.scheduler.cancel(Task::ReplyTimeout(uuid));
            if let Some(pending) = self.pending.remove(&uuid) {
                self.resolve_pending(pending, Response::new(Status::ServiceUnavailable), now);
            }
        }
        self.process_tunnel_events(now);
    }

    pub fn handle_envelope(&mut self, envelope: Envelope, now: Instant) {
        if envelope.to_rt_uuid != self.id {
            warn!(node = %self.id, to = %envelope.to_rt_uuid, cmd = envelope.cmd_name(), "Envelope for another node");
            return;
        }
        trace!(node = %self.id, from = %envelope.from_rt_uuid, cmd = envelope.cmd_name(), "Envelope received");

        match &envelope.command {
            Command::TunnelNew {
                tunnel_type,
                tunnel_id,
                policy,
            } => {
                self.tunnels
                    .handle_tunnel_new(&envelope, tunnel_type, *tunnel_id, policy, &mut self.outbox);
            }
            Command::TunnelDestroy { tunnel_id } => {
                self.tunnels.handle_destroy(&envelope, *tunnel_id, &mut self.outbox);
            }
            Command::TunnelData { tunnel_id, value } => {
                self.tunnels.handle_data(&envelope.from_rt_uuid, *tunnel_id, value.clone());
            }
            Command::PortConnect(request) => {
                let response = self.connection_request(&envelope.from_rt_uuid, request.clone(), now);
                self.outbox.reply(&envelope, response);
            }
            Command::PortDisconnect(request) => {
                let response = self.disconnection_request(request.clone(), now);
                self.outbox.reply(&envelope, response);
            }
            Command::Reply { value } => {
                self.scheduler.cancel(Task::ReplyTimeout(envelope.msg_uuid));
                if !self.tunnels.handle_reply(&envelope.msg_uuid, value) {
                    match self.pending.remove(&envelope.msg_uuid) {
                        Some(pending) => self.resolve_pending(pending, value.clone(), now),
                        None => debug!(node = %self.id, msg_uuid = %envelope.msg_uuid, "Reply to unknown request"),
                    }
                }
            }
        }
        self.process_tunnel_events(now);
    }

    fn resolve_pending(&mut self, pending: PendingReply, response: Response, now: Instant) {
        match pending {
            PendingReply::Connect(conn) => self.connect_reply(conn, response, now),
            PendingReply::Disconnect { group, port_id, .. } => self.disconnect_reply(group, &port_id, response, now),
        }
    }

    fn process_tunnel_events(&mut self, now: Instant) {
        while let Some(event) = self.tunnels.poll_event() {
            if !TokenTunnel::<TunnelConnect>::is_token_tunnel(&event.tunnel_type) {
                debug!(node = %self.id, tunnel_type = %event.tunnel_type, "Event for unhandled tunnel type");
                continue;
            }
            match event.kind {
                TunnelEventKind::Incoming => {
                    for conn in self.token_tunnel.incoming(&event.peer, event.handle) {
                        self.send_port_connect(conn, now);
                    }
                    self.scheduler.trigger(now);
                }
                TunnelEventKind::Up => {
                    for conn in self.token_tunnel.up(&event.peer, event.handle) {
                        self.send_port_connect(conn, now);
                    }
                    self.scheduler.trigger(now);
                }
                TunnelEventKind::Down => {
                    if let Some(parked) = self.token_tunnel.down(&event.peer, event.handle) {
                        for conn in parked {
                            warn!(port_id = %conn.port_id, peer_node = %event.peer, "Token tunnel failed before connect");
                            conn.completion.fail(Status::InternalError);
                        }
                        self.token_tunnel_lost(&event.peer);
                    }
                }
                TunnelEventKind::Recv(value) => self.recv_token_message(&event.peer, value, now),
            }
        }
        self.arm_reply_timeouts(now);
    }

    /// Give every request sent since the last call its reply deadline
    pub(crate) fn arm_reply_timeouts(&mut self, now: Instant) {
        let timeout = self.config.connection.reply_timeout();
        for msg_uuid in self.outbox.take_requests() {
            self.scheduler.insert(now + timeout, Task::ReplyTimeout(msg_uuid));
        }
    }

    /// The peer never answered: the request resolves as GATEWAY_TIMEOUT
    fn reply_timed_out(&mut self, msg_uuid: Uuid, now: Instant) {
        if !self.tunnels.request_timed_out(&msg_uuid) {
            match self.pending.remove(&msg_uuid) {
                Some(pending) => {
                    warn!(node = %self.id, peer = %pending.peer_node(), msg_uuid = %msg_uuid, "Request unanswered");
                    self.resolve_pending(pending, Response::new(Status::GatewayTimeout), now);
                }
                None => trace!(node = %self.id, msg_uuid = %msg_uuid, "Reply timeout for settled request"),
            }
        }
        self.process_tunnel_events(now);
    }

    /// In-flight tokens to `peer` are resent once a new tunnel is up
    fn token_tunnel_lost(&mut self, peer: &NodeId) {
        for port in self.ports.values_mut() {
            let peers: Vec<PortId> = port
                .endpoints()
                .iter()
                .filter(|e| matches!(e, Endpoint::TunnelOut(_)) && e.peer_node() == peer)
                .map(|e| e.peer_port_id().clone())
                .collect();
            for peer_port in peers {
                if let Some((Endpoint::TunnelOut(endpoint), queue)) = port.endpoint_and_queue(&peer_port) {
                    endpoint.tunnel_down(queue);
                }
            }
        }
    }

    fn recv_token_message(&mut self, peer: &NodeId, value: Value, now: Instant) {
        let message = match TokenMessage::from_value(value) {
            Ok(message) => message,
            Err(e) => {
                warn!(node = %self.id, peer = %peer, error = %e, "Malformed token message");
                return;
            }
        };
        match message {
            TokenMessage::Token {
                port_id,
                peer_port_id,
                sequencenbr,
                token,
            } => {
                let outcome = match self
                    .ports
                    .get_mut(&peer_port_id)
                    .and_then(|p| p.endpoint_and_queue(&port_id))
                {
                    Some((Endpoint::TunnelIn(endpoint), queue)) => Some(endpoint.recv_token(queue, sequencenbr, token)),
                    _ => None,
                };
                let (ack, wake) = outcome.unwrap_or_else(|| {
                    warn!(port_id = %peer_port_id, peer = %port_id, seq = sequencenbr, "Token for unknown endpoint");
                    (TokenAck::Abort, Wake::Idle)
                });
                let reply = TokenMessage::TokenReply {
                    port_id,
                    peer_port_id,
                    sequencenbr,
                    value: ack,
                };
                let mut sender = self.token_tunnel.sender(&mut self.tunnels, &mut self.outbox);
                if let Err(e) = sender.send_token(peer, reply) {
                    debug!(peer = %peer, error = %e, "Token reply not sent");
                }
                self.apply_wake(wake, now);
            }
            TokenMessage::TokenReply {
                port_id,
                peer_port_id,
                sequencenbr,
                value,
            } => {
                let wake = match self
                    .ports
                    .get_mut(&port_id)
                    .and_then(|p| p.endpoint_and_queue(&peer_port_id))
                {
                    Some((Endpoint::TunnelOut(endpoint), queue)) => endpoint.reply(queue, sequencenbr, value, now),
                    _ => {
                        debug!(port_id = %port_id, peer = %peer_port_id, seq = sequencenbr, "Reply for unknown endpoint");
                        Wake::Idle
                    }
                };
                self.apply_wake(wake, now);
            }
        }
    }

    fn apply_wake(&mut self, wake: Wake, now: Instant) {
        match wake {
            Wake::Idle => {}
            Wake::Now => self.scheduler.trigger(now),
            Wake::At(at) => self.scheduler.insert(at, Task::Strategy),
        }
    }

    // -- scheduling --

    /// Run every due task. At most one strategy pass runs per call so the
    /// driver can interleave I/O.
    pub fn on_timer(&mut self, now: Instant) {
        let mut ran_strategy = false;
        while let Some(task) = self.scheduler.pop_due(now) {
            match task {
                Task::Strategy if ran_strategy => {
                    self.scheduler.trigger(now);
                    break;
                }
                Task::Strategy => {
                    ran_strategy = true;
                    self.run_strategy(now);
                }
                Task::Watchdog => {
                    self.scheduler.metrics().record_watchdog();
                    debug!(node = %self.id, "Watchdog fired, re-running strategy");
                    self.scheduler.trigger(now);
                }
                Task::Maintenance => {
                    self.scheduler.metrics().record_maintenance();
                    let pruned = self.tunnels.sweep();
                    if pruned > 0 {
                        debug!(node = %self.id, pruned, "Tunnel bookkeeping swept");
                    }
                    self.scheduler.schedule_maintenance(now);
                }
                Task::Deadline(id) => self.quiesce_deadline(id),
                Task::ReplyTimeout(msg_uuid) => self.reply_timed_out(msg_uuid, now),
            }
        }
        self.arm_reply_timeouts(now);
        self.scheduler.arm_watchdog(now);
    }

    /// One strategy pass: fire enabled actors, then communicate
    fn run_strategy(&mut self, now: Instant) {
        self.scheduler.metrics().record_pass();
        let mut activity = false;

        let no_ports = HashMap::new();
        let actor_ids: Vec<ActorId> = self.actors.keys().cloned().collect();
        for id in actor_ids {
            let Some(actor) = self.actors.get_mut(&id) else {
                continue;
            };
            if !actor.enabled() {
                continue;
            }
            let names = self.port_names.get(&id).unwrap_or(&no_ports);
            let ports = &mut self.ports;
            let fired = self.scheduler.fire_actor(|| {
                let mut io = ActorIo::new(&id, &mut *ports, names);
                actor.fire(&mut io)
            });
            if fired > 0 {
                trace!(actor = %id, fired, "Actor fired");
                activity = true;
            }
        }

        if self.communicate(now) {
            self.scheduler.metrics().record_communicate();
            activity = true;
        }
        if activity {
            self.scheduler.trigger(now);
        }
    }

    /// Communicate phase over every monitored endpoint; true on progress
    pub(crate) fn communicate(&mut self, now: Instant) -> bool {
        let targets: Vec<(PortId, PortId)> = self
            .ports
            .values()
            .flat_map(|p| {
                p.endpoints()
                    .iter()
                    .filter(|e| e.use_monitor())
                    .map(move |e| (p.id().clone(), e.peer_port_id().clone()))
            })
            .collect();

        let mut progress = false;
        let mut wake = Wake::Idle;
        for (port_id, peer_id) in targets {
            let local = match self.ports.get(&port_id).and_then(|p| p.endpoint(&peer_id)) {
                Some(Endpoint::LocalOut(endpoint)) => Some(endpoint.clone()),
                _ => None,
            };
            if let Some(endpoint) = local {
                progress |= endpoint.communicate(&mut self.ports, &self.endpoint_metrics);
                continue;
            }
            if let Some((Endpoint::TunnelOut(endpoint), queue)) =
                self.ports.get_mut(&port_id).and_then(|p| p.endpoint_and_queue(&peer_id))
            {
                let mut sender = self.token_tunnel.sender(&mut self.tunnels, &mut self.outbox);
                let (sent, retry) = endpoint.communicate(queue, &mut sender, now);
                progress |= sent;
                wake = wake.merge(retry);
            }
        }
        if let Wake::At(at) = wake {
            self.scheduler.insert(at, Task::Strategy);
        }
        progress
    }

    // -- quiesce --

    /// Disconnect every connected port with EXHAUST; answers once all are
    /// done, or with GATEWAY_TIMEOUT when `timeout` passes first
    pub fn quiesce(&mut self, timeout: Duration, completion: Completion, now: Instant) {
        if self.quiesce.is_some() {
            warn!(node = %self.id, "Quiesce already in progress");
            completion.fail(Status::ServiceUnavailable);
            return;
        }
        let ports: Vec<PortId> = self
            .ports
            .values()
            .filter(|p| !p.peers().is_empty())
            .map(|p| p.id().clone())
            .collect();
        if ports.is_empty() {
            completion.complete(Response::ok());
            return;
        }

        let deadline = self.next_group_id();
        self.scheduler.insert(now + timeout, Task::Deadline(deadline));
        info!(node = %self.id, ports = ports.len(), timeout_ms = timeout.as_millis() as u64, "Quiescing node");
        self.quiesce = Some(Quiesce {
            remaining: ports.iter().cloned().collect(),
            failure: None,
            deadline,
            completion,
        });
        for port_id in ports {
            self.start_disconnect(&port_id, Disconnect::Exhaust, Waiter::Quiesce(port_id.clone()), now);
        }
        self.arm_reply_timeouts(now);
    }

    pub(crate) fn quiesce_port_done(&mut self, port_id: &PortId, response: &Response, _now: Instant) {
        let Some(quiesce) = self.quiesce.as_mut() else {
            return;
        };
        quiesce.remaining.remove(port_id);
        if !response.is_success() && quiesce.failure.is_none() {
            quiesce.failure = Some(response.status);
        }
        if !quiesce.remaining.is_empty() {
            return;
        }
        if let Some(quiesce) = self.quiesce.take() {
            self.scheduler.cancel(Task::Deadline(quiesce.deadline));
            let status = quiesce.failure.unwrap_or(Status::Ok);
            info!(node = %self.id, status = %status, "Node quiesced");
            quiesce.completion.complete(Response::new(status));
        }
    }

    fn quiesce_deadline(&mut self, id: u64) {
        if self.quiesce.as_ref().map(|q| q.deadline) != Some(id) {
            return;
        }
        if let Some(quiesce) = self.quiesce.take() {
            warn!(node = %self.id, remaining = quiesce.remaining.len(), "Quiesce timed out, proceeding");
            quiesce.completion.fail(Status::GatewayTimeout);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::InMemoryDirectory;
    use flow_types::Token;
    use parking_lot::Mutex;
    use serde_json::json;

    struct Counter {
        id: ActorId,
        next: u64,
        limit: u64,
    }

    impl Actor for Counter {
        fn id(&self) -> &ActorId {
            &self.id
        }

        fn fire(&mut self, io: &mut ActorIo<'_>) -> bool {
            if self.next >= self.limit || !io.slots_available("out", 1) {
                return false;
            }
            if io.write("out", Token::new(json!(self.next))).is_err() {
                return false;
            }
            self.next += 1;
            true
        }
    }

    struct Sink {
        id: ActorId,
        seen: Arc<Mutex<Vec<Value>>>,
    }

    impl Actor for Sink {
        fn id(&self) -> &ActorId {
            &self.id
        }

        fn fire(&mut self, io: &mut ActorIo<'_>) -> bool {
            match io.read("in") {
                Ok(token) => {
                    self.seen.lock().push(token.value().clone());
                    true
                }
                Err(_) => false,
            }
        }
    }

    fn node() -> Node {
        Node::new(
            NodeId::from("node-a"),
            RuntimeConfig::default(),
            Arc::new(InMemoryDirectory::new()),
        )
    }

    fn run_until_idle(node: &mut Node, now: Instant) {
        for _ in 0..100 {
            if node.next_deadline().map_or(true, |d| d > now) {
                break;
            }
            node.on_timer(now);
        }
    }

    #[test]
    fn test_local_pipeline_delivers_in_order() {
        let mut node = node();
        let now = Instant::now();
        let src = ActorId::from("src");
        let sink = ActorId::from("sink");
        let out = node.add_port(&src, "out", PortProperties::outport());
        let inp = node.add_port(&sink, "in", PortProperties::inport());

        let (completion, mut rx) = Completion::channel("connect");
        node.connect(&out, crate::connection::PeerPort::by_id(inp.clone()), completion, now);
        assert!(rx.try_recv().unwrap().is_success());

        let seen = Arc::new(Mutex::new(Vec::new()));
        node.add_actor(Box::new(Counter { id: src, next: 0, limit: 10 }), now);
        node.add_actor(Box::new(Sink { id: sink, seen: seen.clone() }), now);
        run_until_idle(&mut node, now);

        let expected: Vec<Value> = (0..10).map(|i| json!(i)).collect();
        assert_eq!(*seen.lock(), expected);
        assert_eq!(node.stats().endpoint.local_transfers, 10);
        assert!(!node.port(&inp).unwrap().tokens_available(1));
    }

    #[test]
    fn test_connect_by_name_and_reconnect_is_idempotent() {
        let mut node = node();
        let now = Instant::now();
        let out = node.add_port(&ActorId::from("src"), "out", PortProperties::outport());
        node.add_port(&ActorId::from("sink"), "in", PortProperties::inport());
        let peer = crate::connection::PeerPort::by_name(ActorId::from("sink"), "in");

        for _ in 0..2 {
            let (completion, mut rx) = Completion::channel("connect");
            node.connect(&out, peer.clone(), completion, now);
            assert!(rx.try_recv().unwrap().is_success());
        }
        assert_eq!(node.port(&out).unwrap().endpoints().len(), 1);
    }

    #[test]
    fn test_connect_unknown_peer_not_found() {
        let mut node = node();
        let out = node.add_port(&ActorId::from("src"), "out", PortProperties::outport());
        let (completion, mut rx) = Completion::channel("connect");
        node.connect(&out, crate::connection::PeerPort::by_id(PortId::from("nowhere")), completion, Instant::now());
        assert_eq!(rx.try_recv().unwrap().status, Status::NotFound);
    }

    #[test]
    fn test_local_exhaust_hands_tokens_to_peer() {
        let mut node = node();
        let now = Instant::now();
        let out = node.add_port(&ActorId::from("src"), "out", PortProperties::outport());
        let inp = node.add_port(&ActorId::from("sink"), "in", PortProperties::inport());
        let (completion, _rx) = Completion::channel("connect");
        node.connect(&out, crate::connection::PeerPort::by_id(inp.clone()), completion, now);

        for i in 0..3 {
            node.port_mut(&out).unwrap().write_token(Token::new(json!(i))).unwrap();
        }
        let (completion, mut rx) = Completion::channel("disconnect");
        node.disconnect(&out, Disconnect::Exhaust, completion, now);
        assert!(rx.try_recv().unwrap().is_success());

        let in_port = node.port_mut(&inp).unwrap();
        assert!(in_port.endpoints().is_empty());
        for i in 0..3 {
            assert_eq!(in_port.peek_token().unwrap().value(), &json!(i));
            in_port.commit().unwrap();
        }
    }

    #[test]
    fn test_disconnect_without_peers_is_ok() {
        let mut node = node();
        let out = node.add_port(&ActorId::from("src"), "out", PortProperties::outport());
        let (completion, mut rx) = Completion::channel("disconnect");
        node.disconnect(&out, Disconnect::Terminate, completion, Instant::now());
        assert!(rx.try_recv().unwrap().is_success());
    }

    #[test]
    fn test_quiesce_idle_node_completes() {
        let mut node = node();
        let (completion, mut rx) = Completion::channel("quiesce");
        node.quiesce(Duration::from_secs(1), completion, Instant::now());
        assert!(rx.try_recv().unwrap().is_success());
    }

    #[test]
    fn test_watchdog_rearms_when_idle() {
        let mut node = node();
        let now = Instant::now();
        node.on_timer(now);
        let deadline = node.next_deadline().unwrap();
        assert_eq!(deadline, now + node.config().scheduler.watchdog_timeout());
        node.on_timer(deadline);
        assert_eq!(node.stats().scheduler.watchdog_fires, 1);
    }
}
