//! Connections between ports
//!
//! A connection is the short-lived orchestration that pairs two ports'
//! endpoints or tears them apart. It is never stored beyond the handshake:
//! a tunneled connect lives in the token tunnel's parked list or in the
//! node's pending-reply table, keyed by the request's msg_uuid.
//!
//! ```text
//!                 peer on this node
//!  connect ──┬──────────────────────────► local ───────────► connected
//!            │ peer remote                                     ▲
//!            └──► tunnel PENDING ─(up)─► PORT_CONNECT ─ OK ────┘
//!                      │                     │ GONE             → resend (bounded)
//!                      │ down                │ NOT_FOUND etc.   → relocate (bounded)
//!                      ▼                     ▼
//!                   failed  ◄──────── retries exhausted
//! ```
//!
//! Disconnecting a port with several peers runs one disconnect per peer
//! and answers the caller once, after the last one.

pub mod local;
pub mod tunnel;

use crate::completion::Completion;
use crate::directory::PortRecord;
use crate::node::Node;
use flow_codec::{from_value, to_value, Command, ExhaustedTokens, PortDisconnect, PortDisconnectReply};
use flow_types::{ActorId, Disconnect, NodeId, PortId, PortProperties, Response, Status};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Where and what the peer port is, as far as the caller knows
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PeerPort {
    pub node: Option<NodeId>,
    pub port_id: Option<PortId>,
    pub actor_id: Option<ActorId>,
    pub port_name: Option<String>,
    pub properties: Option<PortProperties>,
}

impl PeerPort {
    pub fn by_id(port_id: PortId) -> Self {
        Self {
            port_id: Some(port_id),
            ..Default::default()
        }
    }

    pub fn by_name(actor_id: ActorId, port_name: impl Into<String>) -> Self {
        Self {
            actor_id: Some(actor_id),
            port_name: Some(port_name.into()),
            ..Default::default()
        }
    }

    pub fn on(mut self, node: NodeId) -> Self {
        self.node = Some(node);
        self
    }

    pub fn with_properties(mut self, properties: PortProperties) -> Self {
        self.properties = Some(properties);
        self
    }

    pub(crate) fn fill_from(&mut self, record: &PortRecord) {
        self.node = Some(record.node.clone());
        self.port_id = Some(record.port_id.clone());
        if self.properties.is_none() {
            self.properties = Some(record.properties.clone());
        }
    }
}

/// A connect waiting on a tunnel or a `PORT_CONNECT` reply
#[derive(Debug)]
pub(crate) struct TunnelConnect {
    pub port_id: PortId,
    pub peer: PeerPort,
    pub peer_node: NodeId,
    pub gone_retries: u32,
    pub relocate_retries: u32,
    pub completion: Completion,
}

impl TunnelConnect {
    pub fn new(port_id: PortId, peer: PeerPort, completion: Completion) -> Self {
        let peer_node = peer.node.clone().unwrap_or_else(|| NodeId::from(""));
        Self {
            port_id,
            peer,
            peer_node,
            gone_retries: 0,
            relocate_retries: 0,
            completion,
        }
    }
}

/// Continuation of an outstanding request, resumed by its reply
#[derive(Debug)]
pub(crate) enum PendingReply {
    Connect(TunnelConnect),
    Disconnect {
        group: u64,
        port_id: PortId,
        peer_node: NodeId,
    },
}

impl PendingReply {
    pub fn peer_node(&self) -> &NodeId {
        match self {
            PendingReply::Connect(conn) => &conn.peer_node,
            PendingReply::Disconnect { peer_node, .. } => peer_node,
        }
    }
}

/// Who hears about a finished disconnect
#[derive(Debug)]
pub(crate) enum Waiter {
    Caller(Completion),
    Quiesce(PortId),
}

/// Parallel per-peer disconnects of one port
#[derive(Debug)]
pub(crate) struct DisconnectGroup {
    remaining: usize,
    waiter: Option<Waiter>,
}

impl DisconnectGroup {
    pub fn new(peers: usize, waiter: Waiter) -> Self {
        Self {
            remaining: peers,
            waiter: Some(waiter),
        }
    }

    /// Record one finished peer. The waiter is handed out once: with the
    /// first failure, or with OK after the last peer.
    pub fn finish(&mut self, response: &Response) -> Option<(Waiter, Response)> {
        self.remaining = self.remaining.saturating_sub(1);
        if !response.is_success() {
            return self.waiter.take().map(|w| (w, Response::new(response.status)));
        }
        if self.remaining == 0 {
            return self.waiter.take().map(|w| (w, Response::ok()));
        }
        None
    }

    pub fn is_done(&self) -> bool {
        self.remaining == 0
    }
}

impl Node {
    /// Connect `port_id` to a peer port, local or remote
    pub fn connect(&mut self, port_id: &PortId, peer: PeerPort, completion: Completion, now: Instant) {
        if !self.ports.contains_key(port_id) {
            warn!(port_id = %port_id, "Connect on unknown port");
            completion.fail(Status::NotFound);
            return;
        }
        self.route_connect(TunnelConnect::new(port_id.clone(), peer, completion), now);
        self.arm_reply_timeouts(now);
    }

    /// Resolve the peer's node and continue locally or over a tunnel
    pub(crate) fn route_connect(&mut self, mut conn: TunnelConnect, now: Instant) {
        let Some(direction) = self.ports.get(&conn.port_id).map(|p| p.direction()) else {
            conn.completion.fail(Status::NotFound);
            return;
        };

        if conn.peer.node.is_none() {
            match self.directory.locate(&conn.peer, direction.opposite()) {
                Some(record) => conn.peer.fill_from(&record),
                None => {
                    debug!(port_id = %conn.port_id, peer = ?conn.peer, "Peer port not found in directory");
                    conn.completion.fail(Status::NotFound);
                    return;
                }
            }
        }
        let Some(node) = conn.peer.node.clone() else {
            conn.completion.fail(Status::NotFound);
            return;
        };

        if node == self.id {
            let status = self.connect_local(&conn.port_id, &conn.peer, now);
            if status == Status::NotFound && conn.relocate_retries < self.config.connection.relocate_retries {
                conn.relocate_retries += 1;
                debug!(port_id = %conn.port_id, attempt = conn.relocate_retries, "Peer port left this node, relocating");
                conn.peer.node = None;
                self.route_connect(conn, now);
                return;
            }
            conn.completion.complete(Response::new(status));
        } else {
            conn.peer_node = node;
            self.connect_tunneled(conn, now);
        }
    }

    /// Disconnect every peer of `port_id`
    pub fn disconnect(&mut self, port_id: &PortId, terminate: Disconnect, completion: Completion, now: Instant) {
        self.start_disconnect(port_id, terminate, Waiter::Caller(completion), now);
        self.arm_reply_timeouts(now);
    }

    pub(crate) fn start_disconnect(&mut self, port_id: &PortId, terminate: Disconnect, waiter: Waiter, now: Instant) {
        let Some(port) = self.ports.get(port_id) else {
            warn!(port_id = %port_id, "Disconnect on unknown port");
            self.resolve_waiter(waiter, Response::new(Status::NotFound), now);
            return;
        };
        let peers = port.peers();
        if peers.is_empty() {
            self.resolve_waiter(waiter, Response::ok(), now);
            return;
        }

        let group = self.next_group_id();
        self.groups.insert(group, DisconnectGroup::new(peers.len(), waiter));
        info!(port_id = %port_id, peers = peers.len(), ?terminate, "Disconnecting port");

        for (node, peer_id) in peers {
            let finished = match node {
                None => {
                    if let Some(port) = self.ports.get_mut(port_id) {
                        let (_, tokens) = port.detach(std::slice::from_ref(&peer_id), terminate);
                        if tokens.values().any(|t| !t.is_empty()) {
                            warn!(port_id = %port_id, peer = %peer_id, "Dropping tokens of a disconnected peer");
                        }
                    }
                    Some(Response::ok())
                }
                Some(node) if node == self.id => {
                    Some(Response::new(self.disconnect_local(port_id, &peer_id, terminate)))
                }
                Some(node) => {
                    self.disconnect_remote(port_id, &peer_id, &node, terminate, group);
                    None
                }
            };
            if let Some(response) = finished {
                self.group_finished(group, &response, now);
            }
        }
        self.scheduler.trigger(now);
    }

    fn disconnect_remote(&mut self, port_id: &PortId, peer_id: &PortId, peer_node: &NodeId, terminate: Disconnect, group: u64) {
        let Some(port) = self.ports.get_mut(port_id) else {
            return;
        };
        let (_, remaining_tokens) = port.detach(std::slice::from_ref(peer_id), terminate);
        let request = PortDisconnect {
            port_id: port_id.clone(),
            peer_actor_id: None,
            peer_port_name: None,
            peer_port_id: peer_id.clone(),
            peer_port_dir: Some(port.direction().opposite()),
            terminate: terminate.for_peer(),
            remaining_tokens,
        };
        let msg_uuid = self.outbox.send(peer_node, Command::PortDisconnect(request));
        self.pending.insert(
            msg_uuid,
            PendingReply::Disconnect {
                group,
                port_id: port_id.clone(),
                peer_node: peer_node.clone(),
            },
        );
    }

    pub(crate) fn disconnect_reply(&mut self, group: u64, port_id: &PortId, response: Response, now: Instant) {
        if response.is_success() {
            let reply = response
                .data
                .clone()
                .map(|data| from_value::<PortDisconnectReply>("port disconnect reply", data))
                .transpose();
            match reply {
                Ok(reply) => {
                    let tokens = reply.unwrap_or_default().remaining_tokens;
                    if let Some(port) = self.ports.get_mut(port_id) {
                        port.exhausted_tokens(&tokens);
                    }
                }
                Err(e) => warn!(port_id = %port_id, error = %e, "Malformed disconnect reply"),
            }
            self.scheduler.trigger(now);
        } else {
            warn!(port_id = %port_id, status = %response.status, "Peer refused disconnect");
        }
        self.group_finished(group, &response, now);
    }

    fn group_finished(&mut self, group_id: u64, response: &Response, now: Instant) {
        let Some(group) = self.groups.get_mut(&group_id) else {
            return;
        };
        let answer = group.finish(response);
        if group.is_done() {
            self.groups.remove(&group_id);
        }
        if let Some((waiter, response)) = answer {
            self.resolve_waiter(waiter, response, now);
        }
    }

    pub(crate) fn resolve_waiter(&mut self, waiter: Waiter, response: Response, now: Instant) {
        match waiter {
            Waiter::Caller(completion) => completion.complete(response),
            Waiter::Quiesce(port_id) => self.quiesce_port_done(&port_id, &response, now),
        }
    }

    /// Handle a peer's `PORT_DISCONNECT`
    pub(crate) fn disconnection_request(&mut self, request: PortDisconnect, now: Instant) -> Response {
        let Some(port) = self.ports.get_mut(&request.peer_port_id) else {
            debug!(port_id = %request.peer_port_id, "Disconnect request for unknown port");
            return Response::new(Status::NotFound);
        };

        let known = port.peers().iter().any(|(_, p)| p == &request.port_id);
        let mut remaining_tokens = ExhaustedTokens::new();
        if known {
            let (_, tokens) = port.detach(std::slice::from_ref(&request.port_id), request.terminate);
            remaining_tokens = tokens;
            port.exhausted_tokens(&request.remaining_tokens);
        } else {
            debug!(port_id = %request.peer_port_id, peer = %request.port_id, "Already disconnected");
        }
        self.scheduler.trigger(now);

        match to_value("port disconnect reply", &PortDisconnectReply { remaining_tokens }) {
            Ok(data) => Response::ok_with(data),
            Err(e) => {
                warn!(error = %e, "Could not encode salvaged tokens");
                Response::new(Status::InternalError)
            }
        }
    }

    pub(crate) fn next_group_id(&mut self) -> u64 {
        self.next_group += 1;
        self.next_group
    }
}
