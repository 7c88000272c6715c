//! Tunnels multiplexed over node-to-node links
//!
//! A tunnel is a logical channel of one usage type (e.g. `"token"`) between
//! this node and one peer. The manager is a pure state machine: inbound
//! protocol messages and link changes go in, [`Outbox`] actions and
//! [`TunnelEvent`]s come out.
//!
//! ```text
//!            tunnel_new / TUNNEL_NEW reply OK
//!  PENDING ───────────────────────────────────► WORKING
//!     │                                            │
//!     │ reply failed / link lost    close / destroy / link lost
//!     ▼                                            ▼
//!  TERMINATED ◄─────────────────────────────────────┘
//! ```
//!
//! Simultaneous setup from both sides converges on the lower of the two
//! ids: a pending tunnel receiving the peer's `TUNNEL_NEW` with a lower id
//! adopts it and goes WORKING; the side holding the lower id keeps it and
//! becomes WORKING when its own request is answered.

use crate::outbox::Outbox;
use crate::{Result, TransportError};
use flow_codec::{from_value, to_value, Command, Envelope, TunnelNewReply};
use flow_types::{NodeId, Response, Status, TunnelId};
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Stable local key for a tunnel; survives id changes during setup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TunnelHandle(u64);

impl fmt::Display for TunnelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tunnel#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelStatus {
    Pending,
    Working,
    Terminated,
}

#[derive(Debug, Clone)]
pub struct Tunnel {
    handle: TunnelHandle,
    id: TunnelId,
    peer: NodeId,
    tunnel_type: String,
    policy: Value,
    status: TunnelStatus,
}

impl Tunnel {
    pub fn handle(&self) -> TunnelHandle {
        self.handle
    }

    /// Current id; may change while PENDING, fixed once WORKING
    pub fn id(&self) -> TunnelId {
        self.id
    }

    pub fn peer(&self) -> &NodeId {
        &self.peer
    }

    pub fn tunnel_type(&self) -> &str {
        &self.tunnel_type
    }

    pub fn policy(&self) -> &Value {
        &self.policy
    }

    pub fn status(&self) -> TunnelStatus {
        self.status
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TunnelEventKind {
    /// A peer opened a tunnel of an accepted type; it is already WORKING
    Incoming,
    /// PENDING → WORKING
    Up,
    /// The tunnel failed, was destroyed or its link was lost
    Down,
    /// Payload received over the tunnel
    Recv(Value),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TunnelEvent {
    pub handle: TunnelHandle,
    pub peer: NodeId,
    pub tunnel_type: String,
    pub kind: TunnelEventKind,
}

/// Per-node tunnel registry and setup protocol
#[derive(Debug)]
pub struct TunnelManager {
    tunnels: HashMap<TunnelHandle, Tunnel>,
    next_handle: u64,
    accepted_types: HashSet<String>,
    links: HashSet<NodeId>,
    awaiting_link: HashMap<NodeId, Vec<TunnelHandle>>,
    setup_requests: HashMap<Uuid, TunnelHandle>,
    destroy_requests: HashMap<Uuid, TunnelHandle>,
    events: VecDeque<TunnelEvent>,
}

impl Default for TunnelManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TunnelManager {
    pub fn new() -> Self {
        Self {
            tunnels: HashMap::new(),
            next_handle: 1,
            accepted_types: HashSet::new(),
            links: HashSet::new(),
            awaiting_link: HashMap::new(),
            setup_requests: HashMap::new(),
            destroy_requests: HashMap::new(),
            events: VecDeque::new(),
        }
    }

    /// Accept peer-initiated tunnels of this type
    pub fn accept_type(&mut self, tunnel_type: impl Into<String>) {
        self.accepted_types.insert(tunnel_type.into());
    }

    pub fn get(&self, handle: TunnelHandle) -> Option<&Tunnel> {
        self.tunnels.get(&handle)
    }

    /// Live tunnel of `tunnel_type` to `peer`
    pub fn find(&self, peer: &NodeId, tunnel_type: &str) -> Option<TunnelHandle> {
        self.tunnels
            .values()
            .find(|t| {
                &t.peer == peer && t.tunnel_type == tunnel_type && t.status != TunnelStatus::Terminated
            })
            .map(|t| t.handle)
    }

    fn find_by_id(&self, peer: &NodeId, id: TunnelId) -> Option<TunnelHandle> {
        self.tunnels
            .values()
            .find(|t| &t.peer == peer && t.id == id)
            .map(|t| t.handle)
    }

    pub fn is_linked(&self, peer: &NodeId) -> bool {
        self.links.contains(peer)
    }

    pub fn len(&self) -> usize {
        self.tunnels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tunnels.is_empty()
    }

    pub fn poll_event(&mut self) -> Option<TunnelEvent> {
        self.events.pop_front()
    }

    pub fn drain_events(&mut self) -> Vec<TunnelEvent> {
        self.events.drain(..).collect()
    }

    fn emit(&mut self, handle: TunnelHandle, kind: TunnelEventKind) {
        if let Some(tunnel) = self.tunnels.get(&handle) {
            self.events.push_back(TunnelEvent {
                handle,
                peer: tunnel.peer.clone(),
                tunnel_type: tunnel.tunnel_type.clone(),
                kind,
            });
        }
    }

    fn insert(&mut self, id: TunnelId, peer: &NodeId, tunnel_type: &str, policy: Value, status: TunnelStatus) -> TunnelHandle {
        let handle = TunnelHandle(self.next_handle);
        self.next_handle += 1;
        self.tunnels.insert(
            handle,
            Tunnel {
                handle,
                id,
                peer: peer.clone(),
                tunnel_type: tunnel_type.to_string(),
                policy,
                status,
            },
        );
        handle
    }

    /// Return the existing tunnel of this type to `peer`, or create a
    /// PENDING one and start its setup
    pub fn tunnel_new(&mut self, peer: &NodeId, tunnel_type: &str, policy: Value, outbox: &mut Outbox) -> TunnelHandle {
        if let Some(handle) = self.find(peer, tunnel_type) {
            return handle;
        }

        let handle = self.insert(TunnelId::random(), peer, tunnel_type, policy, TunnelStatus::Pending);
        if self.links.contains(peer) {
            self.send_setup(handle, outbox);
        } else {
            debug!(peer = %peer, tunnel = %handle, "Tunnel requested before link, requesting link");
            self.awaiting_link.entry(peer.clone()).or_default().push(handle);
            outbox.request_link(peer);
        }
        handle
    }

    fn send_setup(&mut self, handle: TunnelHandle, outbox: &mut Outbox) {
        let Some(tunnel) = self.tunnels.get(&handle) else {
            return;
        };
        let command = Command::TunnelNew {
            tunnel_type: tunnel.tunnel_type.clone(),
            tunnel_id: tunnel.id,
            policy: tunnel.policy.clone(),
        };
        let msg_uuid = outbox.send(&tunnel.peer, command);
        self.setup_requests.insert(msg_uuid, handle);
    }

    /// A link to `peer` is established
    pub fn link_up(&mut self, peer: &NodeId, outbox: &mut Outbox) {
        self.links.insert(peer.clone());
        for handle in self.awaiting_link.remove(peer).unwrap_or_default() {
            self.send_setup(handle, outbox);
        }
    }

    /// The link to `peer` failed or could not be established; every
    /// tunnel to it goes down
    pub fn link_lost(&mut self, peer: &NodeId) {
        self.links.remove(peer);
        self.awaiting_link.remove(peer);
        let handles: Vec<TunnelHandle> = self
            .tunnels
            .values()
            .filter(|t| &t.peer == peer)
            .map(|t| t.handle)
            .collect();
        if !handles.is_empty() {
            warn!(peer = %peer, tunnels = handles.len(), "Link lost, terminating tunnels");
        }
        for handle in handles {
            self.terminate(handle);
        }
    }

    fn terminate(&mut self, handle: TunnelHandle) {
        self.emit(handle, TunnelEventKind::Down);
        if let Some(mut tunnel) = self.tunnels.remove(&handle) {
            tunnel.status = TunnelStatus::Terminated;
        }
    }

    /// Handle a peer's `TUNNEL_NEW`
    pub fn handle_tunnel_new(
        &mut self,
        request: &Envelope,
        tunnel_type: &str,
        tunnel_id: TunnelId,
        policy: &Value,
        outbox: &mut Outbox,
    ) {
        let peer = &request.from_rt_uuid;
        self.links.insert(peer.clone());

        if !self.accepted_types.contains(tunnel_type) {
            warn!(peer = %peer, tunnel_type, "Rejecting tunnel of unregistered type");
            let data = serde_json::json!({ "tunnel_id": tunnel_id });
            outbox.reply(request, Response::with_data(Status::BadRequest, data));
            return;
        }

        match self.find(peer, tunnel_type) {
            Some(handle) if self.tunnels.get(&handle).map(|t| t.status) == Some(TunnelStatus::Pending) => {
                let ours = self.tunnels.get(&handle).map(|t| t.id).unwrap_or(tunnel_id);
                let final_id = ours.min(tunnel_id);
                debug!(peer = %peer, ours = %ours, theirs = %tunnel_id, final_id = %final_id, "Simultaneous tunnel setup");
                Self::reply_new(request, final_id, outbox);
                if final_id != ours {
                    if let Some(tunnel) = self.tunnels.get_mut(&handle) {
                        tunnel.id = final_id;
                        tunnel.status = TunnelStatus::Working;
                    }
                    self.emit(handle, TunnelEventKind::Up);
                }
            }
            existing => {
                if let Some(old) = existing {
                    info!(peer = %peer, tunnel_type, "Peer replaced a working tunnel");
                    self.terminate(old);
                }
                let handle = self.insert(tunnel_id, peer, tunnel_type, policy.clone(), TunnelStatus::Working);
                Self::reply_new(request, tunnel_id, outbox);
                self.emit(handle, TunnelEventKind::Incoming);
            }
        }
    }

    fn reply_new(request: &Envelope, tunnel_id: TunnelId, outbox: &mut Outbox) {
        let reply = to_value("tunnel new reply", &TunnelNewReply { tunnel_id })
            .map(Response::ok_with)
            .unwrap_or_else(|_| Response::ok());
        outbox.reply(request, reply);
    }

    /// Route a `REPLY` to a pending setup or destroy; false when the reply
    /// belongs to someone else
    pub fn handle_reply(&mut self, msg_uuid: &Uuid, response: &Response) -> bool {
        if let Some(handle) = self.setup_requests.remove(msg_uuid) {
            self.setup_reply(handle, response);
            return true;
        }
        if let Some(handle) = self.destroy_requests.remove(msg_uuid) {
            if !response.is_success() {
                warn!(tunnel = %handle, status = %response.status, "Peer refused tunnel destroy");
            }
            self.terminate(handle);
            return true;
        }
        false
    }

    /// A setup or destroy request got no reply in time. A tunnel still
    /// PENDING goes down; false when the request is not ours.
    pub fn request_timed_out(&mut self, msg_uuid: &Uuid) -> bool {
        if let Some(handle) = self.setup_requests.remove(msg_uuid) {
            if self.tunnels.get(&handle).map(|t| t.status) == Some(TunnelStatus::Pending) {
                warn!(tunnel = %handle, "Tunnel setup unanswered, giving up");
                self.terminate(handle);
            }
            return true;
        }
        if let Some(handle) = self.destroy_requests.remove(msg_uuid) {
            warn!(tunnel = %handle, "Tunnel destroy unanswered, closing locally");
            self.terminate(handle);
            return true;
        }
        false
    }

    fn setup_reply(&mut self, handle: TunnelHandle, response: &Response) {
        let Some(status) = self.tunnels.get(&handle).map(|t| t.status) else {
            debug!(tunnel = %handle, "Setup reply for a removed tunnel");
            return;
        };
        if !response.is_success() {
            warn!(tunnel = %handle, status = %response.status, "Tunnel setup refused");
            self.terminate(handle);
            return;
        }
        let reply_id = response
            .data
            .clone()
            .and_then(|data| from_value::<TunnelNewReply>("tunnel new reply", data).ok())
            .map(|reply| reply.tunnel_id);

        if let Some(tunnel) = self.tunnels.get_mut(&handle) {
            if let Some(id) = reply_id {
                if status == TunnelStatus::Pending {
                    tunnel.id = id;
                } else if tunnel.id != id {
                    warn!(tunnel = %handle, ours = %tunnel.id, theirs = %id, "Setup reply id differs from working tunnel");
                }
            }
            tunnel.status = TunnelStatus::Working;
        }
        if status == TunnelStatus::Pending {
            self.emit(handle, TunnelEventKind::Up);
        }
    }

    /// Handle a peer's `TUNNEL_DESTROY`
    pub fn handle_destroy(&mut self, request: &Envelope, tunnel_id: TunnelId, outbox: &mut Outbox) {
        match self.find_by_id(&request.from_rt_uuid, tunnel_id) {
            Some(handle) => {
                self.terminate(handle);
                outbox.reply(request, Response::ok());
            }
            None => {
                warn!(peer = %request.from_rt_uuid, tunnel = %tunnel_id, "Destroy for unknown tunnel");
                outbox.reply(request, Response::new(Status::NotFound));
            }
        }
    }

    /// Handle `TUNNEL_DATA`
    pub fn handle_data(&mut self, from: &NodeId, tunnel_id: TunnelId, value: Value) {
        match self.find_by_id(from, tunnel_id) {
            Some(handle) => self.emit(handle, TunnelEventKind::Recv(value)),
            None => warn!(peer = %from, tunnel = %tunnel_id, "Data for unknown tunnel"),
        }
    }

    /// Send a payload over a WORKING tunnel
    pub fn send(&self, handle: TunnelHandle, payload: Value, outbox: &mut Outbox) -> Result<()> {
        let tunnel = self
            .tunnels
            .get(&handle)
            .ok_or_else(|| TransportError::tunnel_state(handle, "unknown tunnel"))?;
        if tunnel.status != TunnelStatus::Working {
            return Err(TransportError::tunnel_state(tunnel.id, format!("not working ({:?})", tunnel.status)));
        }
        outbox.send(
            &tunnel.peer,
            Command::TunnelData {
                tunnel_id: tunnel.id,
                value: payload,
            },
        );
        Ok(())
    }

    /// Remove the tunnel locally; informing the peer goes through [`Self::destroy`]
    pub fn close(&mut self, handle: TunnelHandle, local_only: bool) -> Result<()> {
        if !local_only {
            return Err(TransportError::not_implemented(
                "tunnel close",
                "remote close goes through TUNNEL_DESTROY",
            ));
        }
        if let Some(mut tunnel) = self.tunnels.remove(&handle) {
            tunnel.status = TunnelStatus::Terminated;
        }
        Ok(())
    }

    /// Ask the peer to destroy the tunnel; closes locally on reply
    pub fn destroy(&mut self, handle: TunnelHandle, outbox: &mut Outbox) -> Result<()> {
        let tunnel = self
            .tunnels
            .get(&handle)
            .ok_or_else(|| TransportError::tunnel_state(handle, "unknown tunnel"))?;
        if !self.links.contains(&tunnel.peer) {
            return Err(TransportError::connection("unknown runtime", Some(&tunnel.peer)));
        }
        let msg_uuid = outbox.send(&tunnel.peer, Command::TunnelDestroy { tunnel_id: tunnel.id });
        self.destroy_requests.insert(msg_uuid, handle);
        Ok(())
    }

    /// Drop request bookkeeping whose tunnel is gone; returns entries pruned
    pub fn sweep(&mut self) -> usize {
        let before = self.setup_requests.len() + self.destroy_requests.len();
        let tunnels = &self.tunnels;
        self.setup_requests.retain(|_, handle| tunnels.contains_key(handle));
        self.destroy_requests.retain(|_, handle| tunnels.contains_key(handle));
        before - self.setup_requests.len() - self.destroy_requests.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbox::OutboundAction;
    use serde_json::json;

    const TOKEN: &str = "token";

    struct Side {
        id: NodeId,
        manager: TunnelManager,
        outbox: Outbox,
    }

    impl Side {
        fn new(id: &str) -> Self {
            let mut manager = TunnelManager::new();
            manager.accept_type(TOKEN);
            Self {
                id: NodeId::from(id),
                manager,
                outbox: Outbox::new(NodeId::from(id)),
            }
        }

        fn sent(&mut self) -> Vec<Envelope> {
            self.outbox
                .drain()
                .into_iter()
                .filter_map(|action| match action {
                    OutboundAction::Send(env) => Some(env),
                    OutboundAction::RequestLink(_) => None,
                })
                .collect()
        }

        fn deliver(&mut self, env: &Envelope) {
            match &env.command {
                Command::TunnelNew {
                    tunnel_type,
                    tunnel_id,
                    policy,
                } => self
                    .manager
                    .handle_tunnel_new(env, tunnel_type, *tunnel_id, policy, &mut self.outbox),
                Command::Reply { value } => {
                    assert!(self.manager.handle_reply(&env.msg_uuid, value));
                }
                Command::TunnelDestroy { tunnel_id } => {
                    self.manager.handle_destroy(env, *tunnel_id, &mut self.outbox)
                }
                Command::TunnelData { tunnel_id, value } => {
                    self.manager.handle_data(&env.from_rt_uuid, *tunnel_id, value.clone())
                }
                other => panic!("unexpected {}", other.name()),
            }
        }

        fn ups(&mut self) -> usize {
            self.manager
                .drain_events()
                .iter()
                .filter(|e| e.kind == TunnelEventKind::Up)
                .count()
        }
    }

    fn linked_pair() -> (Side, Side) {
        let mut a = Side::new("node-a");
        let mut b = Side::new("node-b");
        a.manager.link_up(&b.id.clone(), &mut a.outbox);
        b.manager.link_up(&a.id.clone(), &mut b.outbox);
        (a, b)
    }

    fn force_id(side: &mut Side, handle: TunnelHandle, id: u64) {
        side.manager.tunnels.get_mut(&handle).unwrap().id = TunnelId::new(id);
    }

    fn start_with_id(side: &mut Side, peer: &NodeId, id: u64) -> (TunnelHandle, Envelope) {
        let handle = side.manager.tunnel_new(peer, TOKEN, json!({}), &mut side.outbox);
        force_id(side, handle, id);
        // Rebuild the request so it carries the forced id
        let mut request = side.sent().pop().unwrap();
        request.command = Command::TunnelNew {
            tunnel_type: TOKEN.into(),
            tunnel_id: TunnelId::new(id),
            policy: json!({}),
        };
        (handle, request)
    }

    #[test]
    fn test_simple_setup_fires_up_once() {
        let (mut a, mut b) = linked_pair();
        let handle = a.manager.tunnel_new(&b.id.clone(), TOKEN, json!({}), &mut a.outbox);
        assert_eq!(a.manager.get(handle).unwrap().status(), TunnelStatus::Pending);

        for env in a.sent() {
            b.deliver(&env);
        }
        let events = b.manager.drain_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, TunnelEventKind::Incoming);

        for env in b.sent() {
            a.deliver(&env);
        }
        assert_eq!(a.ups(), 1);
        assert_eq!(a.manager.get(handle).unwrap().status(), TunnelStatus::Working);
        assert_eq!(
            a.manager.get(handle).unwrap().id(),
            b.manager.get(events[0].handle).unwrap().id()
        );
    }

    #[test_log::test]
    fn test_simultaneous_setup_converges_on_lower_id() {
        let (mut a, mut b) = linked_pair();
        let (ha, req_a) = start_with_id(&mut a, &b.id.clone(), 50);
        let (hb, req_b) = start_with_id(&mut b, &a.id.clone(), 80);

        // Requests cross on the wire
        b.deliver(&req_a);
        a.deliver(&req_b);

        // b adopted 50 and is already working
        assert_eq!(b.manager.get(hb).unwrap().id(), TunnelId::new(50));
        assert_eq!(b.manager.get(hb).unwrap().status(), TunnelStatus::Working);
        assert_eq!(a.manager.get(ha).unwrap().status(), TunnelStatus::Pending);

        // Reply precedes the up handler on the adopting side
        let b_out = b.sent();
        assert!(matches!(b_out[0].command, Command::Reply { .. }));
        let a_out = a.sent();

        for env in &b_out {
            a.deliver(env);
        }
        for env in &a_out {
            b.deliver(env);
        }

        assert_eq!(a.manager.get(ha).unwrap().id(), TunnelId::new(50));
        assert_eq!(a.manager.get(ha).unwrap().status(), TunnelStatus::Working);
        assert_eq!(a.ups(), 1);
        assert_eq!(b.ups(), 1);
        assert_eq!(a.manager.len(), 1);
        assert_eq!(b.manager.len(), 1);

        a.manager.send(ha, json!({"x": 1}), &mut a.outbox).unwrap();
        let data = a.sent().pop().unwrap();
        assert!(matches!(data.command, Command::TunnelData { tunnel_id, .. } if tunnel_id == TunnelId::new(50)));
        b.deliver(&data);
        let events = b.manager.drain_events();
        assert_eq!(events[0].handle, hb);
        assert_eq!(events[0].kind, TunnelEventKind::Recv(json!({"x": 1})));
    }

    #[test]
    fn test_tunnel_new_before_link_requests_link() {
        let mut a = Side::new("node-a");
        let peer = NodeId::from("node-b");
        let handle = a.manager.tunnel_new(&peer, TOKEN, json!({}), &mut a.outbox);
        assert_eq!(a.outbox.drain(), vec![OutboundAction::RequestLink(peer.clone())]);

        a.manager.link_up(&peer, &mut a.outbox);
        let sent = a.sent();
        assert_eq!(sent.len(), 1);
        assert!(matches!(sent[0].command, Command::TunnelNew { .. }));
        assert_eq!(a.manager.find(&peer, TOKEN), Some(handle));
    }

    #[test]
    fn test_unregistered_type_is_rejected() {
        let (mut a, mut b) = linked_pair();
        a.manager.tunnel_new(&b.id.clone(), "control", json!({}), &mut a.outbox);
        for env in a.sent() {
            b.deliver(&env);
        }
        assert!(b.manager.is_empty());
        for env in b.sent() {
            a.deliver(&env);
        }
        let events = a.manager.drain_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, TunnelEventKind::Down);
        assert!(a.manager.is_empty());
    }

    #[test]
    fn test_send_requires_working() {
        let (mut a, b) = linked_pair();
        let handle = a.manager.tunnel_new(&b.id.clone(), TOKEN, json!({}), &mut a.outbox);
        let err = a.manager.send(handle, json!(1), &mut a.outbox).unwrap_err();
        assert_eq!(err.category(), "tunnel_state");
    }

    #[test]
    fn test_close_remote_not_implemented() {
        let (mut a, b) = linked_pair();
        let handle = a.manager.tunnel_new(&b.id.clone(), TOKEN, json!({}), &mut a.outbox);
        assert!(matches!(
            a.manager.close(handle, false),
            Err(TransportError::NotImplemented { .. })
        ));
        a.manager.close(handle, true).unwrap();
        assert!(a.manager.get(handle).is_none());
    }

    #[test]
    fn test_destroy_and_unknown_destroy() {
        let (mut a, mut b) = linked_pair();
        let handle = a.manager.tunnel_new(&b.id.clone(), TOKEN, json!({}), &mut a.outbox);
        for env in a.sent() {
            b.deliver(&env);
        }
        for env in b.sent() {
            a.deliver(&env);
        }
        a.manager.drain_events();
        b.manager.drain_events();

        a.manager.destroy(handle, &mut a.outbox).unwrap();
        for env in a.sent() {
            b.deliver(&env);
        }
        assert!(b.manager.is_empty());
        assert_eq!(b.manager.drain_events()[0].kind, TunnelEventKind::Down);
        for env in b.sent() {
            a.deliver(&env);
        }
        assert!(a.manager.is_empty());

        let bogus = Envelope::new(a.id.clone(), b.id.clone(), Command::TunnelDestroy { tunnel_id: TunnelId::new(9) });
        b.manager.handle_destroy(&bogus, TunnelId::new(9), &mut b.outbox);
        let reply = b.sent().pop().unwrap();
        assert!(matches!(reply.command, Command::Reply { ref value } if *value == Status::NotFound));
    }

    #[test_log::test]
    fn test_link_lost_terminates_all_tunnels_to_peer() {
        let (mut a, b) = linked_pair();
        a.manager.accept_type("control");
        a.manager.tunnel_new(&b.id.clone(), TOKEN, json!({}), &mut a.outbox);
        a.manager.tunnel_new(&b.id.clone(), "control", json!({}), &mut a.outbox);
        a.manager.link_lost(&b.id);
        assert!(a.manager.is_empty());
        let downs = a
            .manager
            .drain_events()
            .into_iter()
            .filter(|e| e.kind == TunnelEventKind::Down)
            .count();
        assert_eq!(downs, 2);
        assert!(!a.manager.is_linked(&b.id));
    }

    #[test]
    fn test_new_request_replaces_working_tunnel() {
        let (mut a, mut b) = linked_pair();
        a.manager.tunnel_new(&b.id.clone(), TOKEN, json!({}), &mut a.outbox);
        let first = a.sent();
        for env in &first {
            b.deliver(env);
        }
        b.manager.drain_events();

        // Peer restarted and asks again with a fresh id
        let again = Envelope::new(
            a.id.clone(),
            b.id.clone(),
            Command::TunnelNew {
                tunnel_type: TOKEN.into(),
                tunnel_id: TunnelId::new(7),
                policy: json!({}),
            },
        );
        b.deliver(&again);
        let kinds: Vec<_> = b.manager.drain_events().into_iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![TunnelEventKind::Down, TunnelEventKind::Incoming]);
        assert_eq!(b.manager.len(), 1);
    }

    #[test]
    fn test_sweep_prunes_orphaned_requests() {
        let (mut a, b) = linked_pair();
        let handle = a.manager.tunnel_new(&b.id.clone(), TOKEN, json!({}), &mut a.outbox);
        a.manager.close(handle, true).unwrap();
        assert_eq!(a.manager.sweep(), 1);
        assert_eq!(a.manager.sweep(), 0);
    }

    #[test]
    fn test_unanswered_setup_takes_tunnel_down() {
        let (mut a, b) = linked_pair();
        let handle = a.manager.tunnel_new(&b.id.clone(), TOKEN, json!({}), &mut a.outbox);
        let requests = a.outbox.take_requests();
        assert_eq!(requests.len(), 1);
        a.sent();

        assert!(a.manager.request_timed_out(&requests[0]));
        let events = a.manager.drain_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].handle, handle);
        assert_eq!(events[0].kind, TunnelEventKind::Down);
        assert!(a.manager.get(handle).is_none());

        // Late reply no longer matches anything
        assert!(!a.manager.handle_reply(&requests[0], &Response::new(Status::Ok)));
        assert!(!a.manager.request_timed_out(&requests[0]));
    }

    #[test]
    fn test_setup_timeout_after_up_is_ignored() {
        let (mut a, mut b) = linked_pair();
        let handle = a.manager.tunnel_new(&b.id.clone(), TOKEN, json!({}), &mut a.outbox);
        let requests = a.outbox.take_requests();
        for env in a.sent() {
            b.deliver(&env);
        }
        // Only the reply leaves b, so the setup stays answered
        let b_out = b.sent();
        assert!(matches!(b_out[0].command, Command::Reply { .. }));
        assert!(b.outbox.take_requests().is_empty());
        for env in &b_out {
            a.deliver(env);
        }
        assert_eq!(a.ups(), 1);

        assert!(!a.manager.request_timed_out(&requests[0]));
        assert_eq!(a.manager.get(handle).unwrap().status(), TunnelStatus::Working);
        assert!(a.manager.drain_events().is_empty());
    }
}
