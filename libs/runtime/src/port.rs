//! Ports
//!
//! A port is a named, directional attachment point on an actor. It owns one
//! [`Queue`] and one [`Endpoint`] per connected peer:
//!
//! ```text
//!   actor ──write──► OutPort ─┬─ LocalOut  ─────────► peer InPort (same node)
//!                    (queue)  └─ TunnelOut ─ TOKEN ─► peer InPort (remote)
//!
//!   actor ◄──peek─── InPort  ◄─ LocalIn / TunnelIn
//!                    (queue)
//! ```
//!
//! In-ports register their own id as the single reader of their queue, so
//! the actor side always reads with `Some(own id)`.

use crate::endpoint::Endpoint;
use crate::error::QueueError;
use crate::queue::{PeerRemap, Queue, QueueConfig, TokenQueue};
use flow_codec::ExhaustedTokens;
use flow_types::{ActorId, Direction, Disconnect, NodeId, PortId, PortProperties, Token};
use serde_json::{json, Value};
use std::collections::HashMap;
use tracing::{debug, warn};

/// All ports of one node, by id
pub type PortTable = HashMap<PortId, Port>;

#[derive(Debug)]
pub struct Port {
    id: PortId,
    name: String,
    owner: ActorId,
    properties: PortProperties,
    queue: Queue,
    endpoints: Vec<Endpoint>,
    default_length: usize,
}

impl Port {
    pub fn new(name: impl Into<String>, owner: ActorId, properties: PortProperties, default_length: usize) -> Self {
        Self::with_id(PortId::generate(), name, owner, properties, default_length)
    }

    pub fn with_id(
        id: PortId,
        name: impl Into<String>,
        owner: ActorId,
        properties: PortProperties,
        default_length: usize,
    ) -> Self {
        let mut queue = Queue::new(&properties, default_length);
        if properties.direction == Direction::In {
            queue.add_reader(&id, &properties);
        }
        Self {
            id,
            name: name.into(),
            owner,
            properties,
            queue,
            endpoints: Vec::new(),
            default_length,
        }
    }

    pub fn id(&self) -> &PortId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn owner(&self) -> &ActorId {
        &self.owner
    }

    pub fn set_owner(&mut self, owner: ActorId) {
        self.owner = owner;
    }

    pub fn properties(&self) -> &PortProperties {
        &self.properties
    }

    pub fn direction(&self) -> Direction {
        self.properties.direction
    }

    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    pub fn queue_mut(&mut self) -> &mut Queue {
        &mut self.queue
    }

    /// Install a replacement queue. A queue of the same discipline is kept
    /// together with its tokens; its peer count grows as peers attach.
    /// Returns false when the existing queue was kept.
    pub fn set_queue(&mut self, queue: Queue) -> bool {
        if queue.queuetype() == self.queue.queuetype() {
            return false;
        }
        if self.queue.tokens_available(1, self.reader_key()) {
            warn!(
                port_id = %self.id,
                from = self.queue.queuetype(),
                to = queue.queuetype(),
                "Replacing queue drops buffered tokens"
            );
        }
        self.queue = queue;
        if self.direction() == Direction::In {
            let id = self.id.clone();
            self.queue.add_reader(&id, &self.properties);
        }
        true
    }

    /// Update properties and rebuild the queue if the discipline changed
    pub fn set_properties(&mut self, properties: PortProperties) -> bool {
        self.properties = properties;
        let queue = Queue::new(&self.properties, self.default_length);
        self.set_queue(queue)
    }

    pub fn set_config(&mut self, config: &QueueConfig) -> Result<(), QueueError> {
        self.queue.set_config(config)
    }

    /// Fold tokens salvaged from a departed peer into the queue
    pub fn exhausted_tokens(&mut self, tokens: &ExhaustedTokens) -> usize {
        if tokens.is_empty() {
            return 0;
        }
        let peers = self.queue.set_exhausted_tokens(tokens);
        debug!(port_id = %self.id, peers, "Folded exhausted tokens");
        peers
    }

    fn reader_key(&self) -> Option<&PortId> {
        match self.direction() {
            Direction::In => Some(&self.id),
            Direction::Out => None,
        }
    }

    // -- endpoints --

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    pub fn endpoint(&self, peer: &PortId) -> Option<&Endpoint> {
        self.endpoints.iter().find(|e| e.peer_port_id() == peer)
    }

    pub fn endpoint_mut(&mut self, peer: &PortId) -> Option<&mut Endpoint> {
        self.endpoints.iter_mut().find(|e| e.peer_port_id() == peer)
    }

    /// Split borrow for endpoint operations that also touch the queue
    pub fn endpoint_and_queue(&mut self, peer: &PortId) -> Option<(&mut Endpoint, &mut Queue)> {
        let Port { queue, endpoints, .. } = self;
        endpoints
            .iter_mut()
            .find(|e| e.peer_port_id() == peer)
            .map(|endpoint| (endpoint, queue))
    }

    /// Attach an endpoint, replacing any endpoint to the same peer.
    /// Returns the replaced one.
    pub fn attach_endpoint(&mut self, endpoint: Endpoint, peer_properties: &PortProperties) -> Option<Endpoint> {
        let replaced = self
            .endpoints
            .iter()
            .position(|e| e.peer_port_id() == endpoint.peer_port_id())
            .map(|i| self.endpoints.remove(i));
        if let Some(old) = &replaced {
            debug!(port_id = %self.id, peer = %old.peer_port_id(), kind = old.kind_name(), "Replacing endpoint");
        }
        endpoint.attach(&mut self.queue, peer_properties);
        self.endpoints.push(endpoint);
        replaced
    }

    /// Detach the endpoints to `peers`, applying `terminate` as seen from
    /// this port's direction. Peers the queue still knows but that have no
    /// endpoint are dropped from the queue the same way.
    ///
    /// Salvaged tokens are keyed by this port's id.
    pub fn detach(&mut self, peers: &[PortId], terminate: Disconnect) -> (Vec<Endpoint>, ExhaustedTokens) {
        let kind = terminate.for_direction(self.direction());
        let mut detached = Vec::new();
        let mut remaining = Vec::new();

        for peer in peers {
            match self.endpoints.iter().position(|e| e.peer_port_id() == peer) {
                Some(i) => {
                    let endpoint = self.endpoints.remove(i);
                    remaining.extend(endpoint.detach(&mut self.queue, kind));
                    detached.push(endpoint);
                }
                None if kind != Disconnect::Temporary => {
                    remaining.extend(self.queue.exhaust(peer, kind));
                }
                None => {}
            }
        }

        let mut tokens = ExhaustedTokens::new();
        if !remaining.is_empty() || kind.hands_over_tokens() {
            tokens.insert(self.id.clone(), remaining);
        }
        debug!(port_id = %self.id, peers = peers.len(), ?kind, "Detached peers");
        (detached, tokens)
    }

    /// Every expected peer has an endpoint
    pub fn is_connected(&self) -> bool {
        !self.endpoints.is_empty() && self.endpoints.len() >= self.properties.nbr_peers
    }

    pub fn is_connected_to(&self, peer: &PortId) -> bool {
        self.endpoint(peer).is_some()
    }

    /// Peers with their node; peers the queue knows without an endpoint
    /// are reported with no node
    pub fn peers(&self) -> Vec<(Option<NodeId>, PortId)> {
        let mut peers: Vec<(Option<NodeId>, PortId)> = self
            .endpoints
            .iter()
            .map(|e| (Some(e.peer_node().clone()), e.peer_port_id().clone()))
            .collect();
        let known = match self.direction() {
            Direction::Out => self.queue.peers(),
            Direction::In => self.queue.writers(),
        };
        for id in known {
            if id != self.id && !peers.iter().any(|(_, p)| p == &id) {
                peers.push((None, id));
            }
        }
        peers
    }

    // -- actor side --

    pub fn tokens_available(&self, n: usize) -> bool {
        self.queue.tokens_available(n, self.reader_key())
    }

    pub fn slots_available(&self, n: usize) -> bool {
        self.queue.slots_available(n, None)
    }

    pub fn write_token(&mut self, token: Token) -> Result<(), QueueError> {
        self.queue.write(token, None)
    }

    pub fn peek_token(&mut self) -> Result<Token, QueueError> {
        let key = self.reader_key().cloned();
        self.queue.peek(key.as_ref())
    }

    /// Commit tentative reads; true when an exhausted writer was dropped
    pub fn commit(&mut self) -> Result<bool, QueueError> {
        let key = self.reader_key().cloned();
        let dropped = self.queue.commit(key.as_ref())?;
        if dropped {
            debug!(port_id = %self.id, "Exhausted writer drained and removed");
        }
        Ok(dropped)
    }

    pub fn cancel(&mut self) -> Result<(), QueueError> {
        let key = self.reader_key().cloned();
        self.queue.cancel(key.as_ref())
    }

    /// Serialized port, optionally with peer ids remapped for a move
    pub fn state(&self, remap: Option<&PeerRemap>) -> Result<Value, QueueError> {
        Ok(json!({
            "id": self.id,
            "name": self.name,
            "properties": self.properties,
            "queue": self.queue.state(remap)?,
        }))
    }

    /// Restore the queue from a serialized port
    pub fn set_state(&mut self, state: Value) -> Result<(), QueueError> {
        let queue_state = state
            .get("queue")
            .cloned()
            .ok_or_else(|| QueueError::invalid_state("port state has no queue"))?;
        self.queue = Queue::from_state(queue_state)?;
        Ok(())
    }
}
