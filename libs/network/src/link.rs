//! Node-to-node link
//!
//! A link delivers opaque frames reliably and in order between two directly
//! connected nodes. Everything above it (tunnels, token transport, RPC)
//! is carried as framed [`flow_codec::Envelope`]s.
//!
//! ```text
//!  node-a driver                           node-b driver
//!      │ send(node-b, frame)                   ▲
//!      ▼                                       │ LinkEvent::Frame
//!  InMemoryLink ──► InMemoryNetwork ──► mpsc::Sender<LinkEvent>
//! ```

use crate::{Result, TransportError};
use async_trait::async_trait;
use bytes::Bytes;
use flow_types::NodeId;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Notification delivered to a node by its link layer
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// A link to the peer is established
    Up(NodeId),
    /// Frame received from a linked peer
    Frame { from: NodeId, payload: Bytes },
    /// The link to the peer failed or was closed
    Lost(NodeId),
}

/// Link transport used by a node driver
#[async_trait]
pub trait LinkTransport: Send + Sync {
    fn local_id(&self) -> &NodeId;

    /// Send one frame to a linked peer
    async fn send(&self, peer: &NodeId, frame: Bytes) -> Result<()>;

    /// Ask for a link to `peer`; completion is reported as [`LinkEvent::Up`]
    async fn request_link(&self, peer: &NodeId) -> Result<()>;

    fn is_linked(&self, peer: &NodeId) -> bool;

    fn stats(&self) -> LinkStats;
}

/// Lock-free link counters
#[derive(Debug, Default)]
pub struct LinkMetrics {
    frames_sent: AtomicU64,
    bytes_sent: AtomicU64,
    send_errors: AtomicU64,
    links_established: AtomicU64,
}

impl LinkMetrics {
    #[inline]
    pub fn record_send(&self, bytes: usize) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_error(&self) {
        self.send_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_link(&self) {
        self.links_established.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> LinkStats {
        LinkStats {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
            links_established: self.links_established.load(Ordering::Relaxed),
        }
    }
}

/// Link counter snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStats {
    pub frames_sent: u64,
    pub bytes_sent: u64,
    pub send_errors: u64,
    pub links_established: u64,
}

#[derive(Default)]
struct NetworkState {
    nodes: HashMap<NodeId, mpsc::Sender<LinkEvent>>,
    links: HashSet<(NodeId, NodeId)>,
}

fn link_key(a: &NodeId, b: &NodeId) -> (NodeId, NodeId) {
    if a <= b {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}

impl NetworkState {
    fn notify(&self, node: &NodeId, event: LinkEvent) {
        if let Some(inbox) = self.nodes.get(node) {
            if let Err(e) = inbox.try_send(event) {
                warn!(node = %node, error = %e, "Dropping link notification");
            }
        }
    }
}

/// In-process network connecting any number of nodes
///
/// Frames are delivered in order per sender through each node's inbox
/// channel. Used by tests and the loopback demo.
#[derive(Clone, Default)]
pub struct InMemoryNetwork {
    state: Arc<RwLock<NetworkState>>,
}

impl InMemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a node, returning its link handle and inbox
    pub fn attach(&self, node: NodeId, capacity: usize) -> (InMemoryLink, mpsc::Receiver<LinkEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.state.write().nodes.insert(node.clone(), tx);
        debug!(node = %node, "Attached node to in-memory network");
        let link = InMemoryLink {
            node_id: node,
            state: Arc::clone(&self.state),
            metrics: Arc::new(LinkMetrics::default()),
        };
        (link, rx)
    }

    /// Remove a node; every linked peer observes [`LinkEvent::Lost`]
    pub fn detach(&self, node: &NodeId) {
        let mut state = self.state.write();
        state.nodes.remove(node);
        let severed: Vec<(NodeId, NodeId)> = state
            .links
            .iter()
            .filter(|(a, b)| a == node || b == node)
            .cloned()
            .collect();
        for (a, b) in severed {
            state.links.remove(&(a.clone(), b.clone()));
            let peer = if &a == node { b } else { a };
            state.notify(&peer, LinkEvent::Lost(node.clone()));
        }
    }

    /// Break the link between two nodes, notifying both
    pub fn sever(&self, a: &NodeId, b: &NodeId) {
        let mut state = self.state.write();
        if state.links.remove(&link_key(a, b)) {
            state.notify(a, LinkEvent::Lost(b.clone()));
            state.notify(b, LinkEvent::Lost(a.clone()));
        }
    }

    pub fn is_linked(&self, a: &NodeId, b: &NodeId) -> bool {
        self.state.read().links.contains(&link_key(a, b))
    }
}

/// One node's handle onto an [`InMemoryNetwork`]
#[derive(Clone)]
pub struct InMemoryLink {
    node_id: NodeId,
    state: Arc<RwLock<NetworkState>>,
    metrics: Arc<LinkMetrics>,
}

#[async_trait]
impl LinkTransport for InMemoryLink {
    fn local_id(&self) -> &NodeId {
        &self.node_id
    }

    async fn send(&self, peer: &NodeId, frame: Bytes) -> Result<()> {
        let inbox = {
            let state = self.state.read();
            if !state.links.contains(&link_key(&self.node_id, peer)) {
                self.metrics.record_error();
                return Err(TransportError::connection("no link to peer", Some(peer)));
            }
            state.nodes.get(peer).cloned()
        };
        let Some(inbox) = inbox else {
            self.metrics.record_error();
            return Err(TransportError::connection("peer detached", Some(peer)));
        };

        let size = frame.len();
        inbox
            .send(LinkEvent::Frame {
                from: self.node_id.clone(),
                payload: frame,
            })
            .await
            .map_err(|_| {
                self.metrics.record_error();
                TransportError::connection("peer inbox closed", Some(peer))
            })?;
        self.metrics.record_send(size);
        Ok(())
    }

    async fn request_link(&self, peer: &NodeId) -> Result<()> {
        let mut state = self.state.write();
        if !state.nodes.contains_key(peer) {
            return Err(TransportError::connection("unknown runtime", Some(peer)));
        }
        if state.links.insert(link_key(&self.node_id, peer)) {
            self.metrics.record_link();
            debug!(node = %self.node_id, peer = %peer, "Link established");
            state.notify(peer, LinkEvent::Up(self.node_id.clone()));
        }
        state.notify(&self.node_id, LinkEvent::Up(peer.clone()));
        Ok(())
    }

    fn is_linked(&self, peer: &NodeId) -> bool {
        self.state.read().links.contains(&link_key(&self.node_id, peer))
    }

    fn stats(&self) -> LinkStats {
        self.metrics.snapshot()
    }
}
