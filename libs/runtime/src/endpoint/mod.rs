//! Endpoints
//!
//! One endpoint per connected peer, owned by the port. Local endpoints move
//! tokens between two queues of the same node; tunnel endpoints run the
//! sequence-numbered ACK/NACK protocol over the token tunnel.
//!
//! ```text
//!            attach            detach(kind)
//! unattached ──────► attached ──────────────► detached
//!                       │
//!                       └── communicate / recv_token / reply
//! ```
//!
//! Only out-endpoints are monitored by the scheduler; in-endpoints react to
//! incoming tokens.

pub mod local;
pub mod tunnel;

pub use local::{LocalInEndpoint, LocalOutEndpoint};
pub use tunnel::{TokenSender, TunnelInEndpoint, TunnelOutEndpoint};

use crate::queue::{Queue, TokenQueue};
use flow_types::{Disconnect, NodeId, PortId, PortProperties, Token};
use std::time::Instant;
use tracing::debug;

/// What the scheduler should do after an endpoint event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    Idle,
    Now,
    At(Instant),
}

impl Wake {
    /// The earlier of two wake requests
    pub fn merge(self, other: Wake) -> Wake {
        match (self, other) {
            (Wake::Now, _) | (_, Wake::Now) => Wake::Now,
            (Wake::At(a), Wake::At(b)) => Wake::At(a.min(b)),
            (Wake::At(a), Wake::Idle) | (Wake::Idle, Wake::At(a)) => Wake::At(a),
            (Wake::Idle, Wake::Idle) => Wake::Idle,
        }
    }
}

#[derive(Debug)]
pub enum Endpoint {
    LocalIn(LocalInEndpoint),
    LocalOut(LocalOutEndpoint),
    TunnelIn(TunnelInEndpoint),
    TunnelOut(TunnelOutEndpoint),
}

impl Endpoint {
    pub fn port_id(&self) -> &PortId {
        match self {
            Endpoint::LocalIn(e) => &e.port_id,
            Endpoint::LocalOut(e) => &e.port_id,
            Endpoint::TunnelIn(e) => &e.port_id,
            Endpoint::TunnelOut(e) => &e.port_id,
        }
    }

    pub fn peer_port_id(&self) -> &PortId {
        match self {
            Endpoint::LocalIn(e) => &e.peer_port_id,
            Endpoint::LocalOut(e) => &e.peer_port_id,
            Endpoint::TunnelIn(e) => &e.peer_port_id,
            Endpoint::TunnelOut(e) => &e.peer_port_id,
        }
    }

    /// Node of the peer port; the local node for local endpoints
    pub fn peer_node(&self) -> &NodeId {
        match self {
            Endpoint::LocalIn(e) => &e.node,
            Endpoint::LocalOut(e) => &e.node,
            Endpoint::TunnelIn(e) => &e.peer_node,
            Endpoint::TunnelOut(e) => &e.peer_node,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Endpoint::LocalIn(_) => "local-in",
            Endpoint::LocalOut(_) => "local-out",
            Endpoint::TunnelIn(_) => "tunnel-in",
            Endpoint::TunnelOut(_) => "tunnel-out",
        }
    }

    pub fn is_tunnel(&self) -> bool {
        matches!(self, Endpoint::TunnelIn(_) | Endpoint::TunnelOut(_))
    }

    /// Needs the scheduler's communicate phase
    pub fn use_monitor(&self) -> bool {
        matches!(self, Endpoint::LocalOut(_) | Endpoint::TunnelOut(_))
    }

    /// Register the peer with the owning port's queue
    pub fn attach(&self, queue: &mut Queue, peer_properties: &PortProperties) {
        match self {
            Endpoint::LocalIn(_) | Endpoint::TunnelIn(_) => queue.add_writer(self.peer_port_id(), peer_properties),
            Endpoint::LocalOut(_) | Endpoint::TunnelOut(_) => queue.add_reader(self.peer_port_id(), peer_properties),
        }
        debug!(port_id = %self.port_id(), peer = %self.peer_port_id(), kind = self.kind_name(), "Endpoint attached");
    }

    /// Unregister the peer. `kind` is already resolved for this port's
    /// direction. Temporary only rolls back in-flight reads.
    pub fn detach(&self, queue: &mut Queue, kind: Disconnect) -> Vec<(u64, Token)> {
        if kind == Disconnect::Temporary {
            if self.use_monitor() {
                // Nothing to roll back when the peer has no pending reads
                let _ = queue.cancel(Some(self.peer_port_id()));
            }
            return Vec::new();
        }
        queue.exhaust(self.peer_port_id(), kind)
    }

    /// Re-key a tunnel endpoint whose peer id became known late
    pub fn set_peer_port_id(&mut self, queue: &mut Queue, peer_port_id: PortId, peer_properties: &PortProperties) {
        let old = self.peer_port_id().clone();
        if old == peer_port_id {
            return;
        }
        match self {
            Endpoint::LocalIn(_) | Endpoint::TunnelIn(_) => {
                queue.remove_writer(&old);
            }
            Endpoint::LocalOut(_) | Endpoint::TunnelOut(_) => {
                queue.remove_reader(&old);
            }
        }
        match self {
            Endpoint::LocalIn(e) => e.peer_port_id = peer_port_id,
            Endpoint::LocalOut(e) => e.peer_port_id = peer_port_id,
            Endpoint::TunnelIn(e) => e.peer_port_id = peer_port_id,
            Endpoint::TunnelOut(e) => e.peer_port_id = peer_port_id,
        }
        self.attach(queue, peer_properties);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn test_wake_merge_prefers_earliest() {
        let now = Instant::now();
        let later = now + Duration::from_millis(50);
        assert_eq!(Wake::Idle.merge(Wake::At(later)), Wake::At(later));
        assert_eq!(Wake::At(later).merge(Wake::At(now)), Wake::At(now));
        assert_eq!(Wake::At(now).merge(Wake::Now), Wake::Now);
        assert_eq!(Wake::Idle.merge(Wake::Idle), Wake::Idle);
    }

    #[test]
    fn test_set_peer_port_id_rekeys_queue() {
        let mut queue = Queue::new(&PortProperties::outport(), 4);
        let mut endpoint = Endpoint::LocalOut(LocalOutEndpoint::new(
            PortId::from("out"),
            PortId::from("pending"),
            NodeId::from("node-a"),
        ));
        endpoint.attach(&mut queue, &PortProperties::inport());
        endpoint.set_peer_port_id(&mut queue, PortId::from("in"), &PortProperties::inport());

        assert_eq!(queue.peers(), vec![PortId::from("in")]);
        queue.write(Token::new(json!(1)), None).unwrap();
        assert!(queue.tokens_available(1, Some(&PortId::from("in"))));
    }
}
