//! Same-node endpoints
//!
//! Both ports live in the node's [`PortTable`], so a transfer is a
//! `com_peek` on the out-queue, a write into the in-queue and a
//! `com_commit`, all within one scheduler pass.

use crate::error::QueueError;
use crate::metrics::EndpointMetrics;
use crate::port::PortTable;
use crate::queue::{ComResult, Queue, TokenQueue};
use flow_types::{NodeId, PortId};
use tracing::{debug, trace, warn};

#[derive(Debug, Clone)]
pub struct LocalInEndpoint {
    pub(crate) port_id: PortId,
    pub(crate) peer_port_id: PortId,
    pub(crate) node: NodeId,
}

impl LocalInEndpoint {
    pub fn new(port_id: PortId, peer_port_id: PortId, node: NodeId) -> Self {
        Self {
            port_id,
            peer_port_id,
            node,
        }
    }

    /// Reconcile after a reconnect: `received` is how many tokens this
    /// in-queue already took from the peer. While the peer out-queue still
    /// offers tokens it believes unread, drop them on its side.
    pub fn fix_mismatch(&self, received: u64, peer_queue: &mut Queue) -> usize {
        let mut discarded = 0;
        while peer_queue.tokens_available(1, Some(&self.port_id)) {
            let committed = peer_queue.reader_position(&self.port_id).unwrap_or(0);
            if received <= committed || !peer_queue.discard_one(&self.port_id) {
                break;
            }
            discarded += 1;
        }
        if discarded > 0 {
            debug!(port_id = %self.port_id, peer = %self.peer_port_id, discarded, "Dropped already delivered tokens");
        }
        discarded
    }
}

#[derive(Debug, Clone)]
pub struct LocalOutEndpoint {
    pub(crate) port_id: PortId,
    pub(crate) peer_port_id: PortId,
    pub(crate) node: NodeId,
}

impl LocalOutEndpoint {
    pub fn new(port_id: PortId, peer_port_id: PortId, node: NodeId) -> Self {
        Self {
            port_id,
            peer_port_id,
            node,
        }
    }

    /// Move every token the peer has room for. True on progress.
    pub fn communicate(&self, ports: &mut PortTable, metrics: &EndpointMetrics) -> bool {
        let mut progress = false;
        loop {
            let Some(own) = ports.get_mut(&self.port_id) else {
                return progress;
            };
            let queue = own.queue_mut();
            if !queue.tokens_available(1, Some(&self.peer_port_id)) {
                return progress;
            }
            let (seq, token) = match queue.com_peek(&self.peer_port_id) {
                Ok(peeked) => peeked,
                Err(QueueError::Empty { .. }) => return progress,
                Err(e) => {
                    warn!(port_id = %self.port_id, error = %e, "Local peek failed");
                    return progress;
                }
            };

            let written = match ports.get_mut(&self.peer_port_id) {
                Some(peer) => peer.queue_mut().write(token, Some(&self.port_id)),
                None => Err(QueueError::unknown_peer(&self.peer_port_id, "local")),
            };

            let Some(own) = ports.get_mut(&self.port_id) else {
                return progress;
            };
            let queue = own.queue_mut();
            match written {
                Ok(()) => {
                    if queue.com_commit(&self.peer_port_id, seq) != Ok(ComResult::Handled) {
                        warn!(port_id = %self.port_id, seq, "Local commit out of order");
                    }
                    metrics.record_local_transfer();
                    trace!(port_id = %self.port_id, peer = %self.peer_port_id, seq, "Local transfer");
                    progress = true;
                }
                Err(e) => {
                    if !e.is_backpressure() {
                        warn!(port_id = %self.port_id, peer = %self.peer_port_id, error = %e, "Local write failed");
                    }
                    let _ = queue.com_cancel(&self.peer_port_id, seq);
                    return progress;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::Port;
    use flow_types::{ActorId, PortProperties, Token};
    use serde_json::json;

    fn wire(ports: &mut PortTable, in_length: usize) -> LocalOutEndpoint {
        let node = NodeId::from("node-a");
        let out = Port::with_id(PortId::from("out"), "out", ActorId::from("src"), PortProperties::outport(), 4);
        let inp = Port::with_id(
            PortId::from("in"),
            "in",
            ActorId::from("sink"),
            PortProperties::inport().with_queue_length(in_length),
            4,
        );
        ports.insert(out.id().clone(), out);
        ports.insert(inp.id().clone(), inp);

        let out_ep = LocalOutEndpoint::new(PortId::from("out"), PortId::from("in"), node.clone());
        let in_ep = LocalInEndpoint::new(PortId::from("in"), PortId::from("out"), node.clone());
        let out_port = ports.get_mut(&PortId::from("out")).unwrap();
        out_port.attach_endpoint(crate::endpoint::Endpoint::LocalOut(out_ep.clone()), &PortProperties::inport());
        let in_port = ports.get_mut(&PortId::from("in")).unwrap();
        in_port.attach_endpoint(crate::endpoint::Endpoint::LocalIn(in_ep), &PortProperties::outport());
        out_ep
    }

    #[test]
    fn test_communicate_moves_until_peer_full() {
        let mut ports = PortTable::new();
        let endpoint = wire(&mut ports, 2);
        let metrics = EndpointMetrics::default();
        for i in 0..4 {
            ports.get_mut(&PortId::from("out")).unwrap().write_token(Token::new(json!(i))).unwrap();
        }

        assert!(endpoint.communicate(&mut ports, &metrics));
        assert_eq!(metrics.snapshot().local_transfers, 2);

        let out = ports.get(&PortId::from("out")).unwrap();
        assert!(out.queue().com_is_committed(&PortId::from("in")));
        assert!(out.queue().tokens_available(2, Some(&PortId::from("in"))));

        let sink = ports.get_mut(&PortId::from("in")).unwrap();
        assert_eq!(sink.peek_token().unwrap().value(), &json!(0));
        sink.commit().unwrap();

        assert!(endpoint.communicate(&mut ports, &metrics));
        assert!(!endpoint.communicate(&mut ports, &metrics));
    }

    #[test]
    fn test_fix_mismatch_drops_delivered_tokens() {
        let mut ports = PortTable::new();
        wire(&mut ports, 4);
        let out = ports.get_mut(&PortId::from("out")).unwrap();
        for i in 0..3 {
            out.write_token(Token::new(json!(i))).unwrap();
        }
        let in_ep = LocalInEndpoint::new(PortId::from("in"), PortId::from("out"), NodeId::from("node-a"));
        let dropped = in_ep.fix_mismatch(2, out.queue_mut());
        assert_eq!(dropped, 2);
        assert_eq!(out.queue().reader_position(&PortId::from("in")), Some(2));
        assert!(out.queue().tokens_available(1, Some(&PortId::from("in"))));
    }
}
