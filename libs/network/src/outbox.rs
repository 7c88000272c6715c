//! Outgoing action buffer
//!
//! Protocol state machines in this crate never touch the link directly.
//! They push actions here and the node driver drains and executes them.

use flow_codec::{Command, Envelope};
use flow_types::{NodeId, Response};
use uuid::Uuid;

/// Something the driver must do on the link
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundAction {
    /// Deliver an envelope to `envelope.to_rt_uuid`
    Send(Envelope),
    /// Establish a link to the peer; the driver reports back with link up or lost
    RequestLink(NodeId),
}

/// Per-node queue of outbound actions
#[derive(Debug)]
pub struct Outbox {
    node_id: NodeId,
    actions: Vec<OutboundAction>,
    requests: Vec<Uuid>,
}

impl Outbox {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            actions: Vec::new(),
            requests: Vec::new(),
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Queue a request to `to`; returns the msg_uuid a reply will echo
    pub fn send(&mut self, to: &NodeId, command: Command) -> Uuid {
        let expects_reply = !matches!(command, Command::TunnelData { .. } | Command::Reply { .. });
        let envelope = Envelope::new(self.node_id.clone(), to.clone(), command);
        let msg_uuid = envelope.msg_uuid;
        self.actions.push(OutboundAction::Send(envelope));
        if expects_reply {
            self.requests.push(msg_uuid);
        }
        msg_uuid
    }

    /// Requests queued since the last call that are owed a `REPLY`
    pub fn take_requests(&mut self) -> Vec<Uuid> {
        std::mem::take(&mut self.requests)
    }

    /// Queue the reply to a received request
    pub fn reply(&mut self, request: &Envelope, value: Response) {
        self.actions.push(OutboundAction::Send(request.reply(value)));
    }

    pub fn request_link(&mut self, peer: &NodeId) {
        let action = OutboundAction::RequestLink(peer.clone());
        if !self.actions.contains(&action) {
            self.actions.push(action);
        }
    }

    pub fn drain(&mut self) -> Vec<OutboundAction> {
        std::mem::take(&mut self.actions)
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flow_types::TunnelId;

    #[test]
    fn test_send_and_reply_addressing() {
        let mut outbox = Outbox::new(NodeId::from("node-a"));
        let msg_uuid = outbox.send(
            &NodeId::from("node-b"),
            Command::TunnelDestroy {
                tunnel_id: TunnelId::new(3),
            },
        );

        let actions = outbox.drain();
        assert!(outbox.is_empty());
        let OutboundAction::Send(request) = &actions[0] else {
            panic!("expected send");
        };
        assert_eq!(request.msg_uuid, msg_uuid);
        assert_eq!(request.to_rt_uuid, NodeId::from("node-b"));

        let mut peer_outbox = Outbox::new(NodeId::from("node-b"));
        peer_outbox.reply(request, Response::ok());
        let OutboundAction::Send(reply) = &peer_outbox.drain()[0] else {
            panic!("expected send");
        };
        assert_eq!(reply.msg_uuid, msg_uuid);
        assert_eq!(reply.to_rt_uuid, NodeId::from("node-a"));
    }

    #[test]
    fn test_link_requests_are_deduplicated() {
        let mut outbox = Outbox::new(NodeId::from("node-a"));
        outbox.request_link(&NodeId::from("node-b"));
        outbox.request_link(&NodeId::from("node-b"));
        assert_eq!(outbox.len(), 1);
    }

    #[test]
    fn test_only_requests_are_owed_replies() {
        let mut outbox = Outbox::new(NodeId::from("node-a"));
        let peer = NodeId::from("node-b");
        let destroy = outbox.send(&peer, Command::TunnelDestroy { tunnel_id: TunnelId::new(3) });
        outbox.send(
            &peer,
            Command::TunnelData {
                tunnel_id: TunnelId::new(3),
                value: serde_json::json!({"cmd": "TOKEN"}),
            },
        );

        assert_eq!(outbox.take_requests(), vec![destroy]);
        assert!(outbox.take_requests().is_empty());
        assert_eq!(outbox.len(), 2);
    }
}
