//! Token tunnel façade
//!
//! One tunnel of type `"token"` per peer node carries every port-to-port
//! stream between the two nodes. `TOKEN` messages are routed to the
//! receiving in-port's endpoint, `TOKEN_REPLY` to the sending out-port's
//! endpoint, both by `(port_id, peer_port_id)`.
//!
//! Work that needs a tunnel still PENDING is parked here and handed back
//! once, when the tunnel goes up or down.

use crate::endpoint::TokenSender;
use flow_codec::TokenMessage;
use flow_config::defaults::tunnel::TOKEN_TUNNEL_TYPE;
use flow_network::{Outbox, TransportError, TunnelHandle, TunnelManager, TunnelStatus};
use flow_types::{NodeId, TunnelId};
use serde_json::json;
use std::collections::HashMap;
use tracing::{debug, info};

#[derive(Debug)]
pub struct TokenTunnel<C> {
    tunnels: HashMap<NodeId, TunnelHandle>,
    pending: HashMap<NodeId, Vec<C>>,
}

impl<C> Default for TokenTunnel<C> {
    fn default() -> Self {
        Self {
            tunnels: HashMap::new(),
            pending: HashMap::new(),
        }
    }
}

impl<C> TokenTunnel<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept peer-initiated token tunnels
    pub fn register(manager: &mut TunnelManager) {
        manager.accept_type(TOKEN_TUNNEL_TYPE);
    }

    pub fn is_token_tunnel(tunnel_type: &str) -> bool {
        tunnel_type == TOKEN_TUNNEL_TYPE
    }

    pub fn handle(&self, peer: &NodeId) -> Option<TunnelHandle> {
        self.tunnels.get(peer).copied()
    }

    /// Status and id of the live token tunnel to `peer`
    pub fn status(&self, peer: &NodeId, manager: &TunnelManager) -> Option<(TunnelStatus, TunnelId)> {
        self.handle(peer)
            .and_then(|h| manager.get(h))
            .map(|t| (t.status(), t.id()))
    }

    /// Existing token tunnel to `peer`, or a new PENDING one
    pub fn ensure(&mut self, peer: &NodeId, manager: &mut TunnelManager, outbox: &mut Outbox) -> TunnelHandle {
        if let Some(handle) = self.handle(peer).filter(|h| manager.get(*h).is_some()) {
            return handle;
        }
        let handle = manager.tunnel_new(peer, TOKEN_TUNNEL_TYPE, json!({}), outbox);
        debug!(peer = %peer, tunnel = %handle, "Token tunnel requested");
        self.tunnels.insert(peer.clone(), handle);
        handle
    }

    /// Park work until the tunnel to `peer` resolves
    pub fn defer(&mut self, peer: &NodeId, continuation: C) {
        self.pending.entry(peer.clone()).or_default().push(continuation);
    }

    pub fn pending_len(&self, peer: &NodeId) -> usize {
        self.pending.get(peer).map_or(0, Vec::len)
    }

    /// A peer opened the token tunnel; it replaces ours
    pub fn incoming(&mut self, peer: &NodeId, handle: TunnelHandle) -> Vec<C> {
        info!(peer = %peer, tunnel = %handle, "Token tunnel opened by peer");
        self.tunnels.insert(peer.clone(), handle);
        self.pending.remove(peer).unwrap_or_default()
    }

    /// The tunnel went WORKING; parked work resumes
    pub fn up(&mut self, peer: &NodeId, handle: TunnelHandle) -> Vec<C> {
        info!(peer = %peer, tunnel = %handle, "Token tunnel up");
        self.tunnels.insert(peer.clone(), handle);
        self.pending.remove(peer).unwrap_or_default()
    }

    /// The tunnel went down. Returns None for a stale handle, otherwise
    /// the parked work, which must now fail.
    pub fn down(&mut self, peer: &NodeId, handle: TunnelHandle) -> Option<Vec<C>> {
        if self.tunnels.get(peer) != Some(&handle) {
            debug!(peer = %peer, tunnel = %handle, "Replaced token tunnel went down");
            return None;
        }
        info!(peer = %peer, tunnel = %handle, "Token tunnel down");
        self.tunnels.remove(peer);
        Some(self.pending.remove(peer).unwrap_or_default())
    }

    /// Sender view over the tunnel manager and outbox
    pub fn sender<'a>(&'a mut self, manager: &'a mut TunnelManager, outbox: &'a mut Outbox) -> TunnelSender<'a, C> {
        TunnelSender {
            token_tunnel: self,
            manager,
            outbox,
        }
    }
}

pub struct TunnelSender<'a, C> {
    token_tunnel: &'a mut TokenTunnel<C>,
    manager: &'a mut TunnelManager,
    outbox: &'a mut Outbox,
}

impl<C> TokenSender for TunnelSender<'_, C> {
    fn send_token(&mut self, peer: &NodeId, message: TokenMessage) -> Result<(), TransportError> {
        let Some(handle) = self
            .token_tunnel
            .handle(peer)
            .filter(|h| self.manager.get(*h).is_some())
        else {
            // Re-open so the endpoint can resend once the tunnel is up
            self.token_tunnel.ensure(peer, self.manager, self.outbox);
            return Err(TransportError::connection("no token tunnel", Some(peer)));
        };
        let payload = message
            .to_value()
            .map_err(|e| TransportError::protocol(format!("token message: {}", e)))?;
        self.manager.send(handle, payload, self.outbox)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flow_codec::{Command, Envelope};
    use flow_network::OutboundAction;
    use flow_types::{PortId, Response, Token};

    fn setup() -> (TokenTunnel<u32>, TunnelManager, Outbox, NodeId) {
        let mut manager = TunnelManager::new();
        TokenTunnel::<u32>::register(&mut manager);
        (TokenTunnel::new(), manager, Outbox::new(NodeId::from("node-a")), NodeId::from("node-b"))
    }

    fn message() -> TokenMessage {
        TokenMessage::Token {
            port_id: PortId::from("out"),
            peer_port_id: PortId::from("in"),
            sequencenbr: 0,
            token: Token::new(serde_json::json!(1)),
        }
    }

    #[test]
    fn test_parked_work_released_on_up() {
        let (mut tt, mut manager, mut outbox, peer) = setup();
        manager.link_up(&peer, &mut outbox);
        let handle = tt.ensure(&peer, &mut manager, &mut outbox);
        assert_eq!(tt.ensure(&peer, &mut manager, &mut outbox), handle);
        tt.defer(&peer, 7);
        assert_eq!(tt.pending_len(&peer), 1);

        let setup_uuid = outbox
            .drain()
            .into_iter()
            .find_map(|a| match a {
                OutboundAction::Send(Envelope {
                    msg_uuid,
                    command: Command::TunnelNew { .. },
                    ..
                }) => Some(msg_uuid),
                _ => None,
            })
            .unwrap();
        assert!(manager.handle_reply(&setup_uuid, &Response::ok()));
        assert_eq!(tt.status(&peer, &manager).map(|s| s.0), Some(TunnelStatus::Working));
        assert_eq!(tt.up(&peer, handle), vec![7]);
        assert_eq!(tt.pending_len(&peer), 0);
    }

    #[test]
    fn test_stale_down_is_ignored() {
        let (mut tt, mut manager, mut outbox, peer) = setup();
        let handle = tt.ensure(&peer, &mut manager, &mut outbox);
        tt.defer(&peer, 1);
        let other = manager.tunnel_new(&NodeId::from("node-c"), "token", json!({}), &mut outbox);
        assert!(tt.down(&peer, other).is_none());
        assert_eq!(tt.down(&peer, handle), Some(vec![1]));
        assert!(tt.handle(&peer).is_none());
    }

    #[test]
    fn test_send_without_tunnel_reopens() {
        let (mut tt, mut manager, mut outbox, peer) = setup();
        let err = tt.sender(&mut manager, &mut outbox).send_token(&peer, message());
        assert!(err.is_err());
        assert!(tt.handle(&peer).is_some());
        assert!(outbox
            .drain()
            .iter()
            .any(|a| matches!(a, OutboundAction::RequestLink(p) if p == &peer)));
    }
}
