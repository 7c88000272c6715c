//! Connections over the token tunnel
//!
//! The requesting side owns the retry logic: GONE means the tunnel id it
//! sent is stale and the request is resent on the current tunnel;
//! NOT_FOUND, BAD_REQUEST and GATEWAY_TIMEOUT mean the peer port may have
//! moved and the connect starts over from the directory.

use crate::connection::{PendingReply, TunnelConnect};
use crate::endpoint::{Endpoint, TunnelInEndpoint, TunnelOutEndpoint};
use crate::node::Node;
use flow_codec::{from_value, to_value, Command, PortConnect, PortConnectReply};
use flow_network::TunnelStatus;
use flow_types::{Direction, NodeId, PortId, PortProperties, Response, Status};
use std::time::Instant;
use tracing::{debug, info, warn};

impl Node {
    pub(crate) fn connect_tunneled(&mut self, conn: TunnelConnect, now: Instant) {
        let peer_node = conn.peer_node.clone();
        let handle = self.token_tunnel.ensure(&peer_node, &mut self.tunnels, &mut self.outbox);
        match self.tunnels.get(handle).map(|t| t.status()) {
            Some(TunnelStatus::Working) => self.send_port_connect(conn, now),
            Some(TunnelStatus::Pending) => {
                debug!(port_id = %conn.port_id, peer_node = %peer_node, "Connect waits for token tunnel");
                self.token_tunnel.defer(&peer_node, conn);
            }
            _ => {
                warn!(port_id = %conn.port_id, peer_node = %peer_node, "Token tunnel terminated");
                conn.completion.fail(Status::InternalError);
            }
        }
    }

    pub(crate) fn send_port_connect(&mut self, conn: TunnelConnect, now: Instant) {
        let Some(port) = self.ports.get(&conn.port_id) else {
            conn.completion.fail(Status::NotFound);
            return;
        };
        if let Some(peer_id) = &conn.peer.port_id {
            if port.is_connected_to(peer_id) {
                debug!(port_id = %conn.port_id, peer = %peer_id, "Already connected");
                conn.completion.complete(Response::ok());
                return;
            }
        }
        let Some((TunnelStatus::Working, tunnel_id)) = self.token_tunnel.status(&conn.peer_node, &self.tunnels) else {
            // Tunnel went away between scheduling and sending
            self.connect_tunneled(conn, now);
            return;
        };

        let request = PortConnect {
            port_id: conn.port_id.clone(),
            port_properties: port.properties().clone(),
            peer_actor_id: conn.peer.actor_id.clone(),
            peer_port_name: conn.peer.port_name.clone(),
            peer_port_id: conn.peer.port_id.clone(),
            peer_port_properties: conn.peer.properties.clone(),
            tunnel_id,
        };
        let msg_uuid = self.outbox.send(&conn.peer_node, Command::PortConnect(request));
        debug!(port_id = %conn.port_id, peer_node = %conn.peer_node, tunnel = %tunnel_id, "PORT_CONNECT sent");
        self.pending.insert(msg_uuid, PendingReply::Connect(conn));
    }

    pub(crate) fn connect_reply(&mut self, mut conn: TunnelConnect, response: Response, now: Instant) {
        let limits = self.config.connection.clone();
        match response.status {
            status if status.is_success() => self.finish_connect(conn, response, now),
            Status::BadRequest | Status::NotFound | Status::GatewayTimeout => {
                if conn.relocate_retries < limits.relocate_retries {
                    conn.relocate_retries += 1;
                    info!(
                        port_id = %conn.port_id,
                        status = %response.status,
                        attempt = conn.relocate_retries,
                        "Peer port not where expected, relocating"
                    );
                    conn.peer.node = None;
                    self.route_connect(conn, now);
                } else {
                    warn!(port_id = %conn.port_id, "Relocation retries exhausted");
                    conn.completion.fail(Status::NotFound);
                }
            }
            Status::Gone => {
                if conn.gone_retries < limits.gone_retries {
                    conn.gone_retries += 1;
                    debug!(port_id = %conn.port_id, attempt = conn.gone_retries, "Tunnel id stale, resending");
                    self.connect_tunneled(conn, now);
                } else {
                    warn!(port_id = %conn.port_id, "Tunnel id retries exhausted");
                    conn.completion.fail(Status::Gone);
                }
            }
            status => {
                warn!(port_id = %conn.port_id, status = %status, "Connect refused");
                conn.completion.fail(status);
            }
        }
    }

    fn finish_connect(&mut self, conn: TunnelConnect, response: Response, now: Instant) {
        let reply = match response
            .data
            .map(|data| from_value::<PortConnectReply>("port connect reply", data))
        {
            Some(Ok(reply)) => reply,
            Some(Err(e)) => {
                warn!(port_id = %conn.port_id, error = %e, "Malformed connect reply");
                conn.completion.fail(Status::InternalError);
                return;
            }
            None => {
                warn!(port_id = %conn.port_id, "Connect reply without peer port");
                conn.completion.fail(Status::InternalError);
                return;
            }
        };
        let endpoint = self.tunnel_endpoint(&conn.port_id, &reply.port_id, &conn.peer_node);
        let Some(endpoint) = endpoint else {
            conn.completion.fail(Status::NotFound);
            return;
        };
        self.attach_tunnel_endpoint(endpoint, &reply.port_properties);
        info!(port_id = %conn.port_id, peer = %reply.port_id, peer_node = %conn.peer_node, "Tunnel connection established");
        self.scheduler.trigger(now);
        conn.completion.complete(Response::ok());
    }

    /// Endpoint for `port_id` towards a remote peer port
    fn tunnel_endpoint(&self, port_id: &PortId, peer_port_id: &PortId, peer_node: &NodeId) -> Option<Endpoint> {
        let port = self.ports.get(port_id)?;
        let endpoint = match port.direction() {
            Direction::Out => Endpoint::TunnelOut(TunnelOutEndpoint::new(
                port_id.clone(),
                peer_port_id.clone(),
                peer_node.clone(),
                self.config.tunnel.backoff_initial(),
                self.config.tunnel.backoff_max(),
                self.endpoint_metrics.clone(),
            )),
            Direction::In => Endpoint::TunnelIn(TunnelInEndpoint::new(
                port_id.clone(),
                peer_port_id.clone(),
                peer_node.clone(),
                self.endpoint_metrics.clone(),
            )),
        };
        Some(endpoint)
    }

    /// Attach unless an equivalent tunnel endpoint is already in place
    fn attach_tunnel_endpoint(&mut self, endpoint: Endpoint, peer_properties: &PortProperties) {
        let Some(port) = self.ports.get_mut(endpoint.port_id()) else {
            return;
        };
        let duplicate = port
            .endpoint(endpoint.peer_port_id())
            .is_some_and(|e| e.is_tunnel() && e.peer_node() == endpoint.peer_node());
        if duplicate {
            debug!(port_id = %endpoint.port_id(), peer = %endpoint.peer_port_id(), "Tunnel endpoint already attached");
            return;
        }
        port.attach_endpoint(endpoint, peer_properties);
    }

    /// Handle a peer's `PORT_CONNECT`
    pub(crate) fn connection_request(&mut self, from: &NodeId, request: PortConnect, now: Instant) -> Response {
        let direction = request.port_properties.direction.opposite();
        let target = match (&request.peer_port_id, &request.peer_actor_id, &request.peer_port_name) {
            (Some(id), _, _) => self.ports.contains_key(id).then(|| id.clone()),
            (None, Some(actor), Some(name)) => self
                .ports
                .values()
                .find(|p| p.owner() == actor && p.name() == name && p.direction() == direction)
                .map(|p| p.id().clone()),
            _ => return Response::new(Status::BadRequest),
        };
        let Some(target) = target else {
            debug!(peer_node = %from, port = ?request.peer_port_id, "Connect request for unknown port");
            return Response::new(Status::NotFound);
        };

        match self.token_tunnel.status(from, &self.tunnels) {
            Some((TunnelStatus::Working, id)) if id == request.tunnel_id => {}
            current => {
                debug!(peer_node = %from, requested = %request.tunnel_id, ?current, "Tunnel id mismatch");
                return Response::new(Status::Gone);
            }
        }

        let Some(endpoint) = self.tunnel_endpoint(&target, &request.port_id, from) else {
            return Response::new(Status::NotFound);
        };
        self.attach_tunnel_endpoint(endpoint, &request.port_properties);
        self.scheduler.trigger(now);

        let Some(port) = self.ports.get(&target) else {
            return Response::new(Status::NotFound);
        };
        let reply = PortConnectReply {
            port_id: target.clone(),
            port_properties: port.properties().clone(),
        };
        match to_value("port connect reply", &reply) {
            Ok(data) => Response::ok_with(data),
            Err(e) => {
                warn!(error = %e, "Could not encode connect reply");
                Response::new(Status::InternalError)
            }
        }
    }
}
