//! Connections between two ports of the same node

use crate::endpoint::{Endpoint, LocalInEndpoint, LocalOutEndpoint};
use crate::connection::PeerPort;
use crate::node::Node;
use crate::queue::TokenQueue;
use flow_types::{Direction, Disconnect, PortId, Status};
use std::time::Instant;
use tracing::{debug, info};

impl Node {
    /// Resolve a peer descriptor to a port of this node
    pub(crate) fn find_local_port(&self, peer: &PeerPort, direction: Direction) -> Option<PortId> {
        if let Some(id) = &peer.port_id {
            return self.ports.contains_key(id).then(|| id.clone());
        }
        let (actor, name) = (peer.actor_id.as_ref()?, peer.port_name.as_ref()?);
        self.ports
            .values()
            .find(|p| p.owner() == actor && p.name() == name && p.direction() == direction)
            .map(|p| p.id().clone())
    }

    pub(crate) fn connect_local(&mut self, port_id: &PortId, peer: &PeerPort, now: Instant) -> Status {
        let Some(direction) = self.ports.get(port_id).map(|p| p.direction()) else {
            return Status::NotFound;
        };
        let Some(peer_id) = self.find_local_port(peer, direction.opposite()) else {
            debug!(port_id = %port_id, ?peer, "Local peer port not found");
            return Status::NotFound;
        };
        if &peer_id == port_id {
            return Status::BadRequest;
        }
        let (out_id, in_id) = match direction {
            Direction::Out => (port_id.clone(), peer_id),
            Direction::In => (peer_id, port_id.clone()),
        };

        let (Some(out_port), Some(in_port)) = (self.ports.get(&out_id), self.ports.get(&in_id)) else {
            return Status::NotFound;
        };
        if out_port.is_connected_to(&in_id) && in_port.is_connected_to(&out_id) {
            debug!(out = %out_id, inp = %in_id, "Ports already connected");
            return Status::Ok;
        }
        let out_props = out_port.properties().clone();
        let in_props = in_port.properties().clone();

        let out_endpoint = LocalOutEndpoint::new(out_id.clone(), in_id.clone(), self.id.clone());
        let in_endpoint = LocalInEndpoint::new(in_id.clone(), out_id.clone(), self.id.clone());

        let received = match self.ports.get_mut(&in_id) {
            Some(port) => {
                port.attach_endpoint(Endpoint::LocalIn(in_endpoint.clone()), &out_props);
                port.queue().writer_position(&out_id).unwrap_or(0)
            }
            None => return Status::NotFound,
        };
        if let Some(port) = self.ports.get_mut(&out_id) {
            port.attach_endpoint(Endpoint::LocalOut(out_endpoint), &in_props);
            in_endpoint.fix_mismatch(received, port.queue_mut());
        }

        info!(out = %out_id, inp = %in_id, "Local connection established");
        self.scheduler.trigger(now);
        Status::Ok
    }

    /// Tear down a same-node connection, handing salvaged tokens across
    pub(crate) fn disconnect_local(&mut self, port_id: &PortId, peer_id: &PortId, terminate: Disconnect) -> Status {
        let own_tokens = match self.ports.get_mut(port_id) {
            Some(port) => port.detach(std::slice::from_ref(peer_id), terminate).1,
            None => return Status::NotFound,
        };
        let peer_tokens = match self.ports.get_mut(peer_id) {
            Some(port) => {
                let (_, tokens) = port.detach(std::slice::from_ref(port_id), terminate.for_peer());
                port.exhausted_tokens(&own_tokens);
                tokens
            }
            None => {
                debug!(port_id = %port_id, peer = %peer_id, "Local peer already gone");
                return Status::Ok;
            }
        };
        if let Some(port) = self.ports.get_mut(port_id) {
            port.exhausted_tokens(&peer_tokens);
        }
        debug!(port_id = %port_id, peer = %peer_id, ?terminate, "Local connection removed");
        Status::Ok
    }
}
