//! Port location directory
//!
//! Connections to a port on an unknown node, and relocation after a peer
//! answered NOT_FOUND, ask the directory where the port lives now. The
//! in-memory directory is shared by every node of a process.

use crate::connection::PeerPort;
use flow_types::{ActorId, Direction, NodeId, PortId, PortProperties};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::trace;

#[derive(Debug, Clone, PartialEq)]
pub struct PortRecord {
    pub port_id: PortId,
    pub node: NodeId,
    pub actor_id: ActorId,
    pub port_name: String,
    pub properties: PortProperties,
}

pub trait PortDirectory: Send + Sync {
    fn register(&self, record: PortRecord);

    fn unregister(&self, port_id: &PortId);

    fn lookup(&self, port_id: &PortId) -> Option<PortRecord>;

    fn lookup_by_name(&self, actor_id: &ActorId, port_name: &str, direction: Direction) -> Option<PortRecord>;

    /// Resolve a peer descriptor: by port id first, then by actor and
    /// port name on the given direction
    fn locate(&self, peer: &PeerPort, direction: Direction) -> Option<PortRecord> {
        if let Some(record) = peer.port_id.as_ref().and_then(|id| self.lookup(id)) {
            return Some(record);
        }
        match (&peer.actor_id, &peer.port_name) {
            (Some(actor), Some(name)) => self.lookup_by_name(actor, name, direction),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryDirectory {
    records: Arc<RwLock<HashMap<PortId, PortRecord>>>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Record that a port moved to another node
    pub fn relocate(&self, port_id: &PortId, node: NodeId) -> bool {
        match self.records.write().get_mut(port_id) {
            Some(record) => {
                record.node = node;
                true
            }
            None => false,
        }
    }
}

impl PortDirectory for InMemoryDirectory {
    fn register(&self, record: PortRecord) {
        trace!(port_id = %record.port_id, node = %record.node, "Registering port");
        self.records.write().insert(record.port_id.clone(), record);
    }

    fn unregister(&self, port_id: &PortId) {
        self.records.write().remove(port_id);
    }

    fn lookup(&self, port_id: &PortId) -> Option<PortRecord> {
        self.records.read().get(port_id).cloned()
    }

    fn lookup_by_name(&self, actor_id: &ActorId, port_name: &str, direction: Direction) -> Option<PortRecord> {
        self.records
            .read()
            .values()
            .find(|r| &r.actor_id == actor_id && r.port_name == port_name && r.properties.direction == direction)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, node: &str, direction: Direction) -> PortRecord {
        PortRecord {
            port_id: PortId::from(id),
            node: NodeId::from(node),
            actor_id: ActorId::from("actor"),
            port_name: "token".to_string(),
            properties: PortProperties::new(direction),
        }
    }

    #[test]
    fn test_locate_by_id_then_name() {
        let directory = InMemoryDirectory::new();
        directory.register(record("in-1", "node-a", Direction::In));
        directory.register(record("out-1", "node-a", Direction::Out));

        let by_id = PeerPort::by_id(PortId::from("in-1"));
        assert_eq!(directory.locate(&by_id, Direction::In).unwrap().node, NodeId::from("node-a"));

        let by_name = PeerPort::by_name(ActorId::from("actor"), "token");
        assert_eq!(
            directory.locate(&by_name, Direction::Out).unwrap().port_id,
            PortId::from("out-1")
        );
    }

    #[test]
    fn test_relocate_updates_shared_view() {
        let directory = InMemoryDirectory::new();
        let other = directory.clone();
        directory.register(record("in-1", "node-a", Direction::In));
        assert!(other.relocate(&PortId::from("in-1"), NodeId::from("node-b")));
        assert_eq!(directory.lookup(&PortId::from("in-1")).unwrap().node, NodeId::from("node-b"));
        assert!(!other.relocate(&PortId::from("missing"), NodeId::from("node-b")));
    }
}
