//! Port properties
//!
//! The properties bag travels with `PORT_CONNECT` and selects the queue
//! discipline of the port. Unknown routing names fall back to plain
//! fan-out so a peer advertising a newer discipline still connects.

use serde::{Deserialize, Serialize};

/// Port direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    In,
    Out,
}

impl Direction {
    pub fn opposite(&self) -> Self {
        match self {
            Direction::In => Direction::Out,
            Direction::Out => Direction::In,
        }
    }
}

/// Routing (out ports) or collection (in ports) discipline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Routing {
    #[default]
    Fanout,
    RoundRobin,
    Random,
    DispatchOrdered,
    DispatchMapped,
    Balanced,
    CollectUnordered,
    CollectTagged,
    CollectAllTagged,
    CollectAnyTagged,
    #[serde(other)]
    Default,
}

impl Routing {
    pub fn is_collect(&self) -> bool {
        matches!(
            self,
            Routing::CollectUnordered
                | Routing::CollectTagged
                | Routing::CollectAllTagged
                | Routing::CollectAnyTagged
        )
    }

    pub fn is_dispatch(&self) -> bool {
        matches!(
            self,
            Routing::RoundRobin
                | Routing::Random
                | Routing::DispatchOrdered
                | Routing::DispatchMapped
                | Routing::Balanced
        )
    }
}

fn default_nbr_peers() -> usize {
    1
}

/// Properties of a port
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortProperties {
    pub direction: Direction,
    #[serde(default)]
    pub routing: Routing,
    #[serde(default = "default_nbr_peers")]
    pub nbr_peers: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_length: Option<usize>,
}

impl PortProperties {
    pub fn new(direction: Direction) -> Self {
        Self {
            direction,
            routing: Routing::Fanout,
            nbr_peers: 1,
            tag: None,
            queue_length: None,
        }
    }

    pub fn inport() -> Self {
        Self::new(Direction::In)
    }

    pub fn outport() -> Self {
        Self::new(Direction::Out)
    }

    pub fn with_routing(mut self, routing: Routing) -> Self {
        self.routing = routing;
        self
    }

    pub fn with_nbr_peers(mut self, nbr_peers: usize) -> Self {
        self.nbr_peers = nbr_peers;
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn with_queue_length(mut self, length: usize) -> Self {
        self.queue_length = Some(length);
        self
    }
}
