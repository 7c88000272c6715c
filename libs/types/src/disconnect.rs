//! Disconnect taxonomy
//!
//! `Temporary` pauses an endpoint (migration window), `Terminate` severs
//! it, and the exhaust kinds drain undelivered tokens so they can be
//! handed to the surviving side. The direction-specific exhaust kinds say
//! which side keeps draining: the out side always hands its buffered
//! tokens over, the in side always keeps consuming until drained.

use crate::Direction;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Disconnect {
    Temporary,
    Terminate,
    Exhaust,
    ExhaustPeer,
    ExhaustInport,
    ExhaustOutport,
    ExhaustPeerSend,
    ExhaustPeerRecv,
}

impl Disconnect {
    /// Resolve the generic exhaust kinds for a port of the given direction
    pub fn for_direction(self, direction: Direction) -> Self {
        match (self, direction) {
            (Disconnect::Exhaust, Direction::In) => Disconnect::ExhaustInport,
            (Disconnect::Exhaust, Direction::Out) => Disconnect::ExhaustOutport,
            (Disconnect::ExhaustPeer, Direction::In) => Disconnect::ExhaustPeerRecv,
            (Disconnect::ExhaustPeer, Direction::Out) => Disconnect::ExhaustPeerSend,
            (kind, _) => kind,
        }
    }

    /// Kind forwarded to the far side of a connection
    pub fn for_peer(self) -> Self {
        match self {
            Disconnect::Exhaust => Disconnect::ExhaustPeer,
            kind => kind,
        }
    }

    pub fn is_exhaust(&self) -> bool {
        !matches!(self, Disconnect::Temporary | Disconnect::Terminate)
    }

    /// Out side hands its undelivered tokens over
    pub fn hands_over_tokens(&self) -> bool {
        matches!(self, Disconnect::ExhaustOutport | Disconnect::ExhaustPeerSend)
    }

    /// In side keeps the writer until its tokens are consumed
    pub fn keeps_draining(&self) -> bool {
        matches!(self, Disconnect::ExhaustInport | Disconnect::ExhaustPeerRecv)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exhaust_maps_per_direction() {
        assert_eq!(Disconnect::Exhaust.for_direction(Direction::Out), Disconnect::ExhaustOutport);
        assert_eq!(Disconnect::Exhaust.for_direction(Direction::In), Disconnect::ExhaustInport);
        assert_eq!(Disconnect::ExhaustPeer.for_direction(Direction::In), Disconnect::ExhaustPeerRecv);
        assert_eq!(Disconnect::ExhaustPeer.for_direction(Direction::Out), Disconnect::ExhaustPeerSend);
        assert_eq!(Disconnect::Terminate.for_direction(Direction::In), Disconnect::Terminate);
    }

    #[test]
    fn test_peer_kind() {
        assert_eq!(Disconnect::Exhaust.for_peer(), Disconnect::ExhaustPeer);
        assert_eq!(Disconnect::ExhaustPeer.for_peer(), Disconnect::ExhaustPeer);
        assert_eq!(Disconnect::Temporary.for_peer(), Disconnect::Temporary);
    }

    #[test]
    fn test_wire_names() {
        assert_eq!(
            serde_json::to_value(Disconnect::ExhaustPeerSend).unwrap(),
            serde_json::json!("EXHAUST_PEER_SEND")
        );
    }
}
