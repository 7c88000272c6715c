//! # Tokenflow Network Layer
//!
//! ## Purpose
//!
//! Everything between a node and its peers below the token transport:
//! - [`LinkTransport`]: ordered, reliable frame delivery between two nodes
//! - [`TunnelManager`]: typed tunnels multiplexed over links, including the
//!   simultaneous-setup tie-break
//! - [`Outbox`]: outgoing actions produced by the I/O-free state machines
//!
//! ## Architecture Role
//!
//! ```text
//! runtime/ (endpoints, connections)
//!        ↓ send / tunnel_new
//! [network]  TunnelManager ──► Outbox ──► driver ──► LinkTransport
//!        ↑ TunnelEvent
//! ```

pub mod error;
pub mod link;
pub mod outbox;
pub mod tunnel;

pub use error::{Result, TransportError};
pub use link::{InMemoryLink, InMemoryNetwork, LinkEvent, LinkMetrics, LinkStats, LinkTransport};
pub use outbox::{OutboundAction, Outbox};
pub use tunnel::{Tunnel, TunnelEvent, TunnelEventKind, TunnelHandle, TunnelManager, TunnelStatus};
