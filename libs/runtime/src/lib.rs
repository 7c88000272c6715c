//! # Tokenflow Runtime
//!
//! ## Purpose
//!
//! Moves tokens between actor ports, within a node and across nodes:
//! - [`queue`]: per-port token queues (fanout, balanced/round-robin/random
//!   dispatch, tagged and collect disciplines) with a tentative
//!   read window for in-flight tokens
//! - [`endpoint`]: local and tunnel endpoints with ACK/NACK flow control
//! - [`connection`]: connect and disconnect orchestration, including the
//!   exhaust handoff of undelivered tokens
//! - [`scheduler`]: strategy passes, watchdog and maintenance tasks
//! - [`driver`]: the async task that owns a [`Node`] and talks to the link
//!
//! ## Architecture Role
//!
//! ```text
//!            actors
//!              ↓ read / write
//!  [runtime] Port ── Queue ── Endpoint ──► TokenTunnel
//!              ↑                               ↓
//!          Scheduler                      network/ (TunnelManager, link)
//! ```
//!
//! ## What This Crate Does NOT Contain
//! - Wire formats (belongs in codec/)
//! - Link and tunnel state machines (belongs in network/)

pub mod actor;
pub mod completion;
pub mod connection;
pub mod directory;
pub mod driver;
pub mod endpoint;
pub mod error;
pub mod metrics;
pub mod node;
pub mod port;
pub mod queue;
pub mod scheduler;
pub mod telemetry;
pub mod token_tunnel;

pub use actor::{Actor, ActorIo};
pub use completion::Completion;
pub use connection::PeerPort;
pub use directory::{InMemoryDirectory, PortDirectory, PortRecord};
pub use driver::{NodeCommand, NodeDriver, NodeHandle};
pub use endpoint::{Endpoint, Wake};
pub use error::{QueueError, Result, RuntimeError};
pub use metrics::{EndpointMetrics, EndpointStats, SchedulerMetrics, SchedulerStats};
pub use node::{Node, NodeStats};
pub use port::{Port, PortTable};
pub use queue::{ComResult, Queue, QueueConfig, TokenQueue};
pub use scheduler::{Scheduler, Task};
pub use telemetry::init_tracing;
pub use token_tunnel::TokenTunnel;
