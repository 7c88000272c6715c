//! # Tokenflow Core Types
//!
//! Value types shared by every layer of the token transport:
//!
//! - **Token**: immutable unit of data flowing between ports, with the
//!   `ExceptionToken`/`EOSToken` control variants
//! - **Identifiers**: `NodeId`, `PortId`, `ActorId`, `TunnelId`
//! - **Response**: the numeric status vocabulary used by every
//!   request/reply exchange between runtime nodes
//! - **Disconnect**: the terminate taxonomy driving endpoint teardown
//! - **PortProperties**: direction, routing discipline and peer count of a port
//!
//! Nothing in this crate performs I/O; the codec and runtime crates build
//! on top of these definitions.

pub mod disconnect;
pub mod error;
pub mod ids;
pub mod properties;
pub mod response;
pub mod token;

pub use disconnect::Disconnect;
pub use error::{Result, TypesError};
pub use ids::{ActorId, NodeId, PortId, TunnelId};
pub use properties::{Direction, PortProperties, Routing};
pub use response::{Response, Status};
pub use token::{Token, TokenKind};
