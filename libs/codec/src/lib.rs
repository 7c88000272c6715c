//! # Tokenflow Wire Codec
//!
//! ## Purpose
//!
//! Encoding rules for traffic between runtime nodes:
//! - Envelope and command definitions for tunnel and port control messages
//! - Token-tunnel inner messages (`TOKEN` / `TOKEN_REPLY`)
//! - Length-prefixed framing over an ordered byte stream
//!
//! ## Architecture Role
//!
//! ```text
//! libs/types → [codec] → network/ → runtime/
//!     ↑          ↓          ↓
//! Token, ids  Envelope   Link + tunnels
//! ```
//!
//! ## What This Crate Does NOT Contain
//! - Link transport or socket handling (belongs in network/)
//! - Queue or endpoint state (belongs in runtime/)

pub mod error;
pub mod frame;
pub mod message;

pub use error::{CodecError, Result};
pub use frame::{decode_frame, encode_frame, FrameDecoder, FRAME_HEADER_SIZE, MAX_FRAME_SIZE};
pub use message::{
    from_value, to_value, Command, Envelope, ExhaustedTokens, PortConnect, PortConnectReply,
    PortDisconnect, PortDisconnectReply, TokenAck, TokenMessage, TunnelNewReply,
};
