//! Link and tunnel errors

use flow_codec::CodecError;
use flow_types::NodeId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    /// No usable link to the peer runtime
    #[error("Link to {peer:?} unavailable: {message}")]
    Connection { message: String, peer: Option<NodeId> },

    #[error("Envelope codec failed: {0}")]
    Codec(#[from] CodecError),

    /// Malformed tunnel payload
    #[error("Tunnel protocol violation: {message}")]
    Protocol { message: String },

    /// Tunnel unknown or not in a state that allows the operation
    #[error("Tunnel {tunnel}: {message}")]
    TunnelState { tunnel: String, message: String },

    #[error("{feature} is not supported: {reason}")]
    NotImplemented { feature: String, reason: String },
}

pub type Result<T> = std::result::Result<T, TransportError>;

impl TransportError {
    pub fn connection(message: impl Into<String>, peer: Option<&NodeId>) -> Self {
        Self::Connection {
            message: message.into(),
            peer: peer.cloned(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    pub fn tunnel_state(tunnel: impl ToString, message: impl Into<String>) -> Self {
        Self::TunnelState {
            tunnel: tunnel.to_string(),
            message: message.into(),
        }
    }

    pub fn not_implemented(feature: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::NotImplemented {
            feature: feature.into(),
            reason: reason.into(),
        }
    }

    /// Link loss and tunnels still coming up may clear after a reconnect
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransportError::Connection { .. } | TransportError::TunnelState { .. })
    }

    /// Short label for logs and counters
    pub fn category(&self) -> &'static str {
        match self {
            TransportError::Connection { .. } => "connection",
            TransportError::Codec(_) => "codec",
            TransportError::Protocol { .. } => "protocol",
            TransportError::TunnelState { .. } => "tunnel_state",
            TransportError::NotImplemented { .. } => "not_implemented",
        }
    }
}
