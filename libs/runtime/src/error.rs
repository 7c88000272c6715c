//! Runtime Error Types
//!
//! `QueueError` covers the data plane; `Full` and `Empty` are ordinary
//! control-flow signals. `RuntimeError` covers everything a node operation
//! can fail with before it reaches the peer.

use flow_codec::CodecError;
use flow_network::TransportError;
use flow_types::{ActorId, PortId};
use thiserror::Error;

/// Queue operation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// No free slot for the write's destination peer
    #[error("Queue full")]
    Full,

    /// Nothing left to peek for the reader
    #[error("Queue empty for reader {reader:?}")]
    Empty { reader: Option<PortId> },

    #[error("Unknown peer {peer} in {queuetype}")]
    UnknownPeer { peer: PortId, queuetype: &'static str },

    /// Token shape not accepted by the discipline (e.g. unmapped selector)
    #[error("Invalid token: {message}")]
    InvalidToken { message: String },

    #[error("Invalid queue config: {message}")]
    InvalidConfig { message: String },

    /// Serialized state could not be applied
    #[error("Invalid queue state: {message}")]
    InvalidState { message: String },

    #[error("Operation '{operation}' unsupported by {queuetype}")]
    Unsupported {
        operation: &'static str,
        queuetype: &'static str,
    },
}

impl QueueError {
    pub fn empty(reader: Option<&PortId>) -> Self {
        Self::Empty {
            reader: reader.cloned(),
        }
    }

    pub fn unknown_peer(peer: &PortId, queuetype: &'static str) -> Self {
        Self::UnknownPeer {
            peer: peer.clone(),
            queuetype,
        }
    }

    pub fn invalid_token(message: impl Into<String>) -> Self {
        Self::InvalidToken {
            message: message.into(),
        }
    }

    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    pub fn unsupported(operation: &'static str, queuetype: &'static str) -> Self {
        Self::Unsupported { operation, queuetype }
    }

    /// Backpressure or starvation, retried on a later scheduler pass
    pub fn is_backpressure(&self) -> bool {
        matches!(self, QueueError::Full | QueueError::Empty { .. })
    }
}

/// Node runtime errors
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("Unknown port {port}")]
    UnknownPort { port: PortId },

    #[error("Unknown actor {actor}")]
    UnknownActor { actor: ActorId },

    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
    },

    /// The node driver is no longer running
    #[error("Node stopped: {message}")]
    Stopped { message: String },
}

/// Result type alias for runtime operations
pub type Result<T> = std::result::Result<T, RuntimeError>;

impl RuntimeError {
    pub fn unknown_port(port: &PortId) -> Self {
        Self::UnknownPort { port: port.clone() }
    }

    pub fn unknown_actor(actor: &ActorId) -> Self {
        Self::UnknownActor {
            actor: actor.clone(),
        }
    }

    pub fn configuration(message: impl Into<String>, field: Option<&str>) -> Self {
        Self::Configuration {
            message: message.into(),
            field: field.map(|s| s.to_string()),
        }
    }

    pub fn stopped(message: impl Into<String>) -> Self {
        Self::Stopped {
            message: message.into(),
        }
    }

    /// Recoverable by retrying later without operator action
    pub fn is_recoverable(&self) -> bool {
        match self {
            RuntimeError::Queue(e) => e.is_backpressure(),
            RuntimeError::Transport(e) => e.is_retryable(),
            RuntimeError::Codec(_) => false,
            RuntimeError::UnknownPort { .. } => false,
            RuntimeError::UnknownActor { .. } => false,
            RuntimeError::Configuration { .. } => false,
            RuntimeError::Stopped { .. } => false,
        }
    }

    /// Error category for logging and metrics
    pub fn category(&self) -> &'static str {
        match self {
            RuntimeError::Queue(_) => "queue",
            RuntimeError::Transport(e) => e.category(),
            RuntimeError::Codec(_) => "codec",
            RuntimeError::UnknownPort { .. } => "unknown_port",
            RuntimeError::UnknownActor { .. } => "unknown_actor",
            RuntimeError::Configuration { .. } => "configuration",
            RuntimeError::Stopped { .. } => "stopped",
        }
    }
}
