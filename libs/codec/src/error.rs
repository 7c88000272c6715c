//! Codec errors
//!
//! Each variant carries enough context to tell a truncated stream from a
//! corrupted payload when reading logs.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    /// Buffer too small to hold the declared frame
    #[error("Message too small: need {need} bytes, got {got} (context: {context})")]
    MessageTooSmall {
        need: usize,
        got: usize,
        context: String,
    },

    /// Frame length exceeds the protocol limit
    #[error("Frame too large: {size} bytes exceeds limit {limit}")]
    FrameTooLarge { size: usize, limit: usize },

    /// Payload is not a valid envelope or inner message
    #[error("Malformed {what}: {source}")]
    Malformed {
        what: &'static str,
        source: serde_json::Error,
    },

    /// Envelope could not be serialized
    #[error("Failed to encode {what}: {source}")]
    Encode {
        what: &'static str,
        source: serde_json::Error,
    },
}

pub type Result<T> = std::result::Result<T, CodecError>;

impl CodecError {
    pub fn malformed(what: &'static str, source: serde_json::Error) -> Self {
        Self::Malformed { what, source }
    }

    pub fn encode(what: &'static str, source: serde_json::Error) -> Self {
        Self::Encode { what, source }
    }

    /// More bytes may complete the frame
    pub fn is_incomplete(&self) -> bool {
        matches!(self, CodecError::MessageTooSmall { .. })
    }
}
