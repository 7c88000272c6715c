//! Errors raised while decoding or validating core types

use thiserror::Error;

/// Core type errors
#[derive(Error, Debug)]
pub enum TypesError {
    /// Encoded token could not be decoded
    #[error("Token decode error: {message}")]
    TokenDecode {
        message: String,
        source: Option<serde_json::Error>,
    },

    /// Identifier failed validation
    #[error("Invalid identifier: {kind}: {message}")]
    InvalidId { kind: &'static str, message: String },
}

/// Result type alias for core type operations
pub type Result<T> = std::result::Result<T, TypesError>;

impl TypesError {
    /// Create a token decode error
    pub fn token_decode(message: impl Into<String>) -> Self {
        Self::TokenDecode {
            message: message.into(),
            source: None,
        }
    }

    /// Create a token decode error with source
    pub fn token_decode_with_source(message: impl Into<String>, source: serde_json::Error) -> Self {
        Self::TokenDecode {
            message: message.into(),
            source: Some(source),
        }
    }

    /// Create an identifier validation error
    pub fn invalid_id(kind: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidId {
            kind,
            message: message.into(),
        }
    }
}
