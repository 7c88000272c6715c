//! Tokens
//!
//! A `Token` is the immutable unit exchanged between ports. The payload is
//! held behind an `Arc` so fan-out queues and retransmission buffers share
//! one allocation; there is no API that hands out a mutable payload.
//!
//! Wire form: `{type, value, origin?, timestamp?, port_tag?}` with `type`
//! one of `Token`, `ExceptionToken`, `EOSToken`. Unknown types decode as
//! exceptions so a newer peer cannot wedge an older one.

use crate::{NodeId, Result, TypesError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// Default payload of an exception token
pub const EXCEPTION_VALUE: &str = "Exception";

/// Default payload of an end-of-stream token
pub const EOS_VALUE: &str = "End of stream";

/// Token variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenKind {
    /// Ordinary data
    Data,
    /// Control value carrying an error description
    Exception,
    /// End of stream, a specialised exception
    EndOfStream,
}

impl TokenKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            TokenKind::Data => "Token",
            TokenKind::Exception => "ExceptionToken",
            TokenKind::EndOfStream => "EOSToken",
        }
    }

    fn from_type_name(name: &str) -> Option<Self> {
        match name {
            "Token" => Some(TokenKind::Data),
            "ExceptionToken" => Some(TokenKind::Exception),
            "EOSToken" => Some(TokenKind::EndOfStream),
            _ => None,
        }
    }
}

/// Immutable value container exchanged between ports
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "TokenRepr", from = "TokenRepr")]
pub struct Token {
    kind: TokenKind,
    value: Arc<Value>,
    origin: Option<NodeId>,
    timestamp: Option<f64>,
    port_tag: Option<String>,
}

impl Token {
    /// Create a data token
    pub fn new(value: impl Into<Value>) -> Self {
        Self::with_kind(TokenKind::Data, value.into())
    }

    /// Create an exception token with the default payload
    pub fn exception() -> Self {
        Self::with_kind(TokenKind::Exception, Value::from(EXCEPTION_VALUE))
    }

    /// Create an exception token carrying a message
    pub fn exception_with(value: impl Into<Value>) -> Self {
        Self::with_kind(TokenKind::Exception, value.into())
    }

    /// Create an end-of-stream token
    pub fn eos() -> Self {
        Self::with_kind(TokenKind::EndOfStream, Value::from(EOS_VALUE))
    }

    fn with_kind(kind: TokenKind, value: Value) -> Self {
        Self {
            kind,
            value: Arc::new(value),
            origin: None,
            timestamp: None,
            port_tag: None,
        }
    }

    /// Attach the producing node
    pub fn with_origin(mut self, origin: NodeId) -> Self {
        self.origin = Some(origin);
        self
    }

    /// Attach a production timestamp (seconds since the epoch)
    pub fn with_timestamp(mut self, timestamp: f64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Attach a port tag
    pub fn with_port_tag(mut self, tag: impl Into<String>) -> Self {
        self.port_tag = Some(tag.into());
        self
    }

    /// Derive a token of the same kind and metadata with a different payload
    pub fn with_value(&self, value: impl Into<Value>) -> Self {
        Self {
            kind: self.kind,
            value: Arc::new(value.into()),
            origin: self.origin.clone(),
            timestamp: self.timestamp,
            port_tag: self.port_tag.clone(),
        }
    }

    pub fn kind(&self) -> TokenKind {
        self.kind
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn origin(&self) -> Option<&NodeId> {
        self.origin.as_ref()
    }

    pub fn timestamp(&self) -> Option<f64> {
        self.timestamp
    }

    pub fn port_tag(&self) -> Option<&str> {
        self.port_tag.as_deref()
    }

    /// True for exception and end-of-stream tokens
    pub fn is_exception(&self) -> bool {
        matches!(self.kind, TokenKind::Exception | TokenKind::EndOfStream)
    }

    pub fn is_eos(&self) -> bool {
        self.kind == TokenKind::EndOfStream
    }

    /// Structural encoding for wire transfer and persisted state
    pub fn encode(&self) -> Value {
        let mut map = serde_json::Map::new();
        map.insert("type".into(), Value::from(self.kind.type_name()));
        map.insert("value".into(), (*self.value).clone());
        if let Some(origin) = &self.origin {
            map.insert("origin".into(), Value::from(origin.as_str()));
        }
        if let Some(timestamp) = self.timestamp {
            map.insert("timestamp".into(), Value::from(timestamp));
        }
        if let Some(tag) = &self.port_tag {
            map.insert("port_tag".into(), Value::from(tag.as_str()));
        }
        Value::Object(map)
    }

    /// Decode the structural encoding produced by [`Token::encode`]
    pub fn decode(encoded: &Value) -> Result<Self> {
        if !encoded.is_object() {
            return Err(TypesError::token_decode("encoded token must be a mapping"));
        }
        serde_json::from_value(encoded.clone())
            .map_err(|e| TypesError::token_decode_with_source("malformed token", e))
    }
}

impl From<Value> for Token {
    fn from(value: Value) -> Self {
        Token::new(value)
    }
}

#[derive(Serialize, Deserialize)]
struct TokenRepr {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    origin: Option<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    timestamp: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    port_tag: Option<String>,
}

impl From<Token> for TokenRepr {
    fn from(token: Token) -> Self {
        Self {
            kind: token.kind.type_name().to_string(),
            value: Arc::try_unwrap(token.value).unwrap_or_else(|shared| (*shared).clone()),
            origin: token.origin,
            timestamp: token.timestamp,
            port_tag: token.port_tag,
        }
    }
}

impl From<TokenRepr> for Token {
    fn from(repr: TokenRepr) -> Self {
        let kind = TokenKind::from_type_name(&repr.kind).unwrap_or(TokenKind::Exception);
        Self {
            kind,
            value: Arc::new(repr.value),
            origin: repr.origin,
            timestamp: repr.timestamp,
            port_tag: repr.port_tag,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_encode_omits_absent_metadata() {
        let encoded = Token::new(42).encode();
        assert_eq!(encoded, json!({"type": "Token", "value": 42}));
    }

    #[test]
    fn test_decode_preserves_metadata() {
        let token = Token::new(json!({"a": [1, 2]}))
            .with_origin(NodeId::from("node-a"))
            .with_timestamp(12.5)
            .with_port_tag("left");
        let decoded = Token::decode(&token.encode()).unwrap();
        assert_eq!(decoded, token);
        assert_eq!(decoded.origin().unwrap().as_str(), "node-a");
        assert_eq!(decoded.port_tag(), Some("left"));
    }

    #[test]
    fn test_unknown_type_decodes_as_exception() {
        let decoded = Token::decode(&json!({"type": "FancyToken", "value": "x"})).unwrap();
        assert!(decoded.is_exception());
        assert_eq!(decoded.value(), &json!("x"));
    }

    #[test]
    fn test_eos_is_an_exception() {
        let eos = Token::eos();
        assert!(eos.is_exception());
        assert!(eos.is_eos());
        assert_eq!(eos.value(), &json!(EOS_VALUE));
        assert_eq!(Token::exception().value(), &json!(EXCEPTION_VALUE));
    }

    #[test]
    fn test_with_value_keeps_kind() {
        let exc = Token::exception_with("boom").with_port_tag("t");
        let tagged = exc.with_value(json!({"writer-2": "boom"}));
        assert!(tagged.is_exception());
        assert_eq!(tagged.port_tag(), Some("t"));
        assert_eq!(exc.value(), &json!("boom"));
    }

    #[test]
    fn test_decode_rejects_non_mapping() {
        assert!(Token::decode(&json!([1, 2])).is_err());
    }
}
