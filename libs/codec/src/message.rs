//! Node-to-node application messages
//!
//! Every message is an [`Envelope`]: `{cmd, from_rt_uuid, to_rt_uuid, msg_uuid, ...}`
//! with the command fields flattened beside the routing fields. Replies use
//! `cmd = REPLY` and echo the request's `msg_uuid`.
//!
//! ```text
//! TUNNEL_NEW      {type, tunnel_id, policy}            -> REPLY {tunnel_id}
//! TUNNEL_DESTROY  {tunnel_id}                          -> REPLY
//! TUNNEL_DATA     {tunnel_id, value: TokenMessage}     (no reply)
//! PORT_CONNECT    {port_id, port_properties, peer_*}   -> REPLY {port_id, port_properties}
//! PORT_DISCONNECT {port_id, peer_*, terminate, remaining_tokens} -> REPLY {remaining_tokens}
//! ```

use crate::{CodecError, Result};
use flow_types::{ActorId, Direction, Disconnect, NodeId, PortId, PortProperties, Response, Token, TunnelId};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Salvaged tokens keyed by the port that held them, as `[sequence_nbr, token]` pairs
pub type ExhaustedTokens = BTreeMap<PortId, Vec<(u64, Token)>>;

/// Routed application message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub from_rt_uuid: NodeId,
    pub to_rt_uuid: NodeId,
    pub msg_uuid: Uuid,
    #[serde(flatten)]
    pub command: Command,
}

impl Envelope {
    pub fn new(from: NodeId, to: NodeId, command: Command) -> Self {
        Self {
            from_rt_uuid: from,
            to_rt_uuid: to,
            msg_uuid: Uuid::new_v4(),
            command,
        }
    }

    /// Reply to this envelope, echoing its msg_uuid
    pub fn reply(&self, value: Response) -> Self {
        Self {
            from_rt_uuid: self.to_rt_uuid.clone(),
            to_rt_uuid: self.from_rt_uuid.clone(),
            msg_uuid: self.msg_uuid,
            command: Command::Reply { value },
        }
    }

    pub fn cmd_name(&self) -> &'static str {
        self.command.name()
    }
}

/// Command carried by an envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Command {
    TunnelNew {
        #[serde(rename = "type")]
        tunnel_type: String,
        tunnel_id: TunnelId,
        #[serde(default)]
        policy: Value,
    },
    TunnelDestroy {
        tunnel_id: TunnelId,
    },
    TunnelData {
        tunnel_id: TunnelId,
        value: Value,
    },
    PortConnect(PortConnect),
    PortDisconnect(PortDisconnect),
    Reply {
        value: Response,
    },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::TunnelNew { .. } => "TUNNEL_NEW",
            Command::TunnelDestroy { .. } => "TUNNEL_DESTROY",
            Command::TunnelData { .. } => "TUNNEL_DATA",
            Command::PortConnect(_) => "PORT_CONNECT",
            Command::PortDisconnect(_) => "PORT_DISCONNECT",
            Command::Reply { .. } => "REPLY",
        }
    }
}

/// Connect request, addressed to the peer port by id or by (actor, name)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortConnect {
    pub port_id: PortId,
    pub port_properties: PortProperties,
    #[serde(default)]
    pub peer_actor_id: Option<ActorId>,
    #[serde(default)]
    pub peer_port_name: Option<String>,
    #[serde(default)]
    pub peer_port_id: Option<PortId>,
    #[serde(default)]
    pub peer_port_properties: Option<PortProperties>,
    pub tunnel_id: TunnelId,
}

/// Disconnect request carrying the requester's salvaged tokens
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortDisconnect {
    pub port_id: PortId,
    #[serde(default)]
    pub peer_actor_id: Option<ActorId>,
    #[serde(default)]
    pub peer_port_name: Option<String>,
    pub peer_port_id: PortId,
    #[serde(default)]
    pub peer_port_dir: Option<Direction>,
    pub terminate: Disconnect,
    #[serde(default)]
    pub remaining_tokens: ExhaustedTokens,
}

/// Data of a successful `TUNNEL_NEW` reply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelNewReply {
    pub tunnel_id: TunnelId,
}

/// Data of a successful `PORT_CONNECT` reply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortConnectReply {
    pub port_id: PortId,
    pub port_properties: PortProperties,
}

/// Data of a successful `PORT_DISCONNECT` reply
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PortDisconnectReply {
    #[serde(default)]
    pub remaining_tokens: ExhaustedTokens,
}

/// Acknowledgement value of a `TOKEN_REPLY`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TokenAck {
    Ack,
    Nack,
    /// Receiving port or endpoint no longer exists
    Abort,
}

/// Token-tunnel inner message, carried as the `value` of `TUNNEL_DATA`
///
/// `port_id` is always the sending out-port and `peer_port_id` the
/// receiving in-port; replies keep the same orientation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TokenMessage {
    Token {
        port_id: PortId,
        peer_port_id: PortId,
        sequencenbr: u64,
        token: Token,
    },
    TokenReply {
        port_id: PortId,
        peer_port_id: PortId,
        sequencenbr: u64,
        value: TokenAck,
    },
}

/// Encode a structured payload into a JSON document value
pub fn to_value<T: Serialize>(what: &'static str, payload: &T) -> Result<Value> {
    serde_json::to_value(payload).map_err(|e| CodecError::encode(what, e))
}

/// Decode a JSON document value into a structured payload
pub fn from_value<T: DeserializeOwned>(what: &'static str, value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| CodecError::malformed(what, e))
}

impl TokenMessage {
    pub fn to_value(&self) -> Result<Value> {
        to_value("token message", self)
    }

    pub fn from_value(value: Value) -> Result<Self> {
        from_value("token message", value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(command: Command) -> Envelope {
        Envelope::new(NodeId::from("node-a"), NodeId::from("node-b"), command)
    }

    #[test]
    fn test_tunnel_new_wire_shape() {
        let env = envelope(Command::TunnelNew {
            tunnel_type: "token".into(),
            tunnel_id: TunnelId::new(50),
            policy: json!({}),
        });
        let value = serde_json::to_value(&env).unwrap();
        assert_eq!(value["cmd"], json!("TUNNEL_NEW"));
        assert_eq!(value["type"], json!("token"));
        assert_eq!(value["tunnel_id"], json!(50));
        assert_eq!(value["from_rt_uuid"], json!("node-a"));
        assert_eq!(value["msg_uuid"], json!(env.msg_uuid.to_string()));
    }

    #[test]
    fn test_reply_echoes_msg_uuid() {
        let request = envelope(Command::TunnelDestroy { tunnel_id: TunnelId::new(7) });
        let reply = request.reply(Response::ok());
        assert_eq!(reply.msg_uuid, request.msg_uuid);
        assert_eq!(reply.to_rt_uuid, request.from_rt_uuid);
        let value = serde_json::to_value(&reply).unwrap();
        assert_eq!(value["cmd"], json!("REPLY"));
        assert_eq!(value["value"]["status"], json!(200));
    }

    #[test]
    fn test_port_disconnect_carries_remaining_tokens() {
        let mut remaining = ExhaustedTokens::new();
        remaining.insert(
            PortId::from("out-1"),
            vec![(0, Token::new("data-1")), (1, Token::new("data-2"))],
        );
        let env = envelope(Command::PortDisconnect(PortDisconnect {
            port_id: PortId::from("out-1"),
            peer_actor_id: None,
            peer_port_name: None,
            peer_port_id: PortId::from("in-1"),
            peer_port_dir: Some(Direction::In),
            terminate: Disconnect::ExhaustPeer,
            remaining_tokens: remaining,
        }));
        let value = serde_json::to_value(&env).unwrap();
        assert_eq!(value["terminate"], json!("EXHAUST_PEER"));
        assert_eq!(
            value["remaining_tokens"]["out-1"][1],
            json!([1, {"type": "Token", "value": "data-2"}])
        );
        let decoded: Envelope = serde_json::from_value(value).unwrap();
        assert_eq!(decoded, env);
    }

    #[test]
    fn test_token_message_round_trip() {
        let msg = TokenMessage::TokenReply {
            port_id: PortId::from("out-1"),
            peer_port_id: PortId::from("in-1"),
            sequencenbr: 3,
            value: TokenAck::Nack,
        };
        let value = msg.to_value().unwrap();
        assert_eq!(value["cmd"], json!("TOKEN_REPLY"));
        assert_eq!(value["value"], json!("NACK"));
        assert_eq!(TokenMessage::from_value(value).unwrap(), msg);
    }
}
