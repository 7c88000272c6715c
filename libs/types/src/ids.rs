//! Identifiers for nodes, ports, actors and tunnels
//!
//! Node, port and actor ids are opaque strings: freshly generated ids are
//! UUIDv4 in simple form, but any non-empty string received from a peer or
//! a test fixture is accepted. Tunnel ids are numeric so the simultaneous
//! setup tie-break can compare them.

use crate::{Result, TypesError};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident, $kind:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Generate a fresh random id
            pub fn generate() -> Self {
                Self(Uuid::new_v4().simple().to_string())
            }

            /// Validate and wrap an existing id
            pub fn parse(id: impl Into<String>) -> Result<Self> {
                let id = id.into();
                if id.is_empty() {
                    return Err(TypesError::invalid_id($kind, "empty id"));
                }
                Ok(Self(id))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id!(
    /// Runtime node identifier (`rt_uuid` on the wire)
    NodeId,
    "node"
);
string_id!(
    /// Process-wide unique port identifier
    PortId,
    "port"
);
string_id!(
    /// Actor identifier
    ActorId,
    "actor"
);

/// Tunnel identifier, unique per (peer node, tunnel)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TunnelId(u64);

impl TunnelId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Random id for a locally initiated tunnel
    pub fn random() -> Self {
        Self(rand::thread_rng().gen_range(1..u64::MAX))
    }

    pub const fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TunnelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tunnel-{}", self.0)
    }
}

impl From<u64> for TunnelId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}
