//! Token queues
//!
//! Every port owns exactly one queue. The discipline is chosen from the
//! port's routing property and identified on the wire by its `queuetype`:
//!
//! ```text
//! routing              queuetype                        struct
//! fanout / default     fanout_fifo                      FanoutFifo
//! dispatch-ordered     dispatch:ordered                 DispatchFifo
//! round-robin          scheduled_fifo:round-robin       DispatchFifo
//! random               scheduled_fifo:random            DispatchFifo
//! balanced             scheduled_fifo:balanced          DispatchFifo
//! dispatch-mapped      scheduled_fifo:dispatch-mapped   DispatchFifo
//! collect-all-tagged   collect:all-tagged               CollectFifo
//! collect-any-tagged   collect:any-tagged               CollectFifo
//! collect-tagged       collect:tagged                   CollectFifo
//! collect-unordered    collect:unordered                CollectFifo
//! ```
//!
//! "Reader" and "writer" are peer port ids: an out-port queue has the peer
//! in-ports as readers, an in-port queue has the peer out-ports as writers
//! and its own port as the reader.

pub mod collect;
pub mod dispatch;
pub mod fanout;
pub mod fifo;

pub use collect::{CollectFifo, CollectMode, Tag};
pub use dispatch::{DispatchFifo, DispatchKind};
pub use fanout::FanoutFifo;
pub use fifo::ComResult;

use crate::error::QueueError;
use flow_codec::ExhaustedTokens;
use flow_types::{Disconnect, PortId, PortProperties, Token};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

/// Old peer id to new peer id, applied when exporting state for a move
pub type PeerRemap = HashMap<PortId, PortId>;

pub(crate) fn remap_id(remap: Option<&PeerRemap>, id: &PortId) -> PortId {
    remap.and_then(|m| m.get(id)).unwrap_or(id).clone()
}

/// Draining status of a writer being exhausted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Termination {
    pub kind: Disconnect,
    pub got_tokens: bool,
}

/// Actor-supplied port configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(rename = "port-order", default, skip_serializing_if = "Option::is_none")]
    pub port_order: Option<Vec<PortId>>,
    #[serde(rename = "port-mapping", default, skip_serializing_if = "Option::is_none")]
    pub port_mapping: Option<BTreeMap<String, PortId>>,
}

impl QueueConfig {
    pub fn is_empty(&self) -> bool {
        self.port_order.is_none() && self.port_mapping.is_none()
    }
}

/// Operations common to every queue discipline
///
/// `peer` arguments are optional where a discipline can resolve a sole
/// reader on its own. `commit` returns true when it removed a drained
/// exhausting writer.
pub trait TokenQueue {
    fn queuetype(&self) -> &'static str;
    fn nbr_peers(&self) -> usize;

    /// Readers for out-port disciplines, writers for collect disciplines
    fn peers(&self) -> Vec<PortId>;
    fn writers(&self) -> Vec<PortId>;

    fn add_reader(&mut self, reader: &PortId, properties: &PortProperties);
    fn remove_reader(&mut self, reader: &PortId) -> bool;
    fn add_writer(&mut self, writer: &PortId, properties: &PortProperties);
    fn remove_writer(&mut self, writer: &PortId) -> bool;
    fn set_config(&mut self, config: &QueueConfig) -> Result<(), QueueError>;

    fn write(&mut self, token: Token, writer: Option<&PortId>) -> Result<(), QueueError>;
    fn slots_available(&self, n: usize, peer: Option<&PortId>) -> bool;
    fn tokens_available(&self, n: usize, peer: Option<&PortId>) -> bool;
    fn peek(&mut self, peer: Option<&PortId>) -> Result<Token, QueueError>;
    fn commit(&mut self, peer: Option<&PortId>) -> Result<bool, QueueError>;
    fn cancel(&mut self, peer: Option<&PortId>) -> Result<(), QueueError>;

    fn com_write(&mut self, token: Token, writer: &PortId, seq: u64) -> Result<ComResult, QueueError>;
    fn com_peek(&mut self, reader: &PortId) -> Result<(u64, Token), QueueError>;
    fn com_commit(&mut self, reader: &PortId, seq: u64) -> Result<ComResult, QueueError>;
    fn com_cancel(&mut self, reader: &PortId, seq: u64) -> Result<ComResult, QueueError>;
    fn com_is_committed(&self, reader: &PortId) -> bool;

    /// Detach `peer`, returning its undelivered tokens when the kind hands them over
    fn exhaust(&mut self, peer: &PortId, terminate: Disconnect) -> Vec<(u64, Token)>;
    /// Fold tokens salvaged by a peer; returns the remaining peer count
    fn set_exhausted_tokens(&mut self, tokens: &ExhaustedTokens) -> usize;
    fn is_exhausting(&self, peer: Option<&PortId>) -> bool;

    /// Next sequence number expected from `writer`
    fn writer_position(&self, writer: &PortId) -> Option<u64>;
    /// Committed sequence number of `reader`
    fn reader_position(&self, reader: &PortId) -> Option<u64>;
    /// Drop the oldest unread token for `reader` without delivering it
    fn discard_one(&mut self, reader: &PortId) -> bool;

    fn state(&self, remap: Option<&PeerRemap>) -> Result<Value, QueueError>;
    fn set_state(&mut self, state: Value) -> Result<(), QueueError>;
}

/// A port's queue
#[derive(Debug, Clone, PartialEq)]
pub enum Queue {
    Fanout(FanoutFifo),
    Dispatch(DispatchFifo),
    Collect(CollectFifo),
}

macro_rules! delegate {
    ($self:ident, $q:ident => $body:expr) => {
        match $self {
            Queue::Fanout($q) => $body,
            Queue::Dispatch($q) => $body,
            Queue::Collect($q) => $body,
        }
    };
}

impl Queue {
    /// Queue for a port with the given properties
    pub fn new(properties: &PortProperties, default_length: usize) -> Self {
        let length = properties.queue_length.unwrap_or(default_length);
        let nbr_peers = properties.nbr_peers;
        if let Some(kind) = DispatchKind::from_routing(properties.routing) {
            Queue::Dispatch(DispatchFifo::new(kind, length, nbr_peers))
        } else if let Some(mode) = CollectMode::from_routing(properties.routing) {
            Queue::Collect(CollectFifo::new(mode, length, nbr_peers))
        } else {
            Queue::Fanout(FanoutFifo::new(length, nbr_peers))
        }
    }

    /// Rebuild a queue from serialized state, choosing the discipline by `queuetype`
    pub fn from_state(state: Value) -> Result<Self, QueueError> {
        let queuetype = state
            .get("queuetype")
            .and_then(Value::as_str)
            .ok_or_else(|| QueueError::invalid_state("missing queuetype"))?
            .to_string();
        let mut queue = if queuetype == fanout::QUEUETYPE {
            Queue::Fanout(FanoutFifo::new(1, 1))
        } else if let Some(kind) = DispatchKind::from_queuetype(&queuetype) {
            Queue::Dispatch(DispatchFifo::new(kind, 1, 1))
        } else if let Some(mode) = CollectMode::from_queuetype(&queuetype) {
            Queue::Collect(CollectFifo::new(mode, 1, 1))
        } else {
            return Err(QueueError::invalid_state(format!("unknown queuetype {}", queuetype)));
        };
        queue.set_state(state)?;
        Ok(queue)
    }

    pub fn is_collect(&self) -> bool {
        matches!(self, Queue::Collect(_))
    }
}

impl TokenQueue for Queue {
    fn queuetype(&self) -> &'static str {
        delegate!(self, q => q.queuetype())
    }

    fn nbr_peers(&self) -> usize {
        delegate!(self, q => q.nbr_peers())
    }

    fn peers(&self) -> Vec<PortId> {
        delegate!(self, q => q.peers())
    }

    fn writers(&self) -> Vec<PortId> {
        delegate!(self, q => q.writers())
    }

    fn add_reader(&mut self, reader: &PortId, properties: &PortProperties) {
        delegate!(self, q => q.add_reader(reader, properties))
    }

    fn remove_reader(&mut self, reader: &PortId) -> bool {
        delegate!(self, q => q.remove_reader(reader))
    }

    fn add_writer(&mut self, writer: &PortId, properties: &PortProperties) {
        delegate!(self, q => q.add_writer(writer, properties))
    }

    fn remove_writer(&mut self, writer: &PortId) -> bool {
        delegate!(self, q => q.remove_writer(writer))
    }

    fn set_config(&mut self, config: &QueueConfig) -> Result<(), QueueError> {
        delegate!(self, q => q.set_config(config))
    }

    fn write(&mut self, token: Token, writer: Option<&PortId>) -> Result<(), QueueError> {
        delegate!(self, q => q.write(token, writer))
    }

    fn slots_available(&self, n: usize, peer: Option<&PortId>) -> bool {
        delegate!(self, q => q.slots_available(n, peer))
    }

    fn tokens_available(&self, n: usize, peer: Option<&PortId>) -> bool {
        delegate!(self, q => q.tokens_available(n, peer))
    }

    fn peek(&mut self, peer: Option<&PortId>) -> Result<Token, QueueError> {
        delegate!(self, q => q.peek(peer))
    }

    fn commit(&mut self, peer: Option<&PortId>) -> Result<bool, QueueError> {
        delegate!(self, q => q.commit(peer))
    }

    fn cancel(&mut self, peer: Option<&PortId>) -> Result<(), QueueError> {
        delegate!(self, q => q.cancel(peer))
    }

    fn com_write(&mut self, token: Token, writer: &PortId, seq: u64) -> Result<ComResult, QueueError> {
        delegate!(self, q => q.com_write(token, writer, seq))
    }

    fn com_peek(&mut self, reader: &PortId) -> Result<(u64, Token), QueueError> {
        delegate!(self, q => q.com_peek(reader))
    }

    fn com_commit(&mut self, reader: &PortId, seq: u64) -> Result<ComResult, QueueError> {
        delegate!(self, q => q.com_commit(reader, seq))
    }

    fn com_cancel(&mut self, reader: &PortId, seq: u64) -> Result<ComResult, QueueError> {
        delegate!(self, q => q.com_cancel(reader, seq))
    }

    fn com_is_committed(&self, reader: &PortId) -> bool {
        delegate!(self, q => q.com_is_committed(reader))
    }

    fn exhaust(&mut self, peer: &PortId, terminate: Disconnect) -> Vec<(u64, Token)> {
        delegate!(self, q => q.exhaust(peer, terminate))
    }

    fn set_exhausted_tokens(&mut self, tokens: &ExhaustedTokens) -> usize {
        delegate!(self, q => q.set_exhausted_tokens(tokens))
    }

    fn is_exhausting(&self, peer: Option<&PortId>) -> bool {
        delegate!(self, q => q.is_exhausting(peer))
    }

    fn writer_position(&self, writer: &PortId) -> Option<u64> {
        delegate!(self, q => q.writer_position(writer))
    }

    fn reader_position(&self, reader: &PortId) -> Option<u64> {
        delegate!(self, q => q.reader_position(reader))
    }

    fn discard_one(&mut self, reader: &PortId) -> bool {
        delegate!(self, q => q.discard_one(reader))
    }

    fn state(&self, remap: Option<&PeerRemap>) -> Result<Value, QueueError> {
        delegate!(self, q => q.state(remap))
    }

    fn set_state(&mut self, state: Value) -> Result<(), QueueError> {
        delegate!(self, q => q.set_state(state))
    }
}
