//! Collect FIFOs: many writers into one reader
//!
//! One [`PeerFifo`] per writer, writers kept sorted. The reader side merges:
//!
//! - `Synced` (collect-all-tagged): one token from every writer, combined
//!   into `{tag: value}` (or a list when tags come from port-order)
//! - `Any` (collect-any-tagged): whatever writers have data, combined
//! - `Tagged`: rotate over writers, wrap each value as `{tag: value}`
//! - `Unordered`: rotate over writers, values as-is
//!
//! An exception from any writer is delivered on its own, tagged, and the
//! other writers' tokens peeked in the same round are put back.
//!
//! Writers being exhausted stay attached until their folded-in tokens have
//! been consumed; `commit` reports when such a writer was dropped so the
//! port can finish the disconnect.

use super::fifo::{ComResult, PeerFifo};
use super::{remap_id, PeerRemap, QueueConfig, Termination, TokenQueue};
use crate::error::QueueError;
use flow_codec::ExhaustedTokens;
use flow_types::{Disconnect, PortId, PortProperties, Routing, Token};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt;
use tracing::{debug, warn};

/// Merge discipline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CollectMode {
    Synced,
    Any,
    Tagged,
    Unordered,
}

impl CollectMode {
    pub fn queuetype(&self) -> &'static str {
        match self {
            CollectMode::Synced => "collect:all-tagged",
            CollectMode::Any => "collect:any-tagged",
            CollectMode::Tagged => "collect:tagged",
            CollectMode::Unordered => "collect:unordered",
        }
    }

    pub fn from_queuetype(queuetype: &str) -> Option<Self> {
        [
            CollectMode::Synced,
            CollectMode::Any,
            CollectMode::Tagged,
            CollectMode::Unordered,
        ]
        .into_iter()
        .find(|m| m.queuetype() == queuetype)
    }

    pub fn from_routing(routing: Routing) -> Option<Self> {
        match routing {
            Routing::CollectAllTagged => Some(CollectMode::Synced),
            Routing::CollectAnyTagged => Some(CollectMode::Any),
            Routing::CollectTagged => Some(CollectMode::Tagged),
            Routing::CollectUnordered => Some(CollectMode::Unordered),
            _ => None,
        }
    }
}

/// Writer tag: a name, or a position when set from port-order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Tag {
    Index(usize),
    Name(String),
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tag::Index(i) => write!(f, "{}", i),
            Tag::Name(name) => f.write_str(name),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CollectFifo {
    mode: CollectMode,
    n: usize,
    nbr_peers: usize,
    reader: Option<PortId>,
    writers: Vec<PortId>,
    fifos: HashMap<PortId, PeerFifo>,
    tags: HashMap<PortId, Tag>,
    tags_are_ordering: bool,
    turn_pos: usize,
    peek_turn_pos: Option<usize>,
    termination: BTreeMap<PortId, Termination>,
    backlog: HashMap<PortId, VecDeque<Token>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CollectState {
    queuetype: String,
    #[serde(rename = "N")]
    n: usize,
    nbr_peers: usize,
    #[serde(default)]
    reader: Option<PortId>,
    writers: Vec<PortId>,
    fifo: BTreeMap<PortId, PeerFifo>,
    tags: BTreeMap<PortId, Tag>,
    #[serde(rename = "tags-are-ordering", default)]
    tags_are_ordering: bool,
    turn_pos: usize,
    #[serde(default)]
    termination: BTreeMap<PortId, Termination>,
    #[serde(default)]
    backlog: BTreeMap<PortId, Vec<Token>>,
}

impl CollectFifo {
    pub fn new(mode: CollectMode, length: usize, nbr_peers: usize) -> Self {
        Self {
            mode,
            n: (length + 1).max(2),
            nbr_peers,
            reader: None,
            writers: Vec::new(),
            fifos: HashMap::new(),
            tags: HashMap::new(),
            tags_are_ordering: false,
            turn_pos: 0,
            peek_turn_pos: None,
            termination: BTreeMap::new(),
            backlog: HashMap::new(),
        }
    }

    pub fn mode(&self) -> CollectMode {
        self.mode
    }

    fn tag_of(&self, writer: &PortId) -> Tag {
        self.tags
            .get(writer)
            .cloned()
            .unwrap_or_else(|| Tag::Name(writer.to_string()))
    }

    fn tagged(&self, writer: &PortId, value: &Value) -> Value {
        let mut map = Map::new();
        map.insert(self.tag_of(writer).to_string(), value.clone());
        Value::Object(map)
    }

    fn unread(&self, writer: &PortId) -> u64 {
        self.fifos.get(writer).map(|f| f.unread()).unwrap_or(0)
    }

    /// Next sequence number expected from a writer
    fn expected_seq(&self, writer: &PortId) -> u64 {
        let written = self.fifos.get(writer).map(|f| f.write).unwrap_or(0);
        written + self.backlog.get(writer).map(|b| b.len() as u64).unwrap_or(0)
    }

    fn drain_backlogs(&mut self) {
        for (writer, pending) in self.backlog.iter_mut() {
            if let Some(fifo) = self.fifos.get_mut(writer) {
                while fifo.free_slots() > 0 {
                    match pending.pop_front() {
                        Some(token) => {
                            let _ = fifo.push(token);
                        }
                        None => break,
                    }
                }
            }
        }
        self.backlog.retain(|_, pending| !pending.is_empty());
    }

    /// Drop exhausted writers whose tokens have all been consumed
    fn reap_exhausted(&mut self) -> bool {
        let done: Vec<PortId> = self
            .termination
            .iter()
            .filter(|(writer, t)| {
                t.kind.keeps_draining()
                    && t.got_tokens
                    && self.fifos.get(*writer).map(|f| f.uncommitted() == 0).unwrap_or(true)
                    && !self.backlog.contains_key(*writer)
            })
            .map(|(w, _)| w.clone())
            .collect();
        for writer in &done {
            debug!(writer = %writer, "Exhausted writer drained, removing");
            self.remove_writer(writer);
        }
        !done.is_empty()
    }

    /// Combine one token per listed writer into a new token, or isolate the
    /// first exception
    fn combine(&mut self, writers: &[PortId]) -> Result<Token, QueueError> {
        let mut advanced: Vec<PortId> = Vec::new();
        let mut values: Vec<(PortId, Token)> = Vec::new();
        for writer in writers {
            let token = match self.fifos.get_mut(writer).and_then(|f| f.peek()) {
                Some(token) => token,
                None => continue,
            };
            if token.is_exception() {
                for earlier in &advanced {
                    if let Some(fifo) = self.fifos.get_mut(earlier) {
                        fifo.unpeek();
                    }
                }
                let tagged = self.tagged(writer, token.value());
                return Ok(token.with_value(tagged));
            }
            advanced.push(writer.clone());
            values.push((writer.clone(), token));
        }

        if values.is_empty() {
            return Err(QueueError::empty(self.reader.as_ref()));
        }

        let value = if self.tags_are_ordering && self.mode == CollectMode::Synced {
            let mut ordered: Vec<(usize, Value)> = values
                .iter()
                .map(|(w, t)| match self.tag_of(w) {
                    Tag::Index(i) => (i, t.value().clone()),
                    Tag::Name(_) => (usize::MAX, t.value().clone()),
                })
                .collect();
            ordered.sort_by_key(|(i, _)| *i);
            Value::Array(ordered.into_iter().map(|(_, v)| v).collect())
        } else {
            let mut map = Map::new();
            for (writer, token) in &values {
                map.insert(self.tag_of(writer).to_string(), token.value().clone());
            }
            Value::Object(map)
        };
        Ok(Token::new(value))
    }

    fn same_members<'a>(
        a: impl IntoIterator<Item = &'a PortId>,
        b: impl IntoIterator<Item = &'a PortId>,
    ) -> bool {
        a.into_iter().collect::<BTreeSet<_>>() == b.into_iter().collect::<BTreeSet<_>>()
    }
}

impl TokenQueue for CollectFifo {
    fn queuetype(&self) -> &'static str {
        self.mode.queuetype()
    }

    fn nbr_peers(&self) -> usize {
        self.nbr_peers
    }

    fn peers(&self) -> Vec<PortId> {
        self.writers.clone()
    }

    fn writers(&self) -> Vec<PortId> {
        self.writers.clone()
    }

    fn add_reader(&mut self, reader: &PortId, _properties: &PortProperties) {
        self.reader = Some(reader.clone());
    }

    fn remove_reader(&mut self, reader: &PortId) -> bool {
        if self.reader.as_ref() == Some(reader) {
            self.reader = None;
            true
        } else {
            false
        }
    }

    fn add_writer(&mut self, writer: &PortId, properties: &PortProperties) {
        if !self.fifos.contains_key(writer) {
            self.fifos.insert(writer.clone(), PeerFifo::new(self.n));
            self.writers.push(writer.clone());
            self.writers.sort();
            if self.writers.len() > self.nbr_peers {
                debug!(writer = %writer, "Writer count exceeds nbr_peers, raising");
                self.nbr_peers = self.writers.len();
            }
        }
        if !self.tags.contains_key(writer) {
            let tag = properties
                .tag
                .clone()
                .unwrap_or_else(|| writer.to_string());
            self.tags.insert(writer.clone(), Tag::Name(tag));
        }
    }

    fn remove_writer(&mut self, writer: &PortId) -> bool {
        if self.fifos.remove(writer).is_none() {
            return false;
        }
        self.writers.retain(|w| w != writer);
        self.tags.remove(writer);
        self.termination.remove(writer);
        self.backlog.remove(writer);
        self.nbr_peers = self.nbr_peers.saturating_sub(1);
        if self.writers.is_empty() {
            self.turn_pos = 0;
        } else {
            self.turn_pos %= self.writers.len();
        }
        true
    }

    fn set_config(&mut self, config: &QueueConfig) -> Result<(), QueueError> {
        if let Some(order) = &config.port_order {
            if order.len() != self.writers.len() || !Self::same_members(order, &self.writers) {
                return Err(QueueError::invalid_config("port-order must list exactly the connected writers"));
            }
            self.tags = order
                .iter()
                .enumerate()
                .map(|(i, w)| (w.clone(), Tag::Index(i)))
                .collect();
            self.tags_are_ordering = true;
        }
        if let Some(mapping) = &config.port_mapping {
            if !Self::same_members(mapping.values(), &self.writers) {
                return Err(QueueError::invalid_config("port-mapping must cover exactly the connected writers"));
            }
            self.tags = mapping
                .iter()
                .map(|(tag, w)| (w.clone(), Tag::Name(tag.clone())))
                .collect();
            self.tags_are_ordering = false;
        }
        Ok(())
    }

    fn write(&mut self, token: Token, writer: Option<&PortId>) -> Result<(), QueueError> {
        let writer = writer.ok_or_else(|| QueueError::invalid_token("collect queue write needs a writer"))?;
        if self.backlog.contains_key(writer) {
            return Err(QueueError::Full);
        }
        let queuetype = self.queuetype();
        self.fifos
            .get_mut(writer)
            .ok_or_else(|| QueueError::unknown_peer(writer, queuetype))?
            .push(token)
    }

    fn slots_available(&self, n: usize, peer: Option<&PortId>) -> bool {
        if n >= self.n {
            return false;
        }
        let has_room = |w: &PortId| {
            !self.backlog.contains_key(w)
                && self.fifos.get(w).map(|f| f.free_slots() >= n as u64).unwrap_or(false)
        };
        match peer {
            Some(writer) => has_room(writer),
            None => self.writers.iter().all(has_room),
        }
    }

    fn tokens_available(&self, n: usize, _peer: Option<&PortId>) -> bool {
        if n >= self.n || self.writers.is_empty() {
            return false;
        }
        let n = n as u64;
        match self.mode {
            CollectMode::Synced => self.writers.iter().all(|w| self.unread(w) >= n),
            CollectMode::Any => self.writers.iter().any(|w| self.unread(w) >= n),
            CollectMode::Tagged | CollectMode::Unordered => {
                self.writers.iter().map(|w| self.unread(w)).sum::<u64>() >= n
            }
        }
    }

    fn peek(&mut self, _peer: Option<&PortId>) -> Result<Token, QueueError> {
        match self.mode {
            CollectMode::Synced => {
                if !self.tokens_available(1, None) {
                    return Err(QueueError::empty(self.reader.as_ref()));
                }
                let writers = self.writers.clone();
                self.combine(&writers)
            }
            CollectMode::Any => {
                let writers: Vec<PortId> = self
                    .writers
                    .iter()
                    .filter(|w| self.unread(w) > 0)
                    .cloned()
                    .collect();
                self.combine(&writers)
            }
            CollectMode::Tagged | CollectMode::Unordered => {
                let count = self.writers.len();
                for step in 0..count {
                    let idx = (self.turn_pos + step) % count;
                    let writer = self.writers[idx].clone();
                    let token = match self.fifos.get_mut(&writer).and_then(|f| f.peek()) {
                        Some(token) => token,
                        None => continue,
                    };
                    if self.peek_turn_pos.is_none() {
                        self.peek_turn_pos = Some(self.turn_pos);
                    }
                    self.turn_pos = (idx + 1) % count;
                    return Ok(match self.mode {
                        CollectMode::Tagged => {
                            let tagged = self.tagged(&writer, token.value());
                            token.with_value(tagged)
                        }
                        _ => token,
                    });
                }
                Err(QueueError::empty(self.reader.as_ref()))
            }
        }
    }

    fn commit(&mut self, _peer: Option<&PortId>) -> Result<bool, QueueError> {
        for fifo in self.fifos.values_mut() {
            fifo.commit();
        }
        self.peek_turn_pos = None;
        self.drain_backlogs();
        Ok(self.reap_exhausted())
    }

    fn cancel(&mut self, _peer: Option<&PortId>) -> Result<(), QueueError> {
        for fifo in self.fifos.values_mut() {
            fifo.cancel();
        }
        if let Some(pos) = self.peek_turn_pos.take() {
            self.turn_pos = pos;
        }
        Ok(())
    }

    fn com_write(&mut self, token: Token, writer: &PortId, seq: u64) -> Result<ComResult, QueueError> {
        if !self.fifos.contains_key(writer) {
            return Err(QueueError::unknown_peer(writer, self.queuetype()));
        }
        let expected = self.expected_seq(writer);
        if seq == expected {
            self.write(token, Some(writer))?;
            Ok(ComResult::Handled)
        } else if seq < expected {
            Ok(ComResult::Unhandled)
        } else {
            Ok(ComResult::Invalid)
        }
    }

    fn com_peek(&mut self, _reader: &PortId) -> Result<(u64, Token), QueueError> {
        Err(QueueError::unsupported("com_peek", self.queuetype()))
    }

    fn com_commit(&mut self, _reader: &PortId, _seq: u64) -> Result<ComResult, QueueError> {
        Err(QueueError::unsupported("com_commit", self.queuetype()))
    }

    fn com_cancel(&mut self, _reader: &PortId, _seq: u64) -> Result<ComResult, QueueError> {
        Err(QueueError::unsupported("com_cancel", self.queuetype()))
    }

    fn com_is_committed(&self, _reader: &PortId) -> bool {
        true
    }

    fn exhaust(&mut self, peer: &PortId, terminate: Disconnect) -> Vec<(u64, Token)> {
        if !self.fifos.contains_key(peer) {
            return Vec::new();
        }
        debug!(writer = %peer, ?terminate, "Exhausting collect writer");
        if terminate.keeps_draining() {
            let got_tokens = self.termination.get(peer).map(|t| t.got_tokens).unwrap_or(false);
            self.termination.insert(
                peer.clone(),
                Termination {
                    kind: terminate,
                    got_tokens,
                },
            );
        } else {
            self.remove_writer(peer);
        }
        Vec::new()
    }

    fn set_exhausted_tokens(&mut self, tokens: &ExhaustedTokens) -> usize {
        for (writer, list) in tokens {
            if !self.fifos.contains_key(writer) {
                debug!(writer = %writer, "Exhausted tokens from unknown writer, attaching");
                self.add_writer(writer, &PortProperties::inport());
                if let (Some(fifo), Some((first, _))) = (self.fifos.get_mut(writer), list.first()) {
                    fifo.write = *first;
                    fifo.read = *first;
                    fifo.tentative = *first;
                }
            }
            self.termination
                .entry(writer.clone())
                .and_modify(|t| t.got_tokens = true)
                .or_insert(Termination {
                    kind: Disconnect::ExhaustPeerRecv,
                    got_tokens: true,
                });

            let mut expected = self.expected_seq(writer);
            for (seq, token) in list {
                if *seq < expected {
                    continue;
                }
                if *seq > expected {
                    warn!(writer = %writer, expected, seq, "Gap in exhausted tokens");
                }
                self.backlog
                    .entry(writer.clone())
                    .or_default()
                    .push_back(token.clone());
                expected = seq + 1;
            }
        }
        self.drain_backlogs();
        self.nbr_peers
    }

    fn is_exhausting(&self, peer: Option<&PortId>) -> bool {
        match peer {
            Some(p) => self.termination.contains_key(p),
            None => !self.termination.is_empty(),
        }
    }

    fn writer_position(&self, writer: &PortId) -> Option<u64> {
        self.fifos.contains_key(writer).then(|| self.expected_seq(writer))
    }

    fn reader_position(&self, _reader: &PortId) -> Option<u64> {
        None
    }

    fn discard_one(&mut self, _reader: &PortId) -> bool {
        false
    }

    fn state(&self, remap: Option<&PeerRemap>) -> Result<Value, QueueError> {
        let rename = |id: &PortId| remap_id(remap, id);
        let reset = remap.is_some();
        let mut writers: Vec<PortId> = self.writers.iter().map(rename).collect();
        writers.sort();
        let state = CollectState {
            queuetype: self.queuetype().to_string(),
            n: self.n,
            nbr_peers: self.nbr_peers,
            reader: self.reader.as_ref().map(rename),
            writers,
            fifo: self
                .fifos
                .iter()
                .map(|(w, f)| (rename(w), if reset { f.reset() } else { f.clone() }))
                .collect(),
            tags: self.tags.iter().map(|(w, t)| (rename(w), t.clone())).collect(),
            tags_are_ordering: self.tags_are_ordering,
            turn_pos: if reset { 0 } else { self.turn_pos },
            termination: if reset { BTreeMap::new() } else { self.termination.clone() },
            backlog: if reset {
                BTreeMap::new()
            } else {
                self.backlog
                    .iter()
                    .map(|(w, b)| (w.clone(), b.iter().cloned().collect()))
                    .collect()
            },
        };
        serde_json::to_value(state).map_err(|e| QueueError::invalid_state(e.to_string()))
    }

    fn set_state(&mut self, state: Value) -> Result<(), QueueError> {
        let state: CollectState =
            serde_json::from_value(state).map_err(|e| QueueError::invalid_state(e.to_string()))?;
        let mode = CollectMode::from_queuetype(&state.queuetype)
            .ok_or_else(|| QueueError::invalid_state(format!("not a collect queue: {}", state.queuetype)))?;
        if !Self::same_members(state.fifo.keys(), &state.writers) {
            return Err(QueueError::invalid_state("fifo keys differ from writers"));
        }
        for fifo in state.fifo.values() {
            fifo.check()?;
            if fifo.ring.len() != state.n {
                return Err(QueueError::invalid_state("fifo length differs from N"));
            }
        }

        self.mode = mode;
        self.n = state.n;
        self.nbr_peers = state.nbr_peers.max(state.writers.len());
        self.reader = state.reader;
        self.turn_pos = if state.writers.is_empty() {
            0
        } else {
            state.turn_pos % state.writers.len()
        };
        self.writers = state.writers;
        self.fifos = state.fifo.into_iter().collect();
        self.tags = state.tags.into_iter().collect();
        self.tags_are_ordering = state.tags_are_ordering;
        self.peek_turn_pos = None;
        self.termination = state.termination;
        self.backlog = state
            .backlog
            .into_iter()
            .filter(|(_, b)| !b.is_empty())
            .map(|(w, b)| (w, b.into()))
            .collect();
        Ok(())
    }
}
