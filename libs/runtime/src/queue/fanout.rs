//! Single-ring fan-out FIFO
//!
//! Every reader sees the same stream. One ring is shared; each reader keeps
//! its own `read`/`tentative` cursors plus the `offset` at which it joined,
//! so a reader's sequence numbers always start at zero. Writers (the peers
//! feeding an in-port) are tracked by how many tokens each has delivered,
//! which is what makes sequence-numbered writes idempotent.
//!
//! With no readers attached the ring keeps the newest `N - 1` tokens; a
//! reader added later starts at the oldest of them.

use super::fifo::{ComResult, Ring};
use super::{remap_id, PeerRemap, QueueConfig, Termination, TokenQueue};
use crate::error::QueueError;
use flow_codec::ExhaustedTokens;
use flow_types::{Disconnect, PortId, PortProperties, Token};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use tracing::{debug, warn};

pub const QUEUETYPE: &str = "fanout_fifo";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ReaderCursor {
    read: u64,
    tentative: u64,
    offset: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FanoutFifo {
    ring: Ring,
    nbr_peers: usize,
    write_pos: u64,
    readers: Vec<PortId>,
    cursors: HashMap<PortId, ReaderCursor>,
    writers: BTreeMap<PortId, u64>,
    exhausting: BTreeMap<PortId, Termination>,
    backlog: VecDeque<Token>,
}

#[derive(Debug, Serialize, Deserialize)]
struct FanoutState {
    queuetype: String,
    #[serde(rename = "N")]
    n: usize,
    nbr_peers: usize,
    fifo: Ring,
    readers: Vec<PortId>,
    write_pos: u64,
    read_pos: BTreeMap<PortId, u64>,
    tentative_read_pos: BTreeMap<PortId, u64>,
    #[serde(default)]
    offset: BTreeMap<PortId, u64>,
    #[serde(default)]
    writers: BTreeMap<PortId, u64>,
    #[serde(default)]
    exhausting: BTreeMap<PortId, Termination>,
    #[serde(default)]
    backlog: Vec<Token>,
}

impl FanoutFifo {
    /// Queue holding `length` tokens per reader (ring of `length + 1`)
    pub fn new(length: usize, nbr_peers: usize) -> Self {
        Self {
            ring: Ring::new(length + 1),
            nbr_peers,
            write_pos: 0,
            readers: Vec::new(),
            cursors: HashMap::new(),
            writers: BTreeMap::new(),
            exhausting: BTreeMap::new(),
            backlog: VecDeque::new(),
        }
    }

    fn capacity(&self) -> u64 {
        self.ring.len() as u64 - 1
    }

    /// Oldest position still held by the ring
    fn floor(&self) -> u64 {
        self.write_pos.saturating_sub(self.capacity())
    }

    fn free_slots(&self) -> u64 {
        match self.cursors.values().map(|c| c.read).min() {
            Some(read) => self.capacity().saturating_sub(self.write_pos - read),
            None => self.capacity(),
        }
    }

    /// Resolve an omitted reader when exactly one is attached
    fn reader_key(&self, peer: Option<&PortId>) -> Result<PortId, QueueError> {
        match peer {
            Some(p) if self.cursors.contains_key(p) => Ok(p.clone()),
            Some(p) => Err(QueueError::unknown_peer(p, QUEUETYPE)),
            None if self.readers.len() == 1 => Ok(self.readers[0].clone()),
            None => Err(QueueError::empty(None)),
        }
    }

    fn put(&mut self, token: Token) {
        self.ring.put(self.write_pos, token);
        self.write_pos += 1;
    }

    fn drain_backlog(&mut self) {
        while !self.backlog.is_empty() && self.free_slots() > 0 {
            if let Some(token) = self.backlog.pop_front() {
                self.put(token);
            }
        }
    }

    /// Forget exhausting writers once every reader has consumed everything
    fn reap_exhausted(&mut self) -> bool {
        if self.exhausting.is_empty() || !self.backlog.is_empty() {
            return false;
        }
        let drained = self.cursors.values().all(|c| c.read == self.write_pos);
        if !drained {
            return false;
        }
        let done: Vec<PortId> = self
            .exhausting
            .iter()
            .filter(|(_, t)| t.got_tokens)
            .map(|(w, _)| w.clone())
            .collect();
        for writer in &done {
            debug!(writer = %writer, "Exhausted writer drained, removing");
            self.exhausting.remove(writer);
            self.writers.remove(writer);
        }
        !done.is_empty()
    }

    fn cursor_mut(&mut self, reader: &PortId) -> Result<&mut ReaderCursor, QueueError> {
        self.cursors
            .get_mut(reader)
            .ok_or_else(|| QueueError::unknown_peer(reader, QUEUETYPE))
    }
}

impl TokenQueue for FanoutFifo {
    fn queuetype(&self) -> &'static str {
        QUEUETYPE
    }

    fn nbr_peers(&self) -> usize {
        self.nbr_peers
    }

    fn peers(&self) -> Vec<PortId> {
        self.readers.clone()
    }

    fn writers(&self) -> Vec<PortId> {
        self.writers.keys().cloned().collect()
    }

    fn add_reader(&mut self, reader: &PortId, _properties: &PortProperties) {
        if !self.cursors.contains_key(reader) {
            let floor = self.floor();
            self.cursors.insert(
                reader.clone(),
                ReaderCursor {
                    read: floor,
                    tentative: floor,
                    offset: floor,
                },
            );
            self.readers.push(reader.clone());
        }
        if self.readers.len() > self.nbr_peers {
            debug!(reader = %reader, "Reader count exceeds nbr_peers, raising");
            self.nbr_peers = self.readers.len();
        }
        self.drain_backlog();
    }

    fn remove_reader(&mut self, reader: &PortId) -> bool {
        if self.cursors.remove(reader).is_none() {
            return false;
        }
        self.readers.retain(|r| r != reader);
        self.nbr_peers = self.nbr_peers.saturating_sub(1);
        self.drain_backlog();
        true
    }

    fn add_writer(&mut self, writer: &PortId, _properties: &PortProperties) {
        self.writers.entry(writer.clone()).or_insert(0);
    }

    fn remove_writer(&mut self, writer: &PortId) -> bool {
        self.exhausting.remove(writer);
        self.writers.remove(writer).is_some()
    }

    fn set_config(&mut self, config: &QueueConfig) -> Result<(), QueueError> {
        if config.is_empty() {
            Ok(())
        } else {
            Err(QueueError::invalid_config("fanout queue takes no port-order or port-mapping"))
        }
    }

    fn write(&mut self, token: Token, writer: Option<&PortId>) -> Result<(), QueueError> {
        if !self.slots_available(1, None) {
            return Err(QueueError::Full);
        }
        self.put(token);
        if let Some(writer) = writer {
            *self.writers.entry(writer.clone()).or_insert(0) += 1;
        }
        Ok(())
    }

    fn slots_available(&self, n: usize, _peer: Option<&PortId>) -> bool {
        self.backlog.is_empty() && self.free_slots() >= n as u64
    }

    fn tokens_available(&self, n: usize, peer: Option<&PortId>) -> bool {
        self.reader_key(peer)
            .ok()
            .and_then(|r| self.cursors.get(&r))
            .map(|c| self.write_pos - c.tentative >= n as u64)
            .unwrap_or(false)
    }

    fn peek(&mut self, peer: Option<&PortId>) -> Result<Token, QueueError> {
        let reader = self.reader_key(peer)?;
        let write_pos = self.write_pos;
        let tentative = self.cursor_mut(&reader)?.tentative;
        if tentative >= write_pos {
            return Err(QueueError::empty(Some(&reader)));
        }
        let token = self
            .ring
            .get(tentative)
            .cloned()
            .ok_or_else(|| QueueError::invalid_state(format!("empty slot at position {}", tentative)))?;
        self.cursor_mut(&reader)?.tentative = tentative + 1;
        Ok(token)
    }

    fn commit(&mut self, peer: Option<&PortId>) -> Result<bool, QueueError> {
        let reader = self.reader_key(peer)?;
        let cursor = self.cursor_mut(&reader)?;
        cursor.read = cursor.tentative;
        self.drain_backlog();
        Ok(self.reap_exhausted())
    }

    fn cancel(&mut self, peer: Option<&PortId>) -> Result<(), QueueError> {
        let reader = self.reader_key(peer)?;
        let cursor = self.cursor_mut(&reader)?;
        cursor.tentative = cursor.read;
        Ok(())
    }

    fn com_write(&mut self, token: Token, writer: &PortId, seq: u64) -> Result<ComResult, QueueError> {
        let expected = *self
            .writers
            .get(writer)
            .ok_or_else(|| QueueError::unknown_peer(writer, QUEUETYPE))?;
        if seq == expected {
            self.write(token, Some(writer))?;
            Ok(ComResult::Handled)
        } else if seq < expected {
            Ok(ComResult::Unhandled)
        } else {
            Ok(ComResult::Invalid)
        }
    }

    fn com_peek(&mut self, reader: &PortId) -> Result<(u64, Token), QueueError> {
        let cursor = *self
            .cursors
            .get(reader)
            .ok_or_else(|| QueueError::unknown_peer(reader, QUEUETYPE))?;
        let token = self.peek(Some(reader))?;
        Ok((cursor.tentative - cursor.offset, token))
    }

    fn com_commit(&mut self, reader: &PortId, seq: u64) -> Result<ComResult, QueueError> {
        let cursor = self.cursor_mut(reader)?;
        let pos = seq + cursor.offset;
        if pos >= cursor.tentative {
            return Ok(ComResult::Invalid);
        }
        if cursor.read < cursor.tentative && pos == cursor.read {
            cursor.read += 1;
            self.drain_backlog();
            self.reap_exhausted();
            Ok(ComResult::Handled)
        } else {
            Ok(ComResult::Unhandled)
        }
    }

    fn com_cancel(&mut self, reader: &PortId, seq: u64) -> Result<ComResult, QueueError> {
        let cursor = self.cursor_mut(reader)?;
        let pos = seq + cursor.offset;
        if pos >= cursor.tentative || pos < cursor.read {
            return Ok(ComResult::Invalid);
        }
        cursor.tentative = pos;
        Ok(ComResult::Handled)
    }

    fn com_is_committed(&self, reader: &PortId) -> bool {
        self.cursors
            .get(reader)
            .map(|c| c.read == c.tentative)
            .unwrap_or(true)
    }

    fn exhaust(&mut self, peer: &PortId, terminate: Disconnect) -> Vec<(u64, Token)> {
        debug!(peer = %peer, ?terminate, "Exhausting fanout peer");
        if let Some(cursor) = self.cursors.get(peer).copied() {
            let tokens = if terminate.hands_over_tokens() {
                (cursor.read..self.write_pos)
                    .filter_map(|pos| self.ring.get(pos).map(|t| (pos - cursor.offset, t.clone())))
                    .collect()
            } else {
                Vec::new()
            };
            self.remove_reader(peer);
            return tokens;
        }
        if self.writers.contains_key(peer) {
            if terminate.keeps_draining() {
                self.exhausting.insert(
                    peer.clone(),
                    Termination {
                        kind: terminate,
                        got_tokens: false,
                    },
                );
            } else {
                self.remove_writer(peer);
            }
        }
        Vec::new()
    }

    fn set_exhausted_tokens(&mut self, tokens: &ExhaustedTokens) -> usize {
        for (writer, list) in tokens {
            let mut expected = match self.writers.get(writer) {
                Some(next) => *next,
                None => list.first().map(|(seq, _)| *seq).unwrap_or(0),
            };
            for (seq, token) in list {
                if *seq < expected {
                    continue;
                }
                if *seq > expected {
                    warn!(writer = %writer, expected, seq, "Gap in exhausted tokens");
                }
                self.backlog.push_back(token.clone());
                expected = seq + 1;
            }
            self.writers.insert(writer.clone(), expected);
            if let Some(termination) = self.exhausting.get_mut(writer) {
                termination.got_tokens = true;
            }
        }
        self.drain_backlog();
        self.nbr_peers
    }

    fn is_exhausting(&self, peer: Option<&PortId>) -> bool {
        match peer {
            Some(p) => self.exhausting.contains_key(p),
            None => !self.exhausting.is_empty(),
        }
    }

    fn writer_position(&self, writer: &PortId) -> Option<u64> {
        self.writers.get(writer).copied()
    }

    fn reader_position(&self, reader: &PortId) -> Option<u64> {
        self.cursors.get(reader).map(|c| c.read - c.offset)
    }

    fn discard_one(&mut self, reader: &PortId) -> bool {
        let write_pos = self.write_pos;
        match self.cursors.get_mut(reader) {
            Some(cursor) if cursor.read < write_pos => {
                cursor.read += 1;
                cursor.tentative = cursor.tentative.max(cursor.read);
                self.drain_backlog();
                true
            }
            _ => false,
        }
    }

    fn state(&self, remap: Option<&PeerRemap>) -> Result<Value, QueueError> {
        let rename = |id: &PortId| remap_id(remap, id);
        let reset = remap.is_some();
        let position = |v: u64| if reset { 0 } else { v };

        let state = FanoutState {
            queuetype: QUEUETYPE.to_string(),
            n: self.ring.len(),
            nbr_peers: self.nbr_peers,
            fifo: if reset { self.ring.cleared() } else { self.ring.clone() },
            readers: self.readers.iter().map(rename).collect(),
            write_pos: position(self.write_pos),
            read_pos: self.cursors.iter().map(|(r, c)| (rename(r), position(c.read))).collect(),
            tentative_read_pos: self
                .cursors
                .iter()
                .map(|(r, c)| (rename(r), position(c.tentative)))
                .collect(),
            offset: self.cursors.iter().map(|(r, c)| (rename(r), position(c.offset))).collect(),
            writers: self.writers.iter().map(|(w, s)| (rename(w), position(*s))).collect(),
            exhausting: if reset { BTreeMap::new() } else { self.exhausting.clone() },
            backlog: if reset { Vec::new() } else { self.backlog.iter().cloned().collect() },
        };
        serde_json::to_value(state).map_err(|e| QueueError::invalid_state(e.to_string()))
    }

    fn set_state(&mut self, state: Value) -> Result<(), QueueError> {
        let state: FanoutState =
            serde_json::from_value(state).map_err(|e| QueueError::invalid_state(e.to_string()))?;
        if state.queuetype != QUEUETYPE {
            return Err(QueueError::invalid_state(format!("expected {}, got {}", QUEUETYPE, state.queuetype)));
        }
        if state.fifo.len() != state.n {
            return Err(QueueError::invalid_state("fifo length differs from N"));
        }

        let mut cursors = HashMap::new();
        for reader in &state.readers {
            let read = state.read_pos.get(reader).copied().unwrap_or(0);
            let tentative = state.tentative_read_pos.get(reader).copied().unwrap_or(read);
            let offset = state.offset.get(reader).copied().unwrap_or(0);
            if !(read <= tentative && tentative <= state.write_pos && state.write_pos - read < state.n as u64) {
                return Err(QueueError::invalid_state(format!("cursor order violated for {}", reader)));
            }
            cursors.insert(reader.clone(), ReaderCursor { read, tentative, offset });
        }

        self.ring = state.fifo;
        self.nbr_peers = state.nbr_peers.max(state.readers.len());
        self.write_pos = state.write_pos;
        self.readers = state.readers;
        self.cursors = cursors;
        self.writers = state.writers;
        self.exhausting = state.exhausting;
        self.backlog = state.backlog.into();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid(s: &str) -> PortId {
        PortId::from(s)
    }

    fn props() -> PortProperties {
        PortProperties::outport()
    }

    fn queue_with_reader(reader: &str) -> FanoutFifo {
        let mut queue = FanoutFifo::new(4, 1);
        queue.add_reader(&pid(reader), &props());
        queue
    }

    #[test]
    fn test_capacity_four_then_full() {
        let mut queue = queue_with_reader("r1");
        for v in ["a", "b", "c", "d"] {
            queue.write(Token::new(v), None).unwrap();
        }
        assert!(!queue.slots_available(1, None));
        assert_eq!(queue.write(Token::new("e"), None), Err(QueueError::Full));

        assert_eq!(queue.peek(None).unwrap(), Token::new("a"));
        queue.commit(None).unwrap();
        assert!(queue.slots_available(1, None));
        queue.write(Token::new("e"), None).unwrap();
        assert!(!queue.slots_available(1, None));
    }

    #[test]
    fn test_every_reader_sees_every_token() {
        let mut queue = FanoutFifo::new(4, 2);
        queue.add_reader(&pid("r1"), &props());
        queue.add_reader(&pid("r2"), &props());
        queue.write(Token::new(1), None).unwrap();
        queue.write(Token::new(2), None).unwrap();

        assert_eq!(queue.peek(Some(&pid("r1"))).unwrap(), Token::new(1));
        assert_eq!(queue.peek(Some(&pid("r1"))).unwrap(), Token::new(2));
        assert!(queue.peek(Some(&pid("r1"))).is_err());
        assert_eq!(queue.peek(Some(&pid("r2"))).unwrap(), Token::new(1));

        queue.cancel(Some(&pid("r1"))).unwrap();
        assert_eq!(queue.peek(Some(&pid("r1"))).unwrap(), Token::new(1));
    }

    #[test]
    fn test_slowest_reader_bounds_capacity() {
        let mut queue = FanoutFifo::new(2, 2);
        queue.add_reader(&pid("fast"), &props());
        queue.add_reader(&pid("slow"), &props());
        queue.write(Token::new(1), None).unwrap();
        queue.write(Token::new(2), None).unwrap();
        queue.peek(Some(&pid("fast"))).unwrap();
        queue.commit(Some(&pid("fast"))).unwrap();
        assert!(!queue.slots_available(1, None));
        queue.peek(Some(&pid("slow"))).unwrap();
        queue.commit(Some(&pid("slow"))).unwrap();
        assert!(queue.slots_available(1, None));
    }

    #[test]
    fn test_no_readers_keeps_newest_and_late_reader_starts_at_oldest() {
        let mut queue = FanoutFifo::new(2, 1);
        for i in 0..5 {
            queue.write(Token::new(i), None).unwrap();
        }
        queue.add_reader(&pid("late"), &props());
        assert_eq!(queue.com_peek(&pid("late")).unwrap(), (0, Token::new(3)));
        assert_eq!(queue.com_peek(&pid("late")).unwrap(), (1, Token::new(4)));
        assert!(queue.peek(None).is_err());
    }

    #[test]
    fn test_com_write_per_writer_sequence() {
        let mut queue = queue_with_reader("in");
        queue.add_writer(&pid("w1"), &props());
        queue.add_writer(&pid("w2"), &props());

        assert_eq!(queue.com_write(Token::new("a"), &pid("w1"), 0), Ok(ComResult::Handled));
        assert_eq!(queue.com_write(Token::new("x"), &pid("w2"), 0), Ok(ComResult::Handled));
        assert_eq!(queue.com_write(Token::new("a"), &pid("w1"), 0), Ok(ComResult::Unhandled));
        assert_eq!(queue.com_write(Token::new("c"), &pid("w1"), 2), Ok(ComResult::Invalid));
        assert_eq!(queue.writer_position(&pid("w1")), Some(1));
        assert!(queue.com_write(Token::new("z"), &pid("nobody"), 0).is_err());

        assert_eq!(queue.peek(None).unwrap(), Token::new("a"));
        assert_eq!(queue.peek(None).unwrap(), Token::new("x"));
        assert!(queue.peek(None).is_err());
    }

    #[test]
    fn test_exhaust_reader_returns_uncommitted_in_order() {
        let mut queue = queue_with_reader("peer-x");
        for i in 0..4 {
            queue.write(Token::new(i), None).unwrap();
        }
        queue.com_peek(&pid("peer-x")).unwrap();
        queue.com_commit(&pid("peer-x"), 0).unwrap();
        queue.com_peek(&pid("peer-x")).unwrap();

        let tokens = queue.exhaust(&pid("peer-x"), Disconnect::ExhaustOutport);
        assert_eq!(
            tokens,
            vec![(1, Token::new(1)), (2, Token::new(2)), (3, Token::new(3))]
        );
        assert!(queue.peers().is_empty());
        assert!(queue.exhaust(&pid("peer-x"), Disconnect::ExhaustOutport).is_empty());
    }

    #[test]
    fn test_exhaust_terminate_drops_tokens() {
        let mut queue = queue_with_reader("peer-x");
        queue.write(Token::new(1), None).unwrap();
        assert!(queue.exhaust(&pid("peer-x"), Disconnect::Terminate).is_empty());
        assert!(queue.peers().is_empty());
    }

    #[test]
    fn test_exhausted_tokens_fold_once_and_drain_writer() {
        let mut queue = queue_with_reader("in");
        queue.add_writer(&pid("out"), &props());
        queue.com_write(Token::new("t0"), &pid("out"), 0).unwrap();
        assert!(queue.exhaust(&pid("out"), Disconnect::ExhaustPeerRecv).is_empty());
        assert!(queue.is_exhausting(Some(&pid("out"))));

        let mut salvaged = ExhaustedTokens::new();
        salvaged.insert(
            pid("out"),
            vec![(0, Token::new("t0")), (1, Token::new("t1")), (2, Token::new("t2"))],
        );
        queue.set_exhausted_tokens(&salvaged);
        queue.set_exhausted_tokens(&salvaged);
        assert_eq!(queue.writer_position(&pid("out")), Some(3));

        let mut seen = Vec::new();
        while let Ok(token) = queue.peek(None) {
            seen.push(token);
        }
        assert_eq!(seen, vec![Token::new("t0"), Token::new("t1"), Token::new("t2")]);
        assert!(queue.commit(None).unwrap());
        assert!(!queue.is_exhausting(None));
        assert!(queue.writers().is_empty());
    }

    #[test]
    fn test_exhausted_tokens_overflow_into_backlog() {
        let mut queue = FanoutFifo::new(2, 1);
        queue.add_reader(&pid("in"), &props());
        let mut salvaged = ExhaustedTokens::new();
        salvaged.insert(pid("out"), (0..4).map(|i| (i, Token::new(i))).collect());
        queue.set_exhausted_tokens(&salvaged);

        assert!(!queue.slots_available(1, None));
        let mut seen = Vec::new();
        for _ in 0..4 {
            seen.push(queue.peek(None).unwrap());
            queue.commit(None).unwrap();
        }
        assert_eq!(seen, (0..4).map(Token::new).collect::<Vec<_>>());
        assert!(queue.slots_available(1, None));
    }

    #[test]
    fn test_state_round_trip_keeps_tentative() {
        let mut queue = queue_with_reader("r1");
        for i in 0..3 {
            queue.write(Token::new(i), None).unwrap();
        }
        queue.peek(None).unwrap();
        queue.commit(None).unwrap();
        queue.peek(None).unwrap();

        let mut restored = FanoutFifo::new(4, 1);
        restored.set_state(queue.state(None).unwrap()).unwrap();
        assert_eq!(restored, queue);
        assert_eq!(restored.peek(None).unwrap(), Token::new(2));
        restored.cancel(None).unwrap();
        assert_eq!(restored.peek(None).unwrap(), Token::new(1));
    }

    #[test]
    fn test_remap_state_resets() {
        let mut queue = queue_with_reader("old");
        queue.write(Token::new(1), None).unwrap();
        let mut remap = PeerRemap::new();
        remap.insert(pid("old"), pid("new"));

        let state = queue.state(Some(&remap)).unwrap();
        assert_eq!(state["write_pos"], serde_json::json!(0));
        let mut restored = FanoutFifo::new(4, 1);
        restored.set_state(state).unwrap();
        assert_eq!(restored.peers(), vec![pid("new")]);
        assert!(!restored.tokens_available(1, Some(&pid("new"))));
    }
}
