//! Dispatch FIFOs: one token to exactly one reader
//!
//! Each reader owns a [`PeerFifo`]. Where a token goes depends on the kind:
//!
//! ```text
//! Ordered / RoundRobin   turn table, next reader = previous + 1 (mod k)
//! Random                 turn table filled with random reader indices
//! Balanced               reader with the most free slots
//! Mapped                 {selector: value} routed through port-mapping
//! ```
//!
//! The turn table is a ring of `N` reader indices parallel to the ring
//! size. Looking ahead at the next `n` entries answers `slots_available`
//! exactly, even for the random kind, because an entry is only redrawn
//! after the write that consumed it.

use super::fifo::{ComResult, PeerFifo};
use super::{remap_id, PeerRemap, QueueConfig, TokenQueue};
use crate::error::QueueError;
use flow_codec::ExhaustedTokens;
use flow_types::{Disconnect, PortId, PortProperties, Routing, Token};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, error};

/// Dispatch flavour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DispatchKind {
    Ordered,
    RoundRobin,
    Random,
    Balanced,
    Mapped,
}

impl DispatchKind {
    pub fn queuetype(&self) -> &'static str {
        match self {
            DispatchKind::Ordered => "dispatch:ordered",
            DispatchKind::RoundRobin => "scheduled_fifo:round-robin",
            DispatchKind::Random => "scheduled_fifo:random",
            DispatchKind::Balanced => "scheduled_fifo:balanced",
            DispatchKind::Mapped => "scheduled_fifo:dispatch-mapped",
        }
    }

    pub fn from_queuetype(queuetype: &str) -> Option<Self> {
        [
            DispatchKind::Ordered,
            DispatchKind::RoundRobin,
            DispatchKind::Random,
            DispatchKind::Balanced,
            DispatchKind::Mapped,
        ]
        .into_iter()
        .find(|k| k.queuetype() == queuetype)
    }

    pub fn from_routing(routing: Routing) -> Option<Self> {
        match routing {
            Routing::DispatchOrdered => Some(DispatchKind::Ordered),
            Routing::RoundRobin => Some(DispatchKind::RoundRobin),
            Routing::Random => Some(DispatchKind::Random),
            Routing::Balanced => Some(DispatchKind::Balanced),
            Routing::DispatchMapped => Some(DispatchKind::Mapped),
            _ => None,
        }
    }

    fn uses_turns(&self) -> bool {
        matches!(
            self,
            DispatchKind::Ordered | DispatchKind::RoundRobin | DispatchKind::Random
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DispatchFifo {
    kind: DispatchKind,
    n: usize,
    nbr_peers: usize,
    readers: Vec<PortId>,
    fifos: HashMap<PortId, PeerFifo>,
    turns: Vec<usize>,
    turn_pos: u64,
    is_ordered: bool,
    mapping: BTreeMap<String, PortId>,
}

#[derive(Debug, Serialize, Deserialize)]
struct DispatchState {
    queuetype: String,
    #[serde(rename = "N")]
    n: usize,
    nbr_peers: usize,
    readers: Vec<PortId>,
    fifo: BTreeMap<PortId, PeerFifo>,
    reader_turn: Vec<usize>,
    turn_pos: u64,
    #[serde(default)]
    is_ordered: bool,
    #[serde(default)]
    mapping: BTreeMap<String, PortId>,
}

impl DispatchFifo {
    pub fn new(kind: DispatchKind, length: usize, nbr_peers: usize) -> Self {
        let n = (length + 1).max(2);
        let mut queue = Self {
            kind,
            n,
            nbr_peers,
            readers: Vec::new(),
            fifos: HashMap::new(),
            turns: vec![0; n],
            turn_pos: 0,
            is_ordered: false,
            mapping: BTreeMap::new(),
        };
        queue.reset_turns();
        queue
    }

    pub fn kind(&self) -> DispatchKind {
        self.kind
    }

    fn turn_at(&self, pos: u64) -> usize {
        self.turns[(pos % self.n as u64) as usize]
    }

    /// Rebuild the turn table so the current turn's reader goes next
    fn reset_turns(&mut self) {
        let k = self.readers.len();
        if k == 0 {
            self.turns = vec![0; self.n];
        } else if self.kind == DispatchKind::Random {
            let mut rng = rand::thread_rng();
            self.turns = (0..self.n).map(|_| rng.gen_range(0..k)).collect();
        } else {
            let start = self.turn_at(self.turn_pos) % k;
            self.turns = (0..self.n).map(|i| (start + i) % k).collect();
        }
        self.turn_pos = 0;
    }

    /// Consume the current turn, redrawing its slot one lap ahead
    fn advance_turn(&mut self) {
        let k = self.readers.len().max(1);
        let idx = (self.turn_pos % self.n as u64) as usize;
        let prev = self.turns[(idx + self.n - 1) % self.n];
        self.turns[idx] = match self.kind {
            DispatchKind::Random => rand::thread_rng().gen_range(0..k),
            _ => (prev + 1) % k,
        };
        self.turn_pos += 1;
    }

    fn free(&self, reader: &PortId) -> u64 {
        self.fifos.get(reader).map(|f| f.free_slots()).unwrap_or(0)
    }

    /// Destination reader and stored token for a write
    fn route(&self, token: Token) -> Result<(PortId, Token), QueueError> {
        match self.kind {
            DispatchKind::Ordered | DispatchKind::RoundRobin | DispatchKind::Random => {
                let reader = self
                    .readers
                    .get(self.turn_at(self.turn_pos))
                    .ok_or(QueueError::Full)?;
                Ok((reader.clone(), token))
            }
            DispatchKind::Balanced => {
                let mut best: Option<(&PortId, u64)> = None;
                for reader in &self.readers {
                    let free = self.free(reader);
                    if best.map(|(_, f)| free > f).unwrap_or(true) {
                        best = Some((reader, free));
                    }
                }
                best.map(|(r, _)| (r.clone(), token)).ok_or(QueueError::Full)
            }
            DispatchKind::Mapped => {
                let (selector, inner) = match token.value() {
                    Value::Object(map) if map.len() == 1 => map
                        .iter()
                        .next()
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .ok_or_else(|| QueueError::invalid_token("empty selector mapping"))?,
                    _ => {
                        return Err(QueueError::invalid_token(
                            "dispatch-mapped token must be a single-entry {selector: value} mapping",
                        ))
                    }
                };
                let reader = self.mapping.get(&selector).ok_or_else(|| {
                    QueueError::invalid_token(format!("selector '{}' not in port-mapping", selector))
                })?;
                Ok((reader.clone(), token.with_value(inner)))
            }
        }
    }

    fn fifo_mut(&mut self, reader: &PortId) -> Result<&mut PeerFifo, QueueError> {
        let queuetype = self.kind.queuetype();
        self.fifos
            .get_mut(reader)
            .ok_or_else(|| QueueError::unknown_peer(reader, queuetype))
    }

    fn same_members<'a>(
        a: impl IntoIterator<Item = &'a PortId>,
        b: impl IntoIterator<Item = &'a PortId>,
    ) -> bool {
        a.into_iter().collect::<BTreeSet<_>>() == b.into_iter().collect::<BTreeSet<_>>()
    }
}

impl TokenQueue for DispatchFifo {
    fn queuetype(&self) -> &'static str {
        self.kind.queuetype()
    }

    fn nbr_peers(&self) -> usize {
        self.nbr_peers
    }

    fn peers(&self) -> Vec<PortId> {
        self.readers.clone()
    }

    fn writers(&self) -> Vec<PortId> {
        Vec::new()
    }

    fn add_reader(&mut self, reader: &PortId, _properties: &PortProperties) {
        if self.fifos.contains_key(reader) {
            return;
        }
        self.fifos.insert(reader.clone(), PeerFifo::new(self.n));
        self.readers.push(reader.clone());
        if !self.is_ordered {
            self.readers.sort();
        }
        if self.readers.len() > self.nbr_peers {
            debug!(reader = %reader, "Reader count exceeds nbr_peers, raising");
            self.nbr_peers = self.readers.len();
        }
        self.reset_turns();
    }

    fn remove_reader(&mut self, reader: &PortId) -> bool {
        if self.fifos.remove(reader).is_none() {
            return false;
        }
        self.readers.retain(|r| r != reader);
        self.mapping.retain(|_, r| r != reader);
        self.nbr_peers = self.nbr_peers.saturating_sub(1);
        self.reset_turns();
        true
    }

    fn add_writer(&mut self, _writer: &PortId, _properties: &PortProperties) {}

    fn remove_writer(&mut self, _writer: &PortId) -> bool {
        false
    }

    fn set_config(&mut self, config: &QueueConfig) -> Result<(), QueueError> {
        if let Some(order) = &config.port_order {
            if self.kind != DispatchKind::Ordered {
                return Err(QueueError::invalid_config(format!(
                    "port-order not supported by {}",
                    self.queuetype()
                )));
            }
            if order.len() != self.readers.len() || !Self::same_members(order, &self.readers) {
                return Err(QueueError::invalid_config("port-order must list exactly the connected readers"));
            }
            self.readers = order.clone();
            self.is_ordered = true;
            self.reset_turns();
        }
        if let Some(mapping) = &config.port_mapping {
            if self.kind != DispatchKind::Mapped {
                return Err(QueueError::invalid_config(format!(
                    "port-mapping not supported by {}",
                    self.queuetype()
                )));
            }
            if !Self::same_members(mapping.values(), &self.readers) {
                return Err(QueueError::invalid_config("port-mapping must cover exactly the connected readers"));
            }
            self.mapping = mapping.clone();
        }
        Ok(())
    }

    fn write(&mut self, token: Token, _writer: Option<&PortId>) -> Result<(), QueueError> {
        if self.kind.uses_turns() && !self.slots_available(1, None) {
            return Err(QueueError::Full);
        }
        let (reader, token) = self.route(token)?;
        self.fifo_mut(&reader)?.push(token)?;
        if self.kind.uses_turns() {
            self.advance_turn();
        }
        Ok(())
    }

    fn slots_available(&self, n: usize, peer: Option<&PortId>) -> bool {
        if n >= self.n {
            return false;
        }
        match self.kind {
            DispatchKind::Ordered | DispatchKind::RoundRobin | DispatchKind::Random => {
                let mut wanted: BTreeMap<usize, u64> = BTreeMap::new();
                for i in 0..n as u64 {
                    *wanted.entry(self.turn_at(self.turn_pos + i)).or_insert(0) += 1;
                }
                wanted.iter().all(|(idx, count)| {
                    self.readers
                        .get(*idx)
                        .map(|r| self.free(r) >= *count)
                        .unwrap_or(false)
                })
            }
            DispatchKind::Balanced => match peer {
                Some(p) => self.free(p) >= n as u64,
                None => self.readers.iter().map(|r| self.free(r)).sum::<u64>() >= n as u64,
            },
            DispatchKind::Mapped => match peer {
                Some(p) if self.fifos.contains_key(p) => self.free(p) >= n as u64,
                _ => self.readers.iter().all(|r| self.free(r) >= n as u64),
            },
        }
    }

    fn tokens_available(&self, n: usize, peer: Option<&PortId>) -> bool {
        peer.and_then(|p| self.fifos.get(p))
            .map(|f| f.unread() >= n as u64)
            .unwrap_or(false)
    }

    fn peek(&mut self, peer: Option<&PortId>) -> Result<Token, QueueError> {
        let reader = peer.ok_or_else(|| QueueError::empty(None))?;
        self.fifo_mut(reader)?
            .peek()
            .ok_or_else(|| QueueError::empty(Some(reader)))
    }

    fn commit(&mut self, peer: Option<&PortId>) -> Result<bool, QueueError> {
        let reader = peer.ok_or_else(|| QueueError::empty(None))?;
        self.fifo_mut(reader)?.commit();
        Ok(false)
    }

    fn cancel(&mut self, peer: Option<&PortId>) -> Result<(), QueueError> {
        let reader = peer.ok_or_else(|| QueueError::empty(None))?;
        self.fifo_mut(reader)?.cancel();
        Ok(())
    }

    fn com_write(&mut self, token: Token, _writer: &PortId, seq: u64) -> Result<ComResult, QueueError> {
        let (reader, token) = self.route(token)?;
        let result = self.fifo_mut(&reader)?.com_write(token, seq)?;
        if result == ComResult::Handled && self.kind.uses_turns() {
            self.advance_turn();
        }
        Ok(result)
    }

    fn com_peek(&mut self, reader: &PortId) -> Result<(u64, Token), QueueError> {
        self.fifo_mut(reader)?
            .com_peek()
            .ok_or_else(|| QueueError::empty(Some(reader)))
    }

    fn com_commit(&mut self, reader: &PortId, seq: u64) -> Result<ComResult, QueueError> {
        Ok(self.fifo_mut(reader)?.com_commit(seq))
    }

    fn com_cancel(&mut self, reader: &PortId, seq: u64) -> Result<ComResult, QueueError> {
        Ok(self.fifo_mut(reader)?.com_cancel(seq))
    }

    fn com_is_committed(&self, reader: &PortId) -> bool {
        self.fifos.get(reader).map(|f| f.is_committed()).unwrap_or(true)
    }

    fn exhaust(&mut self, peer: &PortId, terminate: Disconnect) -> Vec<(u64, Token)> {
        let tokens = match self.fifos.get(peer) {
            Some(fifo) if terminate.hands_over_tokens() => fifo.pending(),
            Some(_) => Vec::new(),
            None => return Vec::new(),
        };
        debug!(peer = %peer, ?terminate, handed_over = tokens.len(), "Exhausting dispatch reader");
        self.remove_reader(peer);
        tokens
    }

    fn set_exhausted_tokens(&mut self, tokens: &ExhaustedTokens) -> usize {
        if tokens.values().any(|list| !list.is_empty()) {
            error!(
                queuetype = self.queuetype(),
                writers = tokens.len(),
                "Dispatch queue cannot take exhausted tokens, dropping them"
            );
        }
        self.nbr_peers
    }

    fn is_exhausting(&self, _peer: Option<&PortId>) -> bool {
        false
    }

    fn writer_position(&self, _writer: &PortId) -> Option<u64> {
        None
    }

    fn reader_position(&self, reader: &PortId) -> Option<u64> {
        self.fifos.get(reader).map(|f| f.read)
    }

    fn discard_one(&mut self, reader: &PortId) -> bool {
        match self.fifos.get_mut(reader) {
            Some(fifo) if fifo.read < fifo.write => {
                fifo.read += 1;
                fifo.tentative = fifo.tentative.max(fifo.read);
                true
            }
            _ => false,
        }
    }

    fn state(&self, remap: Option<&PeerRemap>) -> Result<Value, QueueError> {
        let rename = |id: &PortId| remap_id(remap, id);
        let mut readers: Vec<PortId> = self.readers.iter().map(rename).collect();
        if remap.is_some() && !self.is_ordered {
            readers.sort();
        }
        let state = DispatchState {
            queuetype: self.queuetype().to_string(),
            n: self.n,
            nbr_peers: self.nbr_peers,
            readers,
            fifo: self
                .fifos
                .iter()
                .map(|(r, f)| (rename(r), if remap.is_some() { f.reset() } else { f.clone() }))
                .collect(),
            reader_turn: self.turns.clone(),
            turn_pos: if remap.is_some() { 0 } else { self.turn_pos },
            is_ordered: self.is_ordered,
            mapping: self.mapping.iter().map(|(k, r)| (k.clone(), rename(r))).collect(),
        };
        serde_json::to_value(state).map_err(|e| QueueError::invalid_state(e.to_string()))
    }

    fn set_state(&mut self, state: Value) -> Result<(), QueueError> {
        let state: DispatchState =
            serde_json::from_value(state).map_err(|e| QueueError::invalid_state(e.to_string()))?;
        let kind = DispatchKind::from_queuetype(&state.queuetype)
            .ok_or_else(|| QueueError::invalid_state(format!("not a dispatch queue: {}", state.queuetype)))?;
        if state.reader_turn.len() != state.n {
            return Err(QueueError::invalid_state("reader_turn length differs from N"));
        }
        if !Self::same_members(state.fifo.keys(), &state.readers) {
            return Err(QueueError::invalid_state("fifo keys differ from readers"));
        }
        for fifo in state.fifo.values() {
            fifo.check()?;
            if fifo.ring.len() != state.n {
                return Err(QueueError::invalid_state("fifo length differs from N"));
            }
        }

        self.kind = kind;
        self.n = state.n;
        self.nbr_peers = state.nbr_peers.max(state.readers.len());
        self.readers = state.readers;
        self.fifos = state.fifo.into_iter().collect();
        self.turns = state.reader_turn;
        self.turn_pos = state.turn_pos;
        self.is_ordered = state.is_ordered;
        self.mapping = state.mapping;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pid(s: &str) -> PortId {
        PortId::from(s)
    }

    fn queue(kind: DispatchKind, length: usize, readers: &[&str]) -> DispatchFifo {
        let mut queue = DispatchFifo::new(kind, length, readers.len());
        for r in readers {
            queue.add_reader(&pid(r), &PortProperties::inport());
        }
        queue
    }

    fn drain(queue: &mut DispatchFifo, reader: &str) -> Vec<Token> {
        let mut out = Vec::new();
        while let Ok(token) = queue.peek(Some(&pid(reader))) {
            out.push(token);
        }
        queue.commit(Some(&pid(reader))).unwrap();
        out
    }

    #[test]
    fn test_round_robin_alternates() {
        let mut queue = queue(DispatchKind::RoundRobin, 4, &["r1", "r2"]);
        for v in ["t1", "t2", "t3", "t4"] {
            queue.write(Token::new(v), None).unwrap();
        }
        assert_eq!(drain(&mut queue, "r1"), vec![Token::new("t1"), Token::new("t3")]);
        assert_eq!(drain(&mut queue, "r2"), vec![Token::new("t2"), Token::new("t4")]);
    }

    #[test]
    fn test_round_robin_full_when_next_reader_full() {
        let mut queue = queue(DispatchKind::RoundRobin, 1, &["r1", "r2"]);
        queue.write(Token::new(1), None).unwrap();
        queue.write(Token::new(2), None).unwrap();
        assert!(!queue.slots_available(1, None));
        assert_eq!(queue.write(Token::new(3), None), Err(QueueError::Full));

        drain(&mut queue, "r2");
        assert!(!queue.slots_available(1, None));
        drain(&mut queue, "r1");
        assert!(queue.slots_available(1, None));
    }

    #[test]
    fn test_slots_available_lookahead() {
        let queue = queue(DispatchKind::RoundRobin, 4, &["r1", "r2"]);
        assert!(queue.slots_available(4, None));
        assert!(!queue.slots_available(5, None));
    }

    #[test]
    fn test_no_readers_means_full() {
        let mut queue = DispatchFifo::new(DispatchKind::RoundRobin, 4, 2);
        assert!(!queue.slots_available(1, None));
        assert_eq!(queue.write(Token::new(1), None), Err(QueueError::Full));
    }

    #[test]
    fn test_random_lookahead_predicts_destination() {
        let mut queue = queue(DispatchKind::Random, 2, &["r1", "r2", "r3"]);
        for i in 0..50 {
            let next = queue.readers[queue.turn_at(queue.turn_pos)].clone();
            let free_before = queue.free(&next);
            assert_eq!(queue.slots_available(1, None), free_before > 0);
            if queue.write(Token::new(i), None).is_err() {
                drain(&mut queue, next.as_str());
            }
        }
    }

    #[test]
    fn test_balanced_picks_most_free() {
        let mut queue = queue(DispatchKind::Balanced, 2, &["r1", "r2"]);
        queue.write(Token::new(1), None).unwrap();
        queue.write(Token::new(2), None).unwrap();
        queue.write(Token::new(3), None).unwrap();
        assert_eq!(drain(&mut queue, "r1"), vec![Token::new(1), Token::new(3)]);
        assert_eq!(drain(&mut queue, "r2"), vec![Token::new(2)]);
        assert!(queue.slots_available(1, Some(&pid("r2"))));
    }

    #[test]
    fn test_mapped_routes_by_selector() {
        let mut queue = queue(DispatchKind::Mapped, 4, &["pa", "pb"]);
        let mapping: BTreeMap<String, PortId> =
            [("a".to_string(), pid("pa")), ("b".to_string(), pid("pb"))].into_iter().collect();
        queue
            .set_config(&QueueConfig {
                port_order: None,
                port_mapping: Some(mapping),
            })
            .unwrap();

        queue.write(Token::new(json!({"a": 1})), None).unwrap();
        queue.write(Token::new(json!({"b": 2})), None).unwrap();
        assert_eq!(drain(&mut queue, "pa"), vec![Token::new(1)]);
        assert_eq!(drain(&mut queue, "pb"), vec![Token::new(2)]);

        assert!(matches!(
            queue.write(Token::new(json!({"c": 3})), None),
            Err(QueueError::InvalidToken { .. })
        ));
        assert!(matches!(
            queue.write(Token::new(7), None),
            Err(QueueError::InvalidToken { .. })
        ));
    }

    #[test]
    fn test_port_mapping_must_match_readers() {
        let mut queue = queue(DispatchKind::Mapped, 4, &["pa", "pb"]);
        let mapping: BTreeMap<String, PortId> = [("a".to_string(), pid("pa"))].into_iter().collect();
        assert!(queue
            .set_config(&QueueConfig {
                port_order: None,
                port_mapping: Some(mapping),
            })
            .is_err());
    }

    #[test]
    fn test_port_order_sets_rotation() {
        let mut queue = queue(DispatchKind::Ordered, 4, &["a", "b", "c"]);
        queue
            .set_config(&QueueConfig {
                port_order: Some(vec![pid("c"), pid("a"), pid("b")]),
                port_mapping: None,
            })
            .unwrap();
        for i in 0..3 {
            queue.write(Token::new(i), None).unwrap();
        }
        assert_eq!(drain(&mut queue, "c"), vec![Token::new(0)]);
        assert_eq!(drain(&mut queue, "a"), vec![Token::new(1)]);
        assert_eq!(drain(&mut queue, "b"), vec![Token::new(2)]);
    }

    #[test]
    fn test_exhaust_outport_hands_over_pending() {
        let mut queue = queue(DispatchKind::RoundRobin, 4, &["r1", "r2"]);
        for i in 0..4 {
            queue.write(Token::new(i), None).unwrap();
        }
        queue.com_peek(&pid("r1")).unwrap();
        queue.com_commit(&pid("r1"), 0).unwrap();
        let tokens = queue.exhaust(&pid("r1"), Disconnect::ExhaustOutport);
        assert_eq!(tokens, vec![(1, Token::new(2))]);
        assert_eq!(queue.peers(), vec![pid("r2")]);
        assert_eq!(queue.nbr_peers(), 1);
    }

    #[test]
    fn test_rotation_continues_after_reader_removed() {
        let mut queue = queue(DispatchKind::RoundRobin, 4, &["a", "b", "c"]);
        queue.write(Token::new(0), None).unwrap();
        queue.remove_reader(&pid("c"));
        queue.write(Token::new(1), None).unwrap();
        queue.write(Token::new(2), None).unwrap();
        assert_eq!(drain(&mut queue, "a"), vec![Token::new(0), Token::new(2)]);
        assert_eq!(drain(&mut queue, "b"), vec![Token::new(1)]);
    }

    #[test]
    fn test_state_round_trip() {
        let mut queue = queue(DispatchKind::RoundRobin, 4, &["r1", "r2"]);
        for i in 0..3 {
            queue.write(Token::new(i), None).unwrap();
        }
        queue.peek(Some(&pid("r1"))).unwrap();

        let mut restored = DispatchFifo::new(DispatchKind::RoundRobin, 4, 0);
        restored.set_state(queue.state(None).unwrap()).unwrap();
        assert_eq!(restored, queue);
        restored.write(Token::new(3), None).unwrap();
        assert_eq!(drain(&mut restored, "r2"), vec![Token::new(1), Token::new(3)]);
    }
}
