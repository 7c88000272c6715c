//! Cursor algebra shared by every queue discipline
//!
//! Positions grow monotonically; only ring access uses `pos % N`. A ring of
//! `N` slots holds at most `N - 1` unread tokens so that full and empty are
//! told apart by `write - read` alone.
//!
//! ```text
//!   read        tentative        write
//!    │ committed  │   peeked       │  free (N - 1 - (write - read))
//! ───┴────────────┴────────────────┴──────────────►
//! ```

use crate::error::QueueError;
use flow_types::Token;
use serde::{Deserialize, Serialize};

/// Outcome of a sequence-numbered queue operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComResult {
    /// Applied now
    Handled,
    /// Already applied earlier; safe to acknowledge again
    Unhandled,
    /// Out of range; state untouched
    Invalid,
}

/// Fixed ring of token slots addressed by absolute position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub(crate) struct Ring {
    slots: Vec<Option<Token>>,
}

impl Ring {
    pub fn new(n: usize) -> Self {
        Self {
            slots: vec![None; n.max(2)],
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn get(&self, pos: u64) -> Option<&Token> {
        let n = self.slots.len() as u64;
        self.slots[(pos % n) as usize].as_ref()
    }

    pub fn put(&mut self, pos: u64, token: Token) {
        let n = self.slots.len() as u64;
        self.slots[(pos % n) as usize] = Some(token);
    }

    /// Same shape with every payload dropped
    pub fn cleared(&self) -> Self {
        Self::new(self.slots.len())
    }
}

/// One peer's FIFO: a ring plus its cursor triple
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct PeerFifo {
    pub ring: Ring,
    pub write: u64,
    pub read: u64,
    pub tentative: u64,
}

impl PeerFifo {
    pub fn new(n: usize) -> Self {
        Self {
            ring: Ring::new(n),
            write: 0,
            read: 0,
            tentative: 0,
        }
    }

    fn capacity(&self) -> u64 {
        self.ring.len() as u64 - 1
    }

    pub fn free_slots(&self) -> u64 {
        self.capacity().saturating_sub(self.write - self.read)
    }

    /// Tokens not yet peeked
    pub fn unread(&self) -> u64 {
        self.write - self.tentative
    }

    /// Tokens not yet committed
    pub fn uncommitted(&self) -> u64 {
        self.write - self.read
    }

    pub fn push(&mut self, token: Token) -> Result<(), QueueError> {
        if self.free_slots() == 0 {
            return Err(QueueError::Full);
        }
        self.ring.put(self.write, token);
        self.write += 1;
        Ok(())
    }

    /// Token at the tentative cursor without advancing
    pub fn front(&self) -> Option<&Token> {
        if self.unread() == 0 {
            return None;
        }
        self.ring.get(self.tentative)
    }

    pub fn peek(&mut self) -> Option<Token> {
        let token = self.front()?.clone();
        self.tentative += 1;
        Some(token)
    }

    /// Undo the most recent peek
    pub fn unpeek(&mut self) {
        if self.tentative > self.read {
            self.tentative -= 1;
        }
    }

    pub fn commit(&mut self) {
        self.read = self.tentative;
    }

    pub fn cancel(&mut self) {
        self.tentative = self.read;
    }

    pub fn com_write(&mut self, token: Token, seq: u64) -> Result<ComResult, QueueError> {
        if seq == self.write {
            self.push(token)?;
            Ok(ComResult::Handled)
        } else if seq < self.write {
            Ok(ComResult::Unhandled)
        } else {
            Ok(ComResult::Invalid)
        }
    }

    pub fn com_peek(&mut self) -> Option<(u64, Token)> {
        let seq = self.tentative;
        self.peek().map(|token| (seq, token))
    }

    /// Commit exactly the oldest peeked token when `seq` names it
    pub fn com_commit(&mut self, seq: u64) -> ComResult {
        if seq >= self.tentative {
            return ComResult::Invalid;
        }
        if self.read < self.tentative && seq == self.read {
            self.read += 1;
            ComResult::Handled
        } else {
            ComResult::Unhandled
        }
    }

    /// Roll the tentative cursor back to `seq`
    pub fn com_cancel(&mut self, seq: u64) -> ComResult {
        if seq >= self.tentative || seq < self.read {
            return ComResult::Invalid;
        }
        self.tentative = seq;
        ComResult::Handled
    }

    pub fn is_committed(&self) -> bool {
        self.tentative == self.read
    }

    /// Uncommitted tokens as `(position, token)` pairs
    pub fn pending(&self) -> Vec<(u64, Token)> {
        (self.read..self.write)
            .filter_map(|pos| self.ring.get(pos).map(|t| (pos, t.clone())))
            .collect()
    }

    /// Same ring size, cursors reset, payloads dropped
    pub fn reset(&self) -> Self {
        Self {
            ring: self.ring.cleared(),
            write: 0,
            read: 0,
            tentative: 0,
        }
    }

    pub fn check(&self) -> Result<(), QueueError> {
        if self.read <= self.tentative && self.tentative <= self.write && self.write - self.read < self.ring.len() as u64 {
            Ok(())
        } else {
            Err(QueueError::invalid_state(format!(
                "cursor order violated: read {} tentative {} write {}",
                self.read, self.tentative, self.write
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_reserves_one_slot() {
        let mut fifo = PeerFifo::new(5);
        for i in 0..4 {
            fifo.push(Token::new(i)).unwrap();
        }
        assert_eq!(fifo.push(Token::new(4)), Err(QueueError::Full));
        assert_eq!(fifo.peek(), Some(Token::new(0)));
        fifo.commit();
        assert_eq!(fifo.free_slots(), 1);
        fifo.push(Token::new(4)).unwrap();
    }

    #[test]
    fn test_com_commit_only_at_read_boundary() {
        let mut fifo = PeerFifo::new(5);
        fifo.push(Token::new("a")).unwrap();
        fifo.push(Token::new("b")).unwrap();
        assert_eq!(fifo.com_commit(0), ComResult::Invalid);
        fifo.com_peek();
        fifo.com_peek();
        assert_eq!(fifo.com_commit(1), ComResult::Unhandled);
        assert_eq!(fifo.com_commit(0), ComResult::Handled);
        assert_eq!(fifo.com_commit(0), ComResult::Unhandled);
        assert_eq!(fifo.com_commit(1), ComResult::Handled);
        assert!(fifo.is_committed());
    }

    #[test]
    fn test_com_cancel_range() {
        let mut fifo = PeerFifo::new(5);
        for i in 0..3 {
            fifo.push(Token::new(i)).unwrap();
            fifo.com_peek();
        }
        assert_eq!(fifo.com_cancel(3), ComResult::Invalid);
        assert_eq!(fifo.com_cancel(1), ComResult::Handled);
        assert_eq!(fifo.tentative, 1);
        assert_eq!(fifo.com_peek(), Some((1, Token::new(1))));
    }

    #[test]
    fn test_com_write_idempotent() {
        let mut fifo = PeerFifo::new(5);
        assert_eq!(fifo.com_write(Token::new("a"), 0), Ok(ComResult::Handled));
        assert_eq!(fifo.com_write(Token::new("a"), 0), Ok(ComResult::Unhandled));
        assert_eq!(fifo.com_write(Token::new("c"), 2), Ok(ComResult::Invalid));
        assert_eq!(fifo.write, 1);
    }
}
