//! Tunnel endpoints and the token delivery protocol
//!
//! ```text
//!  TunnelOut                                   TunnelIn
//!  com_peek(seq) ── TOKEN{seq, token} ───────► com_write(seq)
//!                                               seq == expected → write, ACK
//!                                               seq <  expected → ACK (duplicate)
//!                                               otherwise       → NACK
//!  com_commit   ◄─ TOKEN_REPLY{seq, ACK} ───
//!  com_cancel   ◄─ TOKEN_REPLY{seq, NACK} ──   (queue full or gap)
//! ```
//!
//! In bulk mode every available token is sent in one pass. A NACK switches
//! to throttled mode: one token per pass, no earlier than `time_cont`, with
//! the backoff doubling up to a cap. The first ACK restores bulk mode.

use crate::endpoint::Wake;
use crate::error::QueueError;
use crate::metrics::EndpointMetrics;
use crate::queue::{ComResult, Queue, TokenQueue};
use flow_codec::{TokenAck, TokenMessage};
use flow_network::TransportError;
use flow_types::{NodeId, PortId, Token};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Outgoing half of the token tunnel, as seen by an endpoint
pub trait TokenSender {
    fn send_token(&mut self, peer: &NodeId, message: TokenMessage) -> Result<(), TransportError>;
}

#[derive(Debug)]
pub struct TunnelInEndpoint {
    pub(crate) port_id: PortId,
    pub(crate) peer_port_id: PortId,
    pub(crate) peer_node: NodeId,
    metrics: Arc<EndpointMetrics>,
}

impl TunnelInEndpoint {
    pub fn new(port_id: PortId, peer_port_id: PortId, peer_node: NodeId, metrics: Arc<EndpointMetrics>) -> Self {
        Self {
            port_id,
            peer_port_id,
            peer_node,
            metrics,
        }
    }

    /// Apply an incoming token; returns the reply and whether the
    /// scheduler should run
    pub fn recv_token(&self, queue: &mut Queue, seq: u64, token: Token) -> (TokenAck, Wake) {
        match queue.com_write(token, &self.peer_port_id, seq) {
            Ok(ComResult::Handled) => {
                self.metrics.record_received();
                trace!(port_id = %self.port_id, peer = %self.peer_port_id, seq, "Token received");
                (TokenAck::Ack, Wake::Now)
            }
            Ok(ComResult::Unhandled) => {
                self.metrics.record_duplicate();
                debug!(port_id = %self.port_id, peer = %self.peer_port_id, seq, "Duplicate token acked");
                (TokenAck::Ack, Wake::Idle)
            }
            Ok(ComResult::Invalid) => {
                debug!(
                    port_id = %self.port_id,
                    peer = %self.peer_port_id,
                    seq,
                    expected = ?queue.writer_position(&self.peer_port_id),
                    "Sequence gap"
                );
                (TokenAck::Nack, Wake::Idle)
            }
            Err(QueueError::Full) => (TokenAck::Nack, Wake::Idle),
            Err(e) => {
                warn!(port_id = %self.port_id, peer = %self.peer_port_id, seq, error = %e, "Token rejected");
                (TokenAck::Nack, Wake::Idle)
            }
        }
    }
}

#[derive(Debug)]
pub struct TunnelOutEndpoint {
    pub(crate) port_id: PortId,
    pub(crate) peer_port_id: PortId,
    pub(crate) peer_node: NodeId,
    bulk: bool,
    backoff: Duration,
    backoff_initial: Duration,
    backoff_max: Duration,
    time_cont: Option<Instant>,
    /// Acked but not yet committed, ascending
    acked: Vec<u64>,
    /// One past the highest sequence number sent
    sent: u64,
    metrics: Arc<EndpointMetrics>,
}

impl TunnelOutEndpoint {
    pub fn new(
        port_id: PortId,
        peer_port_id: PortId,
        peer_node: NodeId,
        backoff_initial: Duration,
        backoff_max: Duration,
        metrics: Arc<EndpointMetrics>,
    ) -> Self {
        Self {
            port_id,
            peer_port_id,
            peer_node,
            bulk: true,
            backoff: Duration::ZERO,
            backoff_initial,
            backoff_max,
            time_cont: None,
            acked: Vec::new(),
            sent: 0,
            metrics,
        }
    }

    pub fn is_bulk(&self) -> bool {
        self.bulk
    }

    pub fn backoff(&self) -> Duration {
        self.backoff
    }

    fn due(&self, now: Instant) -> bool {
        self.time_cont.map_or(true, |t| t <= now)
    }

    /// Send what the mode allows. Returns progress and when to come back.
    pub fn communicate(&mut self, queue: &mut Queue, sender: &mut dyn TokenSender, now: Instant) -> (bool, Wake) {
        let peer = self.peer_port_id.clone();
        if self.bulk {
            let mut progress = false;
            while queue.tokens_available(1, Some(&peer)) {
                if !self.send_one(queue, sender) {
                    break;
                }
                progress = true;
            }
            return (progress, Wake::Idle);
        }

        if queue.tokens_available(1, Some(&peer)) && queue.com_is_committed(&peer) && self.due(now) {
            if self.send_one(queue, sender) {
                let next = now + self.backoff;
                self.time_cont = Some(next);
                return (true, Wake::At(next));
            }
        }
        (false, Wake::Idle)
    }

    fn send_one(&mut self, queue: &mut Queue, sender: &mut dyn TokenSender) -> bool {
        let (seq, token) = match queue.com_peek(&self.peer_port_id) {
            Ok(peeked) => peeked,
            Err(_) => return false,
        };
        let message = TokenMessage::Token {
            port_id: self.port_id.clone(),
            peer_port_id: self.peer_port_id.clone(),
            sequencenbr: seq,
            token,
        };
        match sender.send_token(&self.peer_node, message) {
            Ok(()) => {
                self.sent = seq + 1;
                self.metrics.record_sent();
                trace!(port_id = %self.port_id, peer = %self.peer_port_id, seq, "Token sent");
                true
            }
            Err(e) => {
                debug!(port_id = %self.port_id, peer_node = %self.peer_node, error = %e, "Token send failed");
                let _ = queue.com_cancel(&self.peer_port_id, seq);
                false
            }
        }
    }

    /// Handle a `TOKEN_REPLY`
    pub fn reply(&mut self, queue: &mut Queue, seq: u64, ack: TokenAck, now: Instant) -> Wake {
        match ack {
            TokenAck::Ack => {
                self.bulk = true;
                self.backoff = Duration::ZERO;
                self.metrics.record_ack();
                let read = queue.reader_position(&self.peer_port_id).unwrap_or(0);
                if seq >= read {
                    if let Err(i) = self.acked.binary_search(&seq) {
                        self.acked.insert(i, seq);
                    }
                }
                self.flush_acked(queue);
                Wake::Now
            }
            TokenAck::Nack => {
                if self.bulk {
                    self.time_cont = Some(now);
                }
                let wake = if self.due(now) { Wake::Now } else { Wake::Idle };
                self.bulk = false;
                self.backoff = if self.backoff < self.backoff_initial {
                    self.backoff_initial
                } else {
                    (self.backoff * 2).min(self.backoff_max)
                };
                self.acked.retain(|n| *n < seq);
                let rolled_back = match queue.com_cancel(&self.peer_port_id, seq) {
                    Ok(ComResult::Handled) => {
                        let rolled = self.sent.saturating_sub(seq);
                        self.sent = seq;
                        rolled
                    }
                    _ => 0,
                };
                self.metrics.record_nack(rolled_back);
                debug!(
                    port_id = %self.port_id,
                    peer = %self.peer_port_id,
                    seq,
                    backoff_ms = self.backoff.as_millis() as u64,
                    "Token nacked, throttling"
                );
                wake
            }
            TokenAck::Abort => {
                warn!(port_id = %self.port_id, peer = %self.peer_port_id, seq, "Peer aborted token, awaiting rewiring");
                Wake::Idle
            }
        }
    }

    fn flush_acked(&mut self, queue: &mut Queue) {
        while let Some(&first) = self.acked.first() {
            let read = queue.reader_position(&self.peer_port_id).unwrap_or(0);
            if first < read {
                self.acked.remove(0);
                continue;
            }
            if first != read {
                break;
            }
            self.acked.remove(0);
            if queue.com_commit(&self.peer_port_id, first) != Ok(ComResult::Handled) {
                debug!(port_id = %self.port_id, seq = first, "Ack for unsent token ignored");
            }
        }
    }

    /// The tunnel went down: roll back everything in flight so it is
    /// resent on the next tunnel
    pub fn tunnel_down(&mut self, queue: &mut Queue) {
        self.acked.clear();
        if let Some(read) = queue.reader_position(&self.peer_port_id) {
            let _ = queue.com_cancel(&self.peer_port_id, read);
            self.sent = read;
        }
        self.bulk = true;
        self.backoff = Duration::ZERO;
        self.time_cont = None;
    }
}
