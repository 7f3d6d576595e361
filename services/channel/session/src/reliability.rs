//! Reliable delivery: message ids, send buffer, cumulative acks and resync.

use crate::error::{Result, SessionError};
use channel_wire::{ReliableBody, ReliablePacket};
use std::collections::VecDeque;
use tracing::{error, trace, warn};

/// Send state for reliability
#[derive(Debug, Clone)]
pub struct SendState<P> {
    /// Reliable packets not yet acknowledged by the peer, oldest first
    pub buffer: VecDeque<ReliablePacket<P>>,
    /// Last message id assigned
    pub last_send_id: u32,
    /// Last message id handed to the current line
    pub last_send_id_of_line: u32,
}

impl<P> Default for SendState<P> {
    fn default() -> Self {
        Self {
            buffer: VecDeque::new(),
            last_send_id: 0,
            last_send_id_of_line: 0,
        }
    }
}

/// Receive state for reliability
#[derive(Debug, Clone, Copy, Default)]
pub struct RecvState {
    /// Highest in-order message id consumed
    pub last_recv_id: u32,
    /// Highest ack advertised to the peer so far
    pub last_ack_sent: u32,
}

/// Outcome of checking an incoming message id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Receipt {
    /// Already consumed; drop without side effects
    Duplicate,
    /// Next in order; `last_recv_id` has been advanced
    Accepted,
}

/// Per-session reliable delivery state
#[derive(Debug, Clone)]
pub struct ReliableState<P> {
    send: SendState<P>,
    recv: RecvState,
}

impl<P> Default for ReliableState<P> {
    fn default() -> Self {
        Self {
            send: SendState::default(),
            recv: RecvState::default(),
        }
    }
}

impl<P: Clone> ReliableState<P> {
    /// Create an empty state
    pub fn new() -> Self {
        Self::default()
    }

    /// Last message id assigned
    pub fn last_send_id(&self) -> u32 {
        self.send.last_send_id
    }

    /// Highest in-order message id received
    pub fn last_recv_id(&self) -> u32 {
        self.recv.last_recv_id
    }

    /// Number of unacknowledged packets
    pub fn buffered(&self) -> usize {
        self.send.buffer.len()
    }

    /// Id of the oldest unacknowledged packet
    pub fn oldest_id(&self) -> Option<u32> {
        self.send.buffer.front().map(|p| p.message_id)
    }

    /// Whether the peer has not yet been told about the latest receipt
    pub fn ack_pending(&self) -> bool {
        self.recv.last_ack_sent != self.recv.last_recv_id
    }

    /// Record that `ack` was advertised to the peer outside of a flush
    pub fn mark_ack_sent(&mut self, ack: u32) {
        self.recv.last_ack_sent = ack;
    }

    /// Assign the next message id to `body` and append it to the send buffer
    pub fn push(&mut self, body: ReliableBody<P>) -> u32 {
        self.send.last_send_id = self.send.last_send_id.wrapping_add(1);
        let message_id = self.send.last_send_id;
        self.send.buffer.push_back(ReliablePacket::new(message_id, body));
        trace!(message_id, buffered = self.send.buffer.len(), "Buffered reliable packet");
        message_id
    }

    /// Take the packets the current line has not seen yet, stamped with the
    /// latest ack, and mark them as handed to the line.
    pub fn flush(&mut self) -> Result<Vec<ReliablePacket<P>>> {
        let pending = self.send.last_send_id as i64 - self.send.last_send_id_of_line as i64;
        if pending < 0 || pending as usize > self.send.buffer.len() {
            error!(
                last_send_id = self.send.last_send_id,
                last_send_id_of_line = self.send.last_send_id_of_line,
                buffered = self.send.buffer.len(),
                "Send buffer out of sync with line"
            );
            return Err(SessionError::Bookkeeping(format!(
                "pending={} last_send_id={} last_send_id_of_line={} buffered={}",
                pending,
                self.send.last_send_id,
                self.send.last_send_id_of_line,
                self.send.buffer.len()
            )));
        }

        let ack = self.recv.last_recv_id;
        let skip = self.send.buffer.len() - pending as usize;
        let packets: Vec<_> = self
            .send
            .buffer
            .iter_mut()
            .skip(skip)
            .map(|p| {
                p.ack = ack;
                p.clone()
            })
            .collect();

        if !packets.is_empty() {
            self.recv.last_ack_sent = ack;
        }
        self.send.last_send_id_of_line = self.send.last_send_id;
        Ok(packets)
    }

    /// Check an incoming message id and consume it when it is next in order
    pub fn accept(&mut self, message_id: u32) -> Result<Receipt> {
        if message_id <= self.recv.last_recv_id {
            trace!(message_id, last_recv_id = self.recv.last_recv_id, "Duplicate reliable packet");
            return Ok(Receipt::Duplicate);
        }
        let expected = self.recv.last_recv_id.wrapping_add(1);
        if message_id != expected {
            warn!(message_id, expected, "Reliable packet out of order");
            return Err(SessionError::ProtocolViolation(format!(
                "message id {} != expected {}",
                message_id, expected
            )));
        }
        self.recv.last_recv_id = message_id;
        Ok(Receipt::Accepted)
    }

    /// Drop every buffered packet with `message_id <= ack`; returns how many
    pub fn remove_acked(&mut self, ack: u32) -> usize {
        let mut removed = 0;
        while self.send.buffer.front().is_some_and(|p| p.message_id <= ack) {
            self.send.buffer.pop_front();
            removed += 1;
        }
        if removed > 0 {
            trace!(ack, removed, buffered = self.send.buffer.len(), "Acked reliable packets");
        }
        removed
    }

    /// Validate the ack a peer reported during a rebind handshake.
    ///
    /// The peer may be at most one message behind the oldest buffered packet
    /// and never ahead of the last id assigned.
    pub fn check_resync(&self, ack: u32) -> Result<()> {
        let low = self
            .oldest_id()
            .map(|id| id.saturating_sub(1))
            .unwrap_or(self.send.last_send_id);
        let high = self.send.last_send_id;
        if ack < low || ack > high {
            error!(ack, low, high, "Rebind ack outside buffered range");
            return Err(SessionError::ResyncRejected { ack, low, high });
        }
        Ok(())
    }

    /// Start a fresh line whose peer has acknowledged up to `ack`; the next
    /// flush resends everything after it.
    pub fn rewind_line(&mut self, ack: u32) {
        self.send.last_send_id_of_line = ack;
        self.recv.last_ack_sent = self.recv.last_recv_id;
    }
}
