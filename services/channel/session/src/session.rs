//! Session state machine shared by both ends of a session channel.
//!
//! [`SessionCore`] owns every piece of mutable session state: the current and
//! pending lines, reliable delivery, the close machine and the timers. It
//! performs no I/O of its own. Lines are reached through the [`Line`] trait,
//! time advances only through [`SessionCore::update`], and everything the
//! owner must react to is queued as a [`SessionOutput`].
//!
//! The connecting side ([`Role::Initiator`]) creates lines and rebinds them
//! after a loss; the accepting side ([`Role::Responder`]) waits for the peer
//! to come back.

use crate::close::{CloseAction, CloseActions, CloseMachine, CloseState};
use crate::error::{Result, SessionError};
use crate::keepalive::{now_ticks, Keepalive};
use crate::line::{Line, LineId};
use crate::liveness::{Liveness, LivenessEvent};
use crate::reliability::{ReliableState, Receipt};
use crate::settings::{ClientSettings, SessionSettings};
use channel_wire::{ReliableBody, ReliablePacket, SessionPacket};
use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Which end of the session this is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Connects, creates the session and rebinds lost lines
    Initiator,
    /// Accepts lines and waits for rebinds
    Responder,
}

/// Coarse lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Waiting for the create handshake
    Connecting,
    /// Session id known; lines may come and go
    Connected,
    /// Terminal
    Closed,
}

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Close handshake completed
    Graceful,
    /// The creating line closed before the session was created
    ConnectFailed,
    /// Closed locally before the session was created, or shut down
    Aborted,
    /// No line bound within the offline timeout
    OfflineTimeout,
    /// Unexpected Fin or FinAck
    ProtocolViolation,
    /// Send buffer and counters disagree
    Bookkeeping,
    /// Rebind ack outside the buffered range
    ResyncRejected,
    /// A buffered packet could not be encoded for the line
    Unencodable,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Things the owner of a [`SessionCore`] must act on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutput<P> {
    /// The session was created
    Connected {
        /// Session id
        session_id: u32,
    },
    /// In-order application payload
    Delivered(P),
    /// Close state moved
    CloseStateChanged(CloseState),
    /// A probe completed; new smoothed RTT
    RttUpdated(Duration),
    /// Open a rebinding line and hand it to [`SessionCore::bind_pending`]
    OpenRebindLine {
        /// Session to rebind
        session_id: u32,
        /// Index for the new line
        line_index: u32,
        /// Last message id received
        client_ack: u32,
    },
    /// Terminal; nothing follows
    Closed(CloseReason),
}

/// Protocol state of one session
pub struct SessionCore<P, L> {
    role: Role,
    phase: Phase,
    session_id: u32,
    line: Option<L>,
    pending: Option<L>,
    last_line_index: u32,
    reliable: ReliableState<P>,
    close: CloseMachine,
    liveness: Liveness,
    keepalive: Keepalive,
    outputs: VecDeque<SessionOutput<P>>,
}

impl<P, L> SessionCore<P, L>
where
    P: Clone + fmt::Debug,
    L: Line<P>,
{
    /// Connecting side, with its creating line already dialing
    pub fn initiator(settings: ClientSettings, creating_line: L) -> Self {
        let mut core = Self::new(
            Role::Initiator,
            0,
            Liveness::new(settings.session, Some(settings.rebind)),
        );
        core.last_line_index = creating_line.line_index();
        core.pending = Some(creating_line);
        core
    }

    /// Accepting side for a freshly issued session id
    pub fn responder(session_id: u32, settings: SessionSettings) -> Self {
        Self::new(Role::Responder, session_id, Liveness::new(settings, None))
    }

    fn new(role: Role, session_id: u32, liveness: Liveness) -> Self {
        Self {
            role,
            phase: Phase::Connecting,
            session_id,
            line: None,
            pending: None,
            last_line_index: 0,
            reliable: ReliableState::new(),
            close: CloseMachine::new(),
            liveness,
            keepalive: Keepalive::default(),
            outputs: VecDeque::new(),
        }
    }

    /// Which end this is
    pub fn role(&self) -> Role {
        self.role
    }

    /// Lifecycle phase
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Session id, 0 until created
    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    /// Close machine state
    pub fn close_state(&self) -> CloseState {
        self.close.state()
    }

    /// Smoothed round-trip time
    pub fn srtt(&self) -> Option<Duration> {
        self.keepalive.srtt()
    }

    /// Last message id assigned locally
    pub fn last_send_id(&self) -> u32 {
        self.reliable.last_send_id()
    }

    /// Highest in-order message id received
    pub fn last_recv_id(&self) -> u32 {
        self.reliable.last_recv_id()
    }

    /// Unacknowledged reliable packets
    pub fn buffered(&self) -> usize {
        self.reliable.buffered()
    }

    /// Line currently bound
    pub fn current_line(&self) -> Option<LineId> {
        self.line.as_ref().map(|l| l.id())
    }

    /// Line still handshaking
    pub fn pending_line(&self) -> Option<LineId> {
        self.pending.as_ref().map(|l| l.id())
    }

    /// Next queued output
    pub fn poll_output(&mut self) -> Option<SessionOutput<P>> {
        self.outputs.pop_front()
    }

    // ---- application interface ----

    /// Queue an application payload for reliable delivery.
    ///
    /// Payloads are dropped once the local Fin has been sent.
    pub fn send(&mut self, payload: P) -> Result<()> {
        if self.phase == Phase::Closed {
            return Err(SessionError::ChannelClosed);
        }
        if self.close.fin_sent() {
            debug!(session_id = self.session_id, "Dropping payload sent after Fin");
            return Ok(());
        }
        self.push_reliable(ReliableBody::Data(payload));
        Ok(())
    }

    /// Close gracefully; before the session exists this aborts it
    pub fn close(&mut self) {
        match self.phase {
            Phase::Closed => {}
            Phase::Connecting => self.terminate(CloseReason::Aborted),
            Phase::Connected => {
                let actions = self.close.local_close();
                self.apply(actions);
            }
        }
    }

    /// Tear down without the close handshake
    pub fn close_immediately(&mut self, reason: CloseReason) {
        if self.phase != Phase::Closed {
            self.terminate(reason);
        }
    }

    /// Advance timers by `elapsed` and act on whatever became due
    pub fn update(&mut self, elapsed: Duration) {
        if self.phase == Phase::Closed {
            return;
        }

        for event in self.liveness.tick(elapsed) {
            if self.phase == Phase::Closed {
                break;
            }
            match event {
                LivenessEvent::OfflineExpired => {
                    warn!(session_id = self.session_id, "Offline timeout; closing session");
                    self.terminate(CloseReason::OfflineTimeout);
                }
                LivenessEvent::RebindDue => self.start_rebind(),
                LivenessEvent::SendPing => self.send_ping(),
                LivenessEvent::AliveWaitExpired => {
                    warn!(session_id = self.session_id, "No PONG within wait interval; dropping line");
                    self.drop_line();
                }
                LivenessEvent::TimeWaitExpired => {
                    trace!(session_id = self.session_id, "TimeWait timed out");
                    let actions = self.close.time_wait_expired();
                    self.apply(actions);
                }
            }
        }

        if self.phase != Phase::Closed && self.reliable.ack_pending() {
            self.send_ack();
        }
    }

    // ---- line events ----

    /// Replace the pending line with a freshly dialed one
    pub fn bind_pending(&mut self, line: L) {
        if self.phase == Phase::Closed {
            line.close(false);
            return;
        }
        if let Some(old) = self.pending.replace(line) {
            old.close(false);
        }
    }

    /// The creating line received its `CreateResponse`
    pub fn on_line_created(&mut self, line_id: LineId, session_id: u32) {
        if self.pending_line() != Some(line_id) {
            trace!(line = %line_id, "Ignoring create from stale line");
            return;
        }
        let Some(line) = self.pending.take() else {
            return;
        };
        if self.phase != Phase::Connecting {
            line.close(false);
            return;
        }

        self.session_id = session_id;
        self.bind_current(line);
        self.phase = Phase::Connected;
        info!(session_id, line = %line_id, "Session created");
        self.outputs.push_back(SessionOutput::Connected { session_id });
        self.flush();
    }

    /// The rebinding line received its `RebindResponse`
    pub fn on_line_rebound(&mut self, line_id: LineId, server_ack: u32) {
        if self.pending_line() != Some(line_id) {
            trace!(line = %line_id, "Ignoring rebind from stale line");
            return;
        }
        let Some(line) = self.pending.take() else {
            return;
        };
        if self.phase != Phase::Connected {
            line.close(false);
            return;
        }
        if let Err(e) = self.reliable.check_resync(server_ack) {
            error!(session_id = self.session_id, error = %e, "Cannot resend to server");
            line.close(false);
            self.terminate(CloseReason::ResyncRejected);
            return;
        }

        info!(
            session_id = self.session_id,
            line = %line_id,
            line_index = line.line_index(),
            ack = server_ack,
            "Line rebound"
        );
        self.bind_current(line);
        self.resync(server_ack);
    }

    /// Responder: a new session's creating line was accepted
    pub fn attach_created(&mut self, line: L) {
        if self.phase != Phase::Connecting {
            warn!(session_id = self.session_id, "Create for an existing session");
            line.close(false);
            return;
        }

        self.last_line_index = line.line_index();
        line.send(SessionPacket::CreateResponse {
            session_id: self.session_id,
        });
        debug!(session_id = self.session_id, line = %line.id(), "Session line created");
        self.bind_current(line);
        self.phase = Phase::Connected;
        self.outputs.push_back(SessionOutput::Connected {
            session_id: self.session_id,
        });
        self.flush();
    }

    /// Responder: a rebinding line for this session was accepted
    pub fn attach_rebind(&mut self, line: L, client_ack: u32) {
        if self.phase != Phase::Connected {
            line.close(false);
            return;
        }
        if line.line_index() < self.last_line_index {
            debug!(
                session_id = self.session_id,
                line_index = line.line_index(),
                last_line_index = self.last_line_index,
                "Rejecting rebind with lower line index"
            );
            line.close(false);
            return;
        }
        if let Err(e) = self.reliable.check_resync(client_ack) {
            error!(session_id = self.session_id, error = %e, "Cannot resend to client");
            line.close(false);
            self.terminate(CloseReason::ResyncRejected);
            return;
        }

        info!(
            session_id = self.session_id,
            line = %line.id(),
            line_index = line.line_index(),
            ack = client_ack,
            "Line rebound"
        );
        self.last_line_index = line.line_index();
        line.send(SessionPacket::RebindResponse {
            server_ack: self.reliable.last_recv_id(),
        });
        self.bind_current(line);
        self.resync(client_ack);
    }

    /// A line closed
    pub fn on_line_closed(&mut self, line_id: LineId) {
        if self.pending_line() == Some(line_id) {
            self.pending = None;
            match self.phase {
                Phase::Connecting => {
                    debug!(line = %line_id, "Creating line closed");
                    self.terminate(CloseReason::ConnectFailed);
                }
                Phase::Connected => {
                    debug!(session_id = self.session_id, line = %line_id, "Rebinding line closed");
                    self.liveness.rebind_failed();
                }
                Phase::Closed => {}
            }
        } else if self.current_line() == Some(line_id) {
            self.line = None;
            if self.phase != Phase::Closed {
                info!(session_id = self.session_id, line = %line_id, "Current line lost");
                self.line_lost();
            }
        } else {
            trace!(line = %line_id, "Ignoring close of stale line");
        }
    }

    /// A packet arrived on a line
    pub fn on_packet(&mut self, line_id: LineId, packet: SessionPacket<P>) {
        if self.phase == Phase::Closed || self.current_line() != Some(line_id) {
            trace!(line = %line_id, "Ignoring packet from stale line");
            return;
        }

        match packet {
            SessionPacket::Reliable(p) => self.on_reliable(p),
            SessionPacket::Ack { ack } => self.remove_acked(ack),
            SessionPacket::PingRequest { ticks } => {
                if let Some(line) = &self.line {
                    line.send(SessionPacket::PingResponse { ticks });
                }
            }
            SessionPacket::PingResponse { ticks } => {
                if !self.liveness.awaiting_pong() {
                    return;
                }
                if let Some(srtt) = self.keepalive.process_pong(ticks, now_ticks()) {
                    self.liveness.alive_confirmed();
                    self.outputs.push_back(SessionOutput::RttUpdated(srtt));
                }
            }
            other => {
                warn!(
                    session_id = self.session_id,
                    packet_type = ?other.packet_type(),
                    "Unexpected packet on bound line"
                );
                self.drop_line();
            }
        }
    }

    // ---- internals ----

    fn on_reliable(&mut self, packet: ReliablePacket<P>) {
        match self.reliable.accept(packet.message_id) {
            Ok(Receipt::Duplicate) => return,
            Ok(Receipt::Accepted) => {}
            Err(e) => {
                warn!(session_id = self.session_id, error = %e, "Dropping line");
                self.drop_line();
                return;
            }
        }

        self.remove_acked(packet.ack);
        if self.phase == Phase::Closed {
            return;
        }

        let result = match packet.body {
            ReliableBody::Data(payload) => {
                self.outputs.push_back(SessionOutput::Delivered(payload));
                return;
            }
            ReliableBody::Fin => self.close.on_fin(),
            ReliableBody::FinAck => self.close.on_fin_ack(),
        };
        match result {
            Ok(actions) => self.apply(actions),
            Err(e) => {
                warn!(session_id = self.session_id, error = %e, "Closing session");
                self.terminate(CloseReason::ProtocolViolation);
            }
        }
    }

    fn apply(&mut self, actions: CloseActions) {
        for action in actions {
            if self.phase == Phase::Closed {
                break;
            }
            match action {
                CloseAction::SendFin => {
                    let id = self.push_reliable(ReliableBody::Fin);
                    self.close.record_fin(id);
                }
                CloseAction::SendFinAck => {
                    let id = self.push_reliable(ReliableBody::FinAck);
                    self.close.record_fin_ack(id);
                }
                CloseAction::SendAck => self.send_ack(),
                CloseAction::Enter(state) => {
                    self.outputs.push_back(SessionOutput::CloseStateChanged(state));
                    match state {
                        CloseState::TimeWait => self.liveness.time_wait_entered(),
                        CloseState::Closed => self.terminate(CloseReason::Graceful),
                        _ => {}
                    }
                }
            }
        }
    }

    fn push_reliable(&mut self, body: ReliableBody<P>) -> u32 {
        let message_id = self.reliable.push(body);
        self.flush();
        message_id
    }

    fn flush(&mut self) {
        if self.line.is_none() {
            return;
        }
        match self.reliable.flush() {
            Ok(packets) => {
                if let Some(line) = &self.line {
                    for packet in packets {
                        trace!(
                            session_id = self.session_id,
                            message_id = packet.message_id,
                            ack = packet.ack,
                            "Sending reliable packet"
                        );
                        line.send(packet.into());
                    }
                }
            }
            Err(e) => {
                error!(session_id = self.session_id, error = %e, "Closing session");
                self.terminate(CloseReason::Bookkeeping);
            }
        }
    }

    fn remove_acked(&mut self, ack: u32) {
        if self.reliable.remove_acked(ack) > 0 {
            let actions = self.close.on_acked(ack);
            self.apply(actions);
        }
    }

    fn resync(&mut self, ack: u32) {
        self.remove_acked(ack);
        if self.phase == Phase::Closed {
            return;
        }
        self.reliable.rewind_line(ack);
        self.flush();
    }

    fn send_ack(&mut self) {
        if let Some(line) = &self.line {
            let ack = self.reliable.last_recv_id();
            line.send(SessionPacket::Ack { ack });
            self.reliable.mark_ack_sent(ack);
        }
    }

    fn send_ping(&mut self) {
        if let Some(line) = &self.line {
            let ticks = now_ticks();
            self.keepalive.record_ping(ticks);
            trace!(session_id = self.session_id, ticks, "Sending PING");
            line.send(SessionPacket::PingRequest { ticks });
        }
    }

    fn start_rebind(&mut self) {
        if let Some(old) = self.pending.take() {
            old.close(false);
        }
        self.last_line_index = self.last_line_index.wrapping_add(1);
        debug!(
            session_id = self.session_id,
            line_index = self.last_line_index,
            "Starting rebind"
        );
        self.outputs.push_back(SessionOutput::OpenRebindLine {
            session_id: self.session_id,
            line_index: self.last_line_index,
            client_ack: self.reliable.last_recv_id(),
        });
    }

    fn bind_current(&mut self, line: L) {
        if let Some(old) = self.line.replace(line) {
            old.close(false);
        }
        self.keepalive.clear();
        self.liveness.line_bound();
    }

    fn drop_line(&mut self) {
        if let Some(line) = self.line.take() {
            line.close(false);
            self.line_lost();
        }
    }

    fn line_lost(&mut self) {
        self.keepalive.clear();
        self.liveness.line_lost();
    }

    fn terminate(&mut self, reason: CloseReason) {
        let graceful = reason == CloseReason::Graceful;
        info!(session_id = self.session_id, %reason, "Session closed");

        self.phase = Phase::Closed;
        if let Some(line) = self.line.take() {
            line.close(graceful);
        }
        if let Some(line) = self.pending.take() {
            line.close(false);
        }
        self.liveness.stop_all();
        self.keepalive.clear();
        self.outputs.push_back(SessionOutput::Closed(reason));
    }
}
