//! FIN / FIN-ACK / TIME-WAIT close state machine.
//!
//! The machine only decides. It returns the actions to perform in order, and
//! the session executes them against its reliable send path, recording the
//! ids of the Fin and FinAck it sends.

use crate::error::{Result, SessionError};
use smallvec::{smallvec, SmallVec};
use std::fmt;
use tracing::{debug, warn};

/// Close progress of a session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum CloseState {
    /// Open
    #[default]
    None,
    /// Local Fin sent, waiting for its FinAck
    FinWait1,
    /// Local Fin acknowledged, waiting for the peer's Fin
    FinWait2,
    /// Both sides sent Fin simultaneously
    Closing,
    /// Both directions closed; lingering for the final ack
    TimeWait,
    /// Peer's Fin received, local Fin not yet sent
    CloseWait,
    /// Local Fin sent after the peer's; waiting for its FinAck
    LastAck,
    /// Terminal
    Closed,
}

impl fmt::Display for CloseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Step the session must carry out for the close machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseAction {
    /// Send a reliable Fin and report its id with [`CloseMachine::record_fin`]
    SendFin,
    /// Send a reliable FinAck and report its id with [`CloseMachine::record_fin_ack`]
    SendFinAck,
    /// Send a standalone `Ack` carrying the last received id
    SendAck,
    /// The machine moved to this state
    Enter(CloseState),
}

/// Actions produced by one close machine input
pub type CloseActions = SmallVec<[CloseAction; 4]>;

/// Close state plus the ids needed to detect acknowledgment
#[derive(Debug, Clone, Default)]
pub struct CloseMachine {
    state: CloseState,
    fin_message_id: Option<u32>,
    fin_ack_message_id: Option<u32>,
    peer_fin_acked: bool,
}

impl CloseMachine {
    /// Create a machine in state `None`
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state
    pub fn state(&self) -> CloseState {
        self.state
    }

    /// Whether the local Fin has been sent; no more data may follow it
    pub fn fin_sent(&self) -> bool {
        self.fin_message_id.is_some()
    }

    /// Whether the peer has acknowledged our FinAck
    pub fn peer_fin_acked(&self) -> bool {
        self.peer_fin_acked
    }

    /// Record the id the local Fin was sent with
    pub fn record_fin(&mut self, message_id: u32) {
        self.fin_message_id = Some(message_id);
    }

    /// Record the id the local FinAck was sent with
    pub fn record_fin_ack(&mut self, message_id: u32) {
        self.fin_ack_message_id = Some(message_id);
    }

    fn enter(&mut self, state: CloseState, actions: &mut CloseActions) {
        debug!(from = %self.state, to = %state, "Close state changed");
        self.state = state;
        actions.push(CloseAction::Enter(state));
    }

    /// Local close request
    pub fn local_close(&mut self) -> CloseActions {
        let mut actions = CloseActions::new();
        match self.state {
            CloseState::None => {
                actions.push(CloseAction::SendFin);
                self.enter(CloseState::FinWait1, &mut actions);
            }
            CloseState::CloseWait => {
                actions.push(CloseAction::SendFin);
                self.enter(CloseState::LastAck, &mut actions);
            }
            state => {
                warn!(state = %state, "Close requested again; ignoring");
            }
        }
        actions
    }

    /// Reliable Fin received from the peer
    pub fn on_fin(&mut self) -> Result<CloseActions> {
        let mut actions: CloseActions = match self.state {
            CloseState::None | CloseState::FinWait1 | CloseState::FinWait2 => smallvec![],
            state => {
                warn!(state = %state, "Fin received in unexpected state");
                return Err(SessionError::ProtocolViolation(format!("fin in state {}", state)));
            }
        };

        if self.fin_ack_message_id.is_none() {
            actions.push(CloseAction::SendFinAck);
        }

        match self.state {
            CloseState::None => {
                self.enter(CloseState::CloseWait, &mut actions);
                actions.push(CloseAction::SendFin);
                self.enter(CloseState::LastAck, &mut actions);
            }
            CloseState::FinWait1 => self.enter(CloseState::Closing, &mut actions),
            _ => self.enter(CloseState::TimeWait, &mut actions),
        }
        Ok(actions)
    }

    /// Reliable FinAck received from the peer
    pub fn on_fin_ack(&mut self) -> Result<CloseActions> {
        let mut actions = CloseActions::new();
        match self.state {
            CloseState::FinWait1 => self.enter(CloseState::FinWait2, &mut actions),
            CloseState::Closing => {
                let next = if self.peer_fin_acked {
                    CloseState::Closed
                } else {
                    CloseState::TimeWait
                };
                self.enter(next, &mut actions);
            }
            CloseState::LastAck => {
                actions.push(CloseAction::SendAck);
                self.enter(CloseState::Closed, &mut actions);
            }
            state => {
                warn!(state = %state, "FinAck received in unexpected state");
                return Err(SessionError::ProtocolViolation(format!("fin-ack in state {}", state)));
            }
        }
        Ok(actions)
    }

    /// The peer acknowledged up to `ack`
    pub fn on_acked(&mut self, ack: u32) -> CloseActions {
        let mut actions = CloseActions::new();
        let crossed = self.fin_ack_message_id.is_some_and(|id| ack >= id);
        if crossed && !self.peer_fin_acked {
            self.peer_fin_acked = true;
            if self.state == CloseState::TimeWait {
                self.enter(CloseState::Closed, &mut actions);
            }
        }
        actions
    }

    /// The TimeWait timer ran out
    pub fn time_wait_expired(&mut self) -> CloseActions {
        let mut actions = CloseActions::new();
        if self.state == CloseState::TimeWait {
            self.enter(CloseState::Closed, &mut actions);
        }
        actions
    }
}
