//! Session error types.

use channel_wire::CodecError;
use thiserror::Error;

/// Session errors
#[derive(Error, Debug)]
pub enum SessionError {
    /// The creating line closed before the session was created
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    /// The channel reached `Closed` and cannot be used any more
    #[error("channel closed")]
    ChannelClosed,

    /// The peer refused the create or rebind handshake
    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),

    /// Wrong packet for the current state or a message id gap
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Send buffer and ack counters disagree
    #[error("send bookkeeping broken: {0}")]
    Bookkeeping(String),

    /// Rebind ack is outside the buffered range
    #[error("rebind ack {ack} outside [{low}, {high}]")]
    ResyncRejected {
        /// Ack reported by the peer
        ack: u32,
        /// Lowest acceptable ack
        low: u32,
        /// Highest acceptable ack
        high: u32,
    },

    /// Transport failure
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Packet encoding or decoding failure
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
}

/// Result alias for session operations
pub type Result<T> = std::result::Result<T, SessionError>;
