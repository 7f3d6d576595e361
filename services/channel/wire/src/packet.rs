//! Session packet kinds.
//!
//! Every packet exchanged on a session line is one of the variants of
//! [`SessionPacket`]. Data, Fin and FinAck are reliable: they carry a message
//! id assigned by the sender and a piggybacked cumulative ack.

use crate::varint::{string_len, MAX_VARINT_LEN};

/// Packet type tags as defined in the wire protocol
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    /// Client asks the server to create a session
    CreateRequest = 0,
    /// Server reply carrying the new session id
    CreateResponse = 1,
    /// Client asks to bind a new line to an existing session
    RebindRequest = 2,
    /// Server reply carrying its cumulative ack
    RebindResponse = 3,
    /// Standalone cumulative ack
    Ack = 4,
    /// Reliable packet carrying an application payload
    Data = 5,
    /// Reliable close request
    Fin = 6,
    /// Reliable acknowledgment of the peer's Fin
    FinAck = 7,
    /// Keepalive probe
    PingRequest = 8,
    /// Keepalive reply echoing the probe ticks
    PingResponse = 9,
}

impl TryFrom<u8> for PacketType {
    type Error = crate::WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(PacketType::CreateRequest),
            1 => Ok(PacketType::CreateResponse),
            2 => Ok(PacketType::RebindRequest),
            3 => Ok(PacketType::RebindResponse),
            4 => Ok(PacketType::Ack),
            5 => Ok(PacketType::Data),
            6 => Ok(PacketType::Fin),
            7 => Ok(PacketType::FinAck),
            8 => Ok(PacketType::PingRequest),
            9 => Ok(PacketType::PingResponse),
            _ => Err(crate::WireError::Type(value)),
        }
    }
}

/// What a reliable packet carries
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReliableBody<P> {
    /// Application payload
    Data(P),
    /// Close request for the sender's direction
    Fin,
    /// Acknowledgment of the peer's Fin
    FinAck,
}

/// A packet that takes part in ordered, acknowledged delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReliablePacket<P> {
    /// Sender-assigned id, 1-based and strictly increasing per session
    pub message_id: u32,
    /// Highest message id the sender has received from its peer
    pub ack: u32,
    /// Carried content
    pub body: ReliableBody<P>,
}

impl<P> ReliablePacket<P> {
    /// Create a reliable packet; the ack is stamped when it is flushed to a line
    pub fn new(message_id: u32, body: ReliableBody<P>) -> Self {
        Self {
            message_id,
            ack: 0,
            body,
        }
    }

    /// Wire tag for this packet
    pub fn packet_type(&self) -> PacketType {
        match self.body {
            ReliableBody::Data(_) => PacketType::Data,
            ReliableBody::Fin => PacketType::Fin,
            ReliableBody::FinAck => PacketType::FinAck,
        }
    }
}

/// Every packet that can travel on a session line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionPacket<P> {
    /// First packet of a creating line
    CreateRequest {
        /// Binding token, empty when the gateway does not require one
        token: String,
    },
    /// Reply to [`SessionPacket::CreateRequest`]
    CreateResponse {
        /// Session id issued by the server
        session_id: u32,
    },
    /// First packet of a rebinding line
    RebindRequest {
        /// Session to rebind
        session_id: u32,
        /// Client-assigned index of this line
        line_index: u32,
        /// Last message id the client received
        client_ack: u32,
    },
    /// Reply to [`SessionPacket::RebindRequest`]
    RebindResponse {
        /// Last message id the server received
        server_ack: u32,
    },
    /// Standalone cumulative ack
    Ack {
        /// Last message id received
        ack: u32,
    },
    /// Data, Fin or FinAck
    Reliable(ReliablePacket<P>),
    /// Keepalive probe
    PingRequest {
        /// Sender clock in milliseconds, echoed back unchanged
        ticks: u32,
    },
    /// Keepalive reply
    PingResponse {
        /// Ticks copied from the probe
        ticks: u32,
    },
}

impl<P> SessionPacket<P> {
    /// Wire tag for this packet
    pub fn packet_type(&self) -> PacketType {
        match self {
            SessionPacket::CreateRequest { .. } => PacketType::CreateRequest,
            SessionPacket::CreateResponse { .. } => PacketType::CreateResponse,
            SessionPacket::RebindRequest { .. } => PacketType::RebindRequest,
            SessionPacket::RebindResponse { .. } => PacketType::RebindResponse,
            SessionPacket::Ack { .. } => PacketType::Ack,
            SessionPacket::Reliable(p) => p.packet_type(),
            SessionPacket::PingRequest { .. } => PacketType::PingRequest,
            SessionPacket::PingResponse { .. } => PacketType::PingResponse,
        }
    }

    /// Upper bound on the body length, excluding the inner payload
    pub(crate) fn estimate_body_len(&self) -> usize {
        match self {
            SessionPacket::CreateRequest { token } => string_len(token),
            SessionPacket::RebindRequest { .. } => 3 * MAX_VARINT_LEN,
            SessionPacket::Reliable(_) => 2 * MAX_VARINT_LEN,
            SessionPacket::CreateResponse { .. }
            | SessionPacket::RebindResponse { .. }
            | SessionPacket::Ack { .. }
            | SessionPacket::PingRequest { .. }
            | SessionPacket::PingResponse { .. } => MAX_VARINT_LEN,
        }
    }
}

impl<P> From<ReliablePacket<P>> for SessionPacket<P> {
    fn from(packet: ReliablePacket<P>) -> Self {
        SessionPacket::Reliable(packet)
    }
}
