//! Wire protocol framing and packet encoding for session channels.
//!
//! This crate provides the byte-level half of the session channel protocol:
//! the packet model, the 7-bit integer encoding, the length prefix and a
//! pluggable payload codec.
//!
//! ## Wire Format
//!
//! ```text
//! +----------------------+----------------------------+
//! | u32 LE packet_len    | length of bytes that follow|
//! +----------------------+----------------------------+
//! | u8 tag               | packet type (0..=9)        |
//! +----------------------+----------------------------+
//! | fields               | 7-bit integers / strings   |
//! +----------------------+----------------------------+
//! | payload (Data only)  | inner payload codec        |
//! +----------------------+----------------------------+
//! ```
//!
//! Reliable packets (Data, Fin, FinAck) carry `message_id` then `ack` before
//! any payload.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod error;
pub mod frame;
pub mod packet;
pub mod varint;

// Re-export main types
pub use codec::{CodecError, PacketCodec, PayloadCodec, RawPayloadCodec};
pub use error::WireError;
pub use frame::{peek_len, DEFAULT_MAX_PACKET_SIZE, FRAME_HEADER_SIZE, HARD_MAX_PACKET_SIZE};
pub use packet::{PacketType, ReliableBody, ReliablePacket, SessionPacket};
