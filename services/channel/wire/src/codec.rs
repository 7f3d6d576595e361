//! Encoding and decoding of session packets.
//!
//! The session layer treats application payloads as opaque. A
//! [`PayloadCodec`] supplies their encoding; [`PacketCodec`] wraps it with the
//! packet tag, the session fields and the length prefix.

use crate::frame::{
    begin_frame, finish_frame, split_frame, DEFAULT_MAX_PACKET_SIZE, FRAME_HEADER_SIZE,
    HARD_MAX_PACKET_SIZE,
};
use crate::packet::{PacketType, ReliableBody, ReliablePacket, SessionPacket};
use crate::varint::{get_string, get_varint, put_string, put_varint, varint_len, MAX_VARINT_LEN};
use crate::WireError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use thiserror::Error;
use tracing::trace;

/// Codec errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Wire protocol error
    #[error("wire error: {0}")]
    Wire(#[from] WireError),
    /// Packet estimates to zero length and must not be sent
    #[error("packet cannot be serialized now")]
    NotSerializable,
    /// Inner payload codec failure
    #[error("payload codec error: {0}")]
    Payload(String),
}

/// Pluggable encoding for the application payload carried by Data packets
pub trait PayloadCodec: Send + Sync + 'static {
    /// Decoded payload type
    type Payload: Clone + Send + fmt::Debug + 'static;

    /// Upper bound on the encoded length; 0 means "cannot serialize now"
    fn estimate_len(&self, payload: &Self::Payload) -> usize;

    /// Append the encoded payload
    fn encode(&self, payload: &Self::Payload, buf: &mut BytesMut) -> Result<(), CodecError>;

    /// Decode a payload from the remaining packet body
    fn decode(&self, buf: &mut Bytes) -> Result<Self::Payload, CodecError>;
}

/// Raw byte payloads, written as a varint length followed by the bytes
#[derive(Debug, Clone, Copy, Default)]
pub struct RawPayloadCodec;

impl PayloadCodec for RawPayloadCodec {
    type Payload = Bytes;

    fn estimate_len(&self, payload: &Bytes) -> usize {
        varint_len(payload.len() as u32) + payload.len()
    }

    fn encode(&self, payload: &Bytes, buf: &mut BytesMut) -> Result<(), CodecError> {
        put_varint(buf, payload.len() as u32);
        buf.put_slice(payload);
        Ok(())
    }

    fn decode(&self, buf: &mut Bytes) -> Result<Bytes, CodecError> {
        let len = get_varint(buf)? as usize;
        if buf.remaining() < len {
            return Err(WireError::Malformed.into());
        }
        Ok(buf.split_to(len))
    }
}

/// Serializer for [`SessionPacket`]s over a byte stream
#[derive(Debug, Clone)]
pub struct PacketCodec<C> {
    inner: C,
    max_packet_size: usize,
}

impl<C: PayloadCodec> PacketCodec<C> {
    /// Create a packet codec around an inner payload codec
    pub fn new(inner: C) -> Self {
        Self {
            inner,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
        }
    }

    /// Override the maximum accepted packet body size, capped at
    /// [`HARD_MAX_PACKET_SIZE`]
    pub fn with_max_packet_size(mut self, max_packet_size: usize) -> Self {
        self.max_packet_size = max_packet_size.min(HARD_MAX_PACKET_SIZE);
        self
    }

    /// Maximum packet body size
    pub fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    /// Check that a Data packet carrying `payload` can be encoded.
    ///
    /// Callers check before a message id is spent on the payload: a reliable
    /// packet that cannot be encoded could never be delivered.
    pub fn check_payload(&self, payload: &C::Payload) -> Result<(), CodecError> {
        let payload_len = match self.inner.estimate_len(payload) {
            0 => return Err(CodecError::NotSerializable),
            len => len,
        };
        // Tag, message id and ack at their widest
        let body_len = 1 + 2 * MAX_VARINT_LEN + payload_len;
        if body_len > self.max_packet_size {
            return Err(WireError::Size(body_len).into());
        }
        Ok(())
    }

    /// Inner payload codec
    pub fn payload_codec(&self) -> &C {
        &self.inner
    }

    /// Upper bound on the framed length of `packet`; 0 means it must not be sent
    pub fn estimate_len(&self, packet: &SessionPacket<C::Payload>) -> usize {
        let payload_len = match packet {
            SessionPacket::Reliable(ReliablePacket {
                body: ReliableBody::Data(payload),
                ..
            }) => match self.inner.estimate_len(payload) {
                0 => return 0,
                len => len,
            },
            _ => 0,
        };
        FRAME_HEADER_SIZE + 1 + packet.estimate_body_len() + payload_len
    }

    /// Append the framed encoding of `packet` to `buf`
    pub fn encode(&self, packet: &SessionPacket<C::Payload>, buf: &mut BytesMut) -> Result<(), CodecError> {
        let estimated = self.estimate_len(packet);
        if estimated == 0 {
            return Err(CodecError::NotSerializable);
        }
        buf.reserve(estimated);

        let start = begin_frame(buf);
        buf.put_u8(packet.packet_type() as u8);

        match packet {
            SessionPacket::CreateRequest { token } => put_string(buf, token),
            SessionPacket::CreateResponse { session_id } => put_varint(buf, *session_id),
            SessionPacket::RebindRequest {
                session_id,
                line_index,
                client_ack,
            } => {
                put_varint(buf, *session_id);
                put_varint(buf, *line_index);
                put_varint(buf, *client_ack);
            }
            SessionPacket::RebindResponse { server_ack } => put_varint(buf, *server_ack),
            SessionPacket::Ack { ack } => put_varint(buf, *ack),
            SessionPacket::Reliable(p) => {
                put_varint(buf, p.message_id);
                put_varint(buf, p.ack);
                if let ReliableBody::Data(payload) = &p.body {
                    if let Err(e) = self.inner.encode(payload, buf) {
                        buf.truncate(start);
                        return Err(e);
                    }
                }
            }
            SessionPacket::PingRequest { ticks } | SessionPacket::PingResponse { ticks } => {
                put_varint(buf, *ticks)
            }
        }

        finish_frame(buf, start, self.max_packet_size)?;
        Ok(())
    }

    /// Encode `packet` into a fresh buffer
    pub fn encode_to_bytes(&self, packet: &SessionPacket<C::Payload>) -> Result<Bytes, CodecError> {
        let mut buf = BytesMut::new();
        self.encode(packet, &mut buf)?;
        Ok(buf.freeze())
    }

    /// Decode one packet from the head of `buf`.
    ///
    /// Returns `Ok(None)` while the packet is incomplete. Any error is fatal to
    /// the stream: the reader cannot resynchronize after it.
    pub fn decode(&self, buf: &mut BytesMut) -> Result<Option<SessionPacket<C::Payload>>, CodecError> {
        let mut frame = match split_frame(buf, self.max_packet_size)? {
            Some(frame) => frame,
            None => return Ok(None),
        };

        let packet_type = PacketType::try_from(frame.get_u8())?;
        trace!("Decoding {:?} packet ({} body bytes)", packet_type, frame.len());

        let packet = match packet_type {
            PacketType::CreateRequest => SessionPacket::CreateRequest {
                token: get_string(&mut frame)?,
            },
            PacketType::CreateResponse => SessionPacket::CreateResponse {
                session_id: get_varint(&mut frame)?,
            },
            PacketType::RebindRequest => SessionPacket::RebindRequest {
                session_id: get_varint(&mut frame)?,
                line_index: get_varint(&mut frame)?,
                client_ack: get_varint(&mut frame)?,
            },
            PacketType::RebindResponse => SessionPacket::RebindResponse {
                server_ack: get_varint(&mut frame)?,
            },
            PacketType::Ack => SessionPacket::Ack {
                ack: get_varint(&mut frame)?,
            },
            PacketType::Data | PacketType::Fin | PacketType::FinAck => {
                let message_id = get_varint(&mut frame)?;
                let ack = get_varint(&mut frame)?;
                let body = match packet_type {
                    PacketType::Data => ReliableBody::Data(self.inner.decode(&mut frame)?),
                    PacketType::Fin => ReliableBody::Fin,
                    _ => ReliableBody::FinAck,
                };
                SessionPacket::Reliable(ReliablePacket {
                    message_id,
                    ack,
                    body,
                })
            }
            PacketType::PingRequest => SessionPacket::PingRequest {
                ticks: get_varint(&mut frame)?,
            },
            PacketType::PingResponse => SessionPacket::PingResponse {
                ticks: get_varint(&mut frame)?,
            },
        };

        if frame.has_remaining() {
            return Err(WireError::Malformed.into());
        }
        Ok(Some(packet))
    }
}

impl Default for PacketCodec<RawPayloadCodec> {
    fn default() -> Self {
        Self::new(RawPayloadCodec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Payload codec that refuses to serialize empty payloads
    struct NonEmptyCodec;

    impl PayloadCodec for NonEmptyCodec {
        type Payload = Bytes;

        fn estimate_len(&self, payload: &Bytes) -> usize {
            if payload.is_empty() {
                0
            } else {
                RawPayloadCodec.estimate_len(payload)
            }
        }

        fn encode(&self, payload: &Bytes, buf: &mut BytesMut) -> Result<(), CodecError> {
            RawPayloadCodec.encode(payload, buf)
        }

        fn decode(&self, buf: &mut Bytes) -> Result<Bytes, CodecError> {
            RawPayloadCodec.decode(buf)
        }
    }

    fn data(message_id: u32, ack: u32, payload: &'static [u8]) -> SessionPacket<Bytes> {
        SessionPacket::Reliable(ReliablePacket {
            message_id,
            ack,
            body: ReliableBody::Data(Bytes::from_static(payload)),
        })
    }

    #[test]
    fn test_data_packet_layout() {
        let codec = PacketCodec::default();
        let bytes = codec.encode_to_bytes(&data(1, 0, b"hi")).unwrap();

        // [len=6 LE][tag=5][id=1][ack=0][payload len=2]["hi"]
        assert_eq!(&bytes[..], &[6, 0, 0, 0, 5, 1, 0, 2, b'h', b'i']);
    }

    #[test]
    fn test_rebind_request_layout() {
        let codec = PacketCodec::default();
        let packet = SessionPacket::RebindRequest {
            session_id: 7,
            line_index: 2,
            client_ack: 300,
        };
        let bytes = codec.encode_to_bytes(&packet).unwrap();
        assert_eq!(&bytes[..], &[5, 0, 0, 0, 2, 7, 2, 0xAC, 0x02]);

        let mut buf = BytesMut::from(&bytes[..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(packet));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_stream_of_packets() {
        let codec = PacketCodec::default();
        let packets = vec![
            SessionPacket::CreateRequest {
                token: "T".to_string(),
            },
            data(3, 2, b"payload"),
            SessionPacket::Reliable(ReliablePacket {
                message_id: 4,
                ack: 2,
                body: ReliableBody::Fin,
            }),
            SessionPacket::PingResponse { ticks: 123_456 },
        ];

        let mut stream = BytesMut::new();
        for p in &packets {
            codec.encode(p, &mut stream).unwrap();
        }

        // Feed the stream one byte at a time
        let mut buf = BytesMut::new();
        let mut decoded = Vec::new();
        for byte in stream.iter() {
            buf.put_u8(*byte);
            if let Some(p) = codec.decode(&mut buf).unwrap() {
                decoded.push(p);
            }
        }
        assert_eq!(decoded, packets);
    }

    #[test]
    fn test_unknown_tag_is_fatal() {
        let codec = PacketCodec::default();
        let mut buf = BytesMut::from(&[1u8, 0, 0, 0, 42][..]);
        assert_eq!(
            codec.decode(&mut buf),
            Err(CodecError::Wire(WireError::Type(42)))
        );
    }

    #[test]
    fn test_truncated_body_is_fatal() {
        let codec = PacketCodec::default();
        // Rebind request with only one of three fields
        let mut buf = BytesMut::from(&[2u8, 0, 0, 0, 2, 7][..]);
        assert_eq!(
            codec.decode(&mut buf),
            Err(CodecError::Wire(WireError::Malformed))
        );
    }

    #[test]
    fn test_trailing_bytes_are_fatal() {
        let codec = PacketCodec::default();
        let mut buf = BytesMut::from(&[3u8, 0, 0, 0, 4, 1, 1][..]);
        assert_eq!(
            codec.decode(&mut buf),
            Err(CodecError::Wire(WireError::Malformed))
        );
    }

    #[test]
    fn test_zero_estimate_is_not_serializable() {
        let codec = PacketCodec::new(NonEmptyCodec);
        let packet = data(1, 0, b"");
        assert_eq!(codec.estimate_len(&packet), 0);

        let mut buf = BytesMut::new();
        assert_eq!(codec.encode(&packet, &mut buf), Err(CodecError::NotSerializable));
        assert!(buf.is_empty());

        // Control packets never depend on the payload codec
        let ack = SessionPacket::Ack { ack: 1 };
        assert!(codec.estimate_len(&ack) > 0);
    }

    #[test]
    fn test_estimate_is_upper_bound() {
        let codec = PacketCodec::default();
        for packet in [
            SessionPacket::CreateResponse { session_id: u32::MAX },
            SessionPacket::Ack { ack: 1 },
            data(u32::MAX, u32::MAX, b"0123456789"),
            SessionPacket::CreateRequest {
                token: "0b6f2b4e-token".to_string(),
            },
        ] {
            let encoded = codec.encode_to_bytes(&packet).unwrap();
            assert!(encoded.len() <= codec.estimate_len(&packet));
        }
    }

    #[test]
    fn test_oversized_packet_rejected_on_encode() {
        let codec = PacketCodec::default().with_max_packet_size(8);
        let mut buf = BytesMut::new();
        let result = codec.encode(&data(1, 0, b"far too long for eight bytes"), &mut buf);
        assert!(matches!(result, Err(CodecError::Wire(WireError::Size(_)))));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_check_payload_matches_encode() {
        let codec = PacketCodec::default().with_max_packet_size(32);
        let fits = Bytes::from(vec![7u8; 16]);
        let too_big = Bytes::from(vec![7u8; 64]);

        assert_eq!(codec.check_payload(&fits), Ok(()));
        assert!(codec
            .encode_to_bytes(&data_owned(u32::MAX, u32::MAX, fits))
            .is_ok());

        assert!(matches!(
            codec.check_payload(&too_big),
            Err(CodecError::Wire(WireError::Size(_)))
        ));
        assert!(codec.encode_to_bytes(&data_owned(1, 0, too_big)).is_err());

        let refusing = PacketCodec::new(NonEmptyCodec);
        assert_eq!(refusing.check_payload(&Bytes::new()), Err(CodecError::NotSerializable));
    }

    #[test]
    fn test_max_packet_size_is_capped() {
        let codec = PacketCodec::default().with_max_packet_size(usize::MAX);
        assert_eq!(codec.max_packet_size(), HARD_MAX_PACKET_SIZE);
    }

    fn data_owned(message_id: u32, ack: u32, payload: Bytes) -> SessionPacket<Bytes> {
        SessionPacket::Reliable(ReliablePacket {
            message_id,
            ack,
            body: ReliableBody::Data(payload),
        })
    }
}
