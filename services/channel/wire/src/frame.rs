//! Length-prefixed framing for the wire protocol.
//!
//! Each packet is preceded by a little-endian `u32` holding the number of
//! bytes that follow it (type tag plus body).

use crate::WireError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the length prefix
pub const FRAME_HEADER_SIZE: usize = 4;

/// Maximum packet size (1 MiB default)
pub const DEFAULT_MAX_PACKET_SIZE: usize = 1024 * 1024;
/// Hard maximum packet size limit (16 MiB)
pub const HARD_MAX_PACKET_SIZE: usize = 16 * 1024 * 1024;

/// Total length of the frame at the head of `buf`, prefix included.
///
/// Returns 0 when fewer than [`FRAME_HEADER_SIZE`] bytes are buffered.
pub fn peek_len(buf: &[u8]) -> usize {
    if buf.len() < FRAME_HEADER_SIZE {
        return 0;
    }
    let body_len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    body_len + FRAME_HEADER_SIZE
}

/// Reserve a length prefix and return its offset for [`finish_frame`]
pub fn begin_frame(buf: &mut BytesMut) -> usize {
    let start = buf.len();
    buf.put_u32_le(0);
    start
}

/// Patch the length prefix written by [`begin_frame`]
pub fn finish_frame(buf: &mut BytesMut, start: usize, max_packet_size: usize) -> Result<(), WireError> {
    let body_len = buf.len() - start - FRAME_HEADER_SIZE;
    if body_len > max_packet_size {
        buf.truncate(start);
        return Err(WireError::Size(body_len));
    }
    buf[start..start + FRAME_HEADER_SIZE].copy_from_slice(&(body_len as u32).to_le_bytes());
    Ok(())
}

/// Split one complete frame body off the head of `buf`.
///
/// Returns `Ok(None)` while the frame is still incomplete.
pub fn split_frame(buf: &mut BytesMut, max_packet_size: usize) -> Result<Option<Bytes>, WireError> {
    let total = peek_len(buf);
    if total == 0 {
        return Ok(None);
    }

    // Check frame size limits
    let body_len = total - FRAME_HEADER_SIZE;
    if body_len > max_packet_size {
        return Err(WireError::Size(body_len));
    }
    if body_len == 0 {
        return Err(WireError::Malformed);
    }

    // Check if we have the complete frame
    if buf.len() < total {
        return Ok(None);
    }

    buf.advance(FRAME_HEADER_SIZE);
    Ok(Some(buf.split_to(body_len).freeze()))
}
