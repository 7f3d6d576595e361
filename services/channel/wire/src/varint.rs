//! Variable-length integer and string encoding.
//!
//! Integers are written 7 bits at a time, least significant group first, with
//! the high bit of each byte set when more bytes follow. Strings are a varint
//! byte length followed by UTF-8 bytes.

use crate::WireError;
use bytes::{Buf, BufMut};

/// Upper bound on the encoded size of a `u32`
pub const MAX_VARINT_LEN: usize = 5;

/// Exact encoded size of `value`
pub fn varint_len(mut value: u32) -> usize {
    let mut len = 1;
    while value >= 0x80 {
        value >>= 7;
        len += 1;
    }
    len
}

/// Append `value` as a 7-bit encoded integer
pub fn put_varint<B: BufMut>(buf: &mut B, mut value: u32) {
    while value >= 0x80 {
        buf.put_u8((value as u8) | 0x80);
        value >>= 7;
    }
    buf.put_u8(value as u8);
}

/// Read a 7-bit encoded integer
pub fn get_varint<B: Buf>(buf: &mut B) -> Result<u32, WireError> {
    let mut value: u32 = 0;
    for i in 0..MAX_VARINT_LEN {
        if !buf.has_remaining() {
            return Err(WireError::Malformed);
        }
        let byte = buf.get_u8();
        let group = (byte & 0x7F) as u32;

        // The fifth byte may only carry the top 4 bits
        if i == MAX_VARINT_LEN - 1 && group > 0x0F {
            return Err(WireError::Varint);
        }
        value |= group << (7 * i);

        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(WireError::Varint)
}

/// Encoded size of `value` as a length-prefixed string
pub fn string_len(value: &str) -> usize {
    varint_len(value.len() as u32) + value.len()
}

/// Append a length-prefixed UTF-8 string
pub fn put_string<B: BufMut>(buf: &mut B, value: &str) {
    put_varint(buf, value.len() as u32);
    buf.put_slice(value.as_bytes());
}

/// Read a length-prefixed UTF-8 string
pub fn get_string<B: Buf>(buf: &mut B) -> Result<String, WireError> {
    let len = get_varint(buf)? as usize;
    if buf.remaining() < len {
        return Err(WireError::Malformed);
    }
    let mut raw = vec![0u8; len];
    buf.copy_to_slice(&mut raw);
    String::from_utf8(raw).map_err(|_| WireError::Utf8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_varint_boundaries() {
        for (value, expected_len) in [
            (0u32, 1),
            (0x7F, 1),
            (0x80, 2),
            (0x3FFF, 2),
            (0x4000, 3),
            (u32::MAX, 5),
        ] {
            let mut buf = BytesMut::new();
            put_varint(&mut buf, value);
            assert_eq!(buf.len(), expected_len, "value {value:#x}");
            assert_eq!(varint_len(value), expected_len);

            let mut bytes = buf.freeze();
            assert_eq!(get_varint(&mut bytes).unwrap(), value);
            assert!(bytes.is_empty());
        }
    }

    #[test]
    fn test_varint_known_bytes() {
        let mut buf = BytesMut::new();
        put_varint(&mut buf, 300);
        assert_eq!(&buf[..], &[0xAC, 0x02]);
    }

    #[test]
    fn test_varint_overflow() {
        let mut bytes = &[0xFF, 0xFF, 0xFF, 0xFF, 0x7F][..];
        assert_eq!(get_varint(&mut bytes), Err(WireError::Varint));

        let mut bytes = &[0x80, 0x80, 0x80, 0x80, 0x80, 0x01][..];
        assert_eq!(get_varint(&mut bytes), Err(WireError::Varint));
    }

    #[test]
    fn test_varint_truncated() {
        let mut bytes = &[0x80, 0x80][..];
        assert_eq!(get_varint(&mut bytes), Err(WireError::Malformed));
    }

    #[test]
    fn test_string_encoding() {
        let mut buf = BytesMut::new();
        put_string(&mut buf, "token-✓");
        assert_eq!(buf.len(), string_len("token-✓"));

        let mut bytes = buf.freeze();
        assert_eq!(get_string(&mut bytes).unwrap(), "token-✓");
    }

    #[test]
    fn test_string_invalid_utf8() {
        let mut bytes = &[0x02, 0xC3, 0x28][..];
        assert_eq!(get_string(&mut bytes), Err(WireError::Utf8));
    }
}
