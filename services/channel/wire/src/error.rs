//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Size limit exceeded
    #[error("size limit exceeded: {0}")]
    Size(usize),

    /// Unknown packet type tag
    #[error("unknown type {0}")]
    Type(u8),

    /// 7-bit encoded integer longer than 5 bytes or out of range
    #[error("varint overflow")]
    Varint,

    /// String field is not valid UTF-8
    #[error("string is not valid utf-8")]
    Utf8,

    /// Malformed packet structure
    #[error("malformed packet")]
    Malformed,
}
