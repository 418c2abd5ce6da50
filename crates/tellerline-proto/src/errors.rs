//! Protocol error types.
//!
//! Strongly-typed errors for frame and field validation. Transport failures
//! (device removal, timeouts) live in `tellerline-core`; everything here is a
//! property of the bytes themselves.

use thiserror::Error;

/// Errors produced while encoding or decoding wire data.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Frame body exceeds the one-byte length prefix range.
    #[error("message too large for frame: {len} bytes > {max}")]
    MessageTooLarge {
        /// Actual body length.
        len: usize,
        /// Maximum representable body length (255).
        max: usize,
    },

    /// Stream ended mid-message; the session is desynchronized.
    #[error("short read: expected {expected} bytes, got {actual}")]
    ShortRead {
        /// Bytes the header promised.
        expected: usize,
        /// Bytes actually available.
        actual: usize,
    },

    /// PIN is not exactly eight ASCII digits.
    #[error("invalid PIN: expected exactly 8 ASCII digits")]
    InvalidPin,

    /// Device identity is not exactly 36 printable ASCII bytes.
    #[error("invalid device identity: expected exactly 36 printable bytes")]
    InvalidDeviceId,

    /// Bill body is empty or longer than the inventory slot width.
    #[error("invalid bill: {len} bytes outside 1..={max}")]
    InvalidBill {
        /// Actual bill length.
        len: usize,
        /// Maximum bill length (16).
        max: usize,
    },

    /// Card operation byte is not one of the known op-codes.
    #[error("unknown card op-code: {0:#04x}")]
    UnknownOpcode(u8),

    /// Bank wire message has a bad opcode or a truncated fixed-width body.
    #[error("malformed bank wire message")]
    MalformedBankMessage,
}

/// Result alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;
