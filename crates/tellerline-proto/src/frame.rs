//! Length-prefixed framing.
//!
//! Every message on a device link is a single frame: one unsigned length
//! byte followed by that many body bytes. A frame body may be empty and may
//! never exceed 255 bytes. The link layer reads exactly one header byte and
//! then exactly the promised body; anything shorter is a fatal
//! [`ProtocolError::ShortRead`].

use crate::errors::{ProtocolError, Result};

/// Maximum frame body size (one-byte length prefix).
pub const MAX_PAYLOAD: usize = 255;

/// Encode a payload as a wire frame: `[len: u8][body: len bytes]`.
///
/// # Errors
///
/// - [`ProtocolError::MessageTooLarge`] if the payload exceeds
///   [`MAX_PAYLOAD`].
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>> {
    let len =
        u8::try_from(payload.len()).map_err(|_| ProtocolError::MessageTooLarge {
            len: payload.len(),
            max: MAX_PAYLOAD,
        })?;

    let mut frame = Vec::with_capacity(1 + payload.len());
    frame.push(len);
    frame.extend_from_slice(payload);

    debug_assert_eq!(frame.len(), 1 + payload.len());

    Ok(frame)
}

/// Body length promised by a frame header byte.
#[must_use]
pub fn payload_len(header: u8) -> usize {
    usize::from(header)
}
