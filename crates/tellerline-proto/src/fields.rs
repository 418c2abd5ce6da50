//! Fixed-width credential and inventory fields.
//!
//! PINs and device identities have frozen widths on the wire (8 and 36
//! bytes) so they interoperate with the device firmware's fixed buffers.
//! Constructors validate once; after that the types guarantee their shape.
//!
//! Comparison is ordinary byte equality, matching the firmware. That is a
//! timing side channel; see the workspace DESIGN notes before "fixing" it.

use std::fmt;

use crate::errors::{ProtocolError, Result};

/// PIN width in bytes (ASCII digits).
pub const PIN_LEN: usize = 8;

/// Device identity width in bytes (UUID string form).
pub const DEVICE_ID_LEN: usize = 36;

/// Maximum bill body width in bytes.
pub const BILL_MAX_LEN: usize = 16;

/// Strip trailing NUL padding from a wire field.
///
/// The firmware NUL-terminates variable-position fields inside fixed
/// buffers; receivers compare the unpadded bytes.
#[must_use]
pub fn strip_padding(msg: &[u8]) -> &[u8] {
    let end = msg.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
    &msg[..end]
}

/// An eight-digit ASCII PIN.
///
/// Mutable only through the authenticated change-PIN operation; this type
/// itself is immutable once parsed.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Pin([u8; PIN_LEN]);

impl Pin {
    /// Parse a PIN from text.
    ///
    /// # Errors
    ///
    /// - [`ProtocolError::InvalidPin`] unless exactly eight ASCII digits.
    pub fn new(digits: &str) -> Result<Self> {
        let bytes = digits.as_bytes();
        if bytes.len() != PIN_LEN || !bytes.iter().all(u8::is_ascii_digit) {
            return Err(ProtocolError::InvalidPin);
        }

        let mut pin = [0u8; PIN_LEN];
        pin.copy_from_slice(bytes);
        Ok(Self(pin))
    }

    /// Raw wire bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; PIN_LEN] {
        &self.0
    }
}

// Never print PIN digits, even in debug output.
impl fmt::Debug for Pin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Pin(********)")
    }
}

/// A 36-byte opaque device identity (card or HSM UUID).
///
/// Immutable once provisioned; compared by exact byte equality.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId([u8; DEVICE_ID_LEN]);

impl DeviceId {
    /// Parse an identity from text.
    ///
    /// # Errors
    ///
    /// - [`ProtocolError::InvalidDeviceId`] unless exactly 36 printable
    ///   ASCII bytes.
    pub fn new(id: &str) -> Result<Self> {
        Self::from_wire(id.as_bytes())
    }

    /// Parse an identity from a received frame body, stripping NUL padding.
    ///
    /// # Errors
    ///
    /// - [`ProtocolError::InvalidDeviceId`] if the unpadded body is not
    ///   exactly 36 printable ASCII bytes.
    pub fn from_wire(msg: &[u8]) -> Result<Self> {
        let body = strip_padding(msg);
        if body.len() != DEVICE_ID_LEN || !body.iter().all(|b| b.is_ascii_graphic()) {
            return Err(ProtocolError::InvalidDeviceId);
        }

        let mut id = [0u8; DEVICE_ID_LEN];
        id.copy_from_slice(body);
        Ok(Self(id))
    }

    /// Raw wire bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; DEVICE_ID_LEN] {
        &self.0
    }

    /// Identity as text (constructor guarantees printable ASCII).
    #[must_use]
    pub fn as_str(&self) -> &str {
        // Printable ASCII by construction.
        std::str::from_utf8(&self.0).unwrap_or("<non-ascii identity>")
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceId({})", self.as_str())
    }
}

/// A single cash bill: opaque bytes, 1 to 16 long.
///
/// The HSM stores bills as an ordered, consumable FIFO sequence.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Bill(Vec<u8>);

impl Bill {
    /// Validate and wrap a bill body.
    ///
    /// # Errors
    ///
    /// - [`ProtocolError::InvalidBill`] if empty or longer than
    ///   [`BILL_MAX_LEN`].
    pub fn new(body: impl Into<Vec<u8>>) -> Result<Self> {
        let body = body.into();
        if body.is_empty() || body.len() > BILL_MAX_LEN {
            return Err(ProtocolError::InvalidBill { len: body.len(), max: BILL_MAX_LEN });
        }
        Ok(Self(body))
    }

    /// Parse a bill from a received frame body.
    ///
    /// # Errors
    ///
    /// - [`ProtocolError::InvalidBill`] if the body width is invalid.
    pub fn from_wire(msg: &[u8]) -> Result<Self> {
        Self::new(msg)
    }

    /// Raw wire bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}
