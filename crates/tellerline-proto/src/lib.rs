//! Wire protocol for Tellerline device links.
//!
//! Defines everything that crosses a byte-oriented link between the ATM
//! controller and its peripherals (card, HSM): the one-byte length-prefix
//! framing, the sync tags exchanged during the handshake, the fixed-width
//! credential fields, and the ASCII literals the device firmware understands.
//! Also provides the fixed-layout bank wire codec.
//!
//! The formats here are frozen for interoperability with existing device
//! firmware: tags are ASCII, PINs are exactly 8 digits, identities are
//! exactly 36 bytes (UUID string form), and no frame body may exceed 255
//! bytes. Change nothing without a firmware revision.
//!
//! This crate is pure data: no I/O, no async, no clocks. The link layer in
//! `tellerline-core` drives these codecs over real or emulated channels.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod bank;
mod errors;
mod fields;
mod frame;
mod message;

pub use errors::{ProtocolError, Result};
pub use fields::{BILL_MAX_LEN, Bill, DEVICE_ID_LEN, DeviceId, PIN_LEN, Pin, strip_padding};
pub use frame::{MAX_PAYLOAD, encode_frame, payload_len};
pub use message::{CardOp, DeviceKind, SessionMode, SyncTag, literals};
