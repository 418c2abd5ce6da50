//! Error types for the device link layer.
//!
//! [`LinkError`] covers transport and handshake failures shared by every
//! device role; [`HsmError`] adds the HSM's business refusals on top.
//! Raw `std::io::Error` never crosses this boundary: any I/O failure on a
//! link means the device is gone, and is reported as such.

use std::time::Duration;

use tellerline_proto::ProtocolError;
use thiserror::Error;

/// Errors surfaced by a device link or a protocol exchange over it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    /// The physical or virtual link dropped before or during an operation.
    /// Always retryable by re-attaching the device; never retried here.
    #[error("device removed")]
    DeviceRemoved,

    /// Handshake expected a provisioned device but found a factory one.
    #[error("device not provisioned")]
    NotProvisioned,

    /// Handshake expected a factory device but found a provisioned one.
    #[error("device already provisioned")]
    AlreadyProvisioned,

    /// The sync retry loop exhausted its attempt budget without a usable
    /// tag. The original firmware protocol would spin forever here; we
    /// bound it.
    #[error("sync handshake exhausted after {attempts} attempts")]
    SyncExhausted {
        /// Attempts made before giving up.
        attempts: u32,
    },

    /// The peer went silent mid-exchange.
    #[error("read timed out after {elapsed:?}")]
    ReadTimeout {
        /// Configured timeout that elapsed.
        elapsed: Duration,
    },

    /// The device replied with something the protocol does not allow at
    /// this step. Fatal to the session; the caller must re-sync.
    #[error("protocol desync at {step}: unexpected reply {got:?}")]
    Desync {
        /// Protocol step that observed the bad reply.
        step: &'static str,
        /// Lossy rendering of the offending bytes.
        got: String,
    },

    /// Malformed frame or field (short read, bad width).
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl LinkError {
    /// Build a [`LinkError::Desync`] from the offending reply bytes.
    #[must_use]
    pub fn desync(step: &'static str, got: &[u8]) -> Self {
        Self::Desync { step, got: String::from_utf8_lossy(got).into_owned() }
    }

    /// True if the failure invalidates the installed channel (the link
    /// must be dropped and re-acquired before further I/O).
    #[must_use]
    pub fn is_fatal_to_session(&self) -> bool {
        matches!(
            self,
            Self::DeviceRemoved | Self::Protocol(ProtocolError::ShortRead { .. })
        )
    }
}

/// Errors surfaced by HSM dispensing on top of the link layer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HsmError {
    /// The challenge identity did not match the HSM's stored identity.
    #[error("HSM rejected the challenge identity")]
    AuthFailure,

    /// The HSM holds fewer bills than requested; nothing was dispensed.
    #[error("insufficient bill inventory in HSM")]
    InsufficientInventory,

    /// Underlying link failure.
    #[error(transparent)]
    Link(#[from] LinkError),
}
