//! Handshake tags, op-codes, and ASCII wire literals.
//!
//! The sync tag a device reports after `READY` answers two questions at
//! once: what kind of device is attached, and whether it has been
//! provisioned. The `_P` suffix means the device is still in provisioning
//! (factory) mode; `_N` means normal operation. Tag bytes are frozen for
//! firmware compatibility.

use crate::fields::strip_padding;

/// ASCII literals exchanged on device links.
///
/// Controller-sent literals carry the firmware's expected NUL terminator.
pub mod literals {
    /// Controller sync request.
    pub const READY: &[u8] = b"READY\0";
    /// Controller sync confirmation after a tag match.
    pub const GO: &[u8] = b"GO\0";
    /// Single-byte step acknowledgment.
    pub const ACK: &[u8] = b"K";
    /// Card PIN accepted.
    pub const PIN_OK: &[u8] = b"OK";
    /// Refusal: bad PIN, bad identity, or insufficient inventory.
    pub const BAD: &[u8] = b"BAD";
    /// Card PIN change committed.
    pub const SUCCESS: &[u8] = b"SUCCESS";
    /// Device is ready to be provisioned; also the HSM's "no identity yet"
    /// sentinel during normal-mode identity disclosure.
    pub const PROVISION: &[u8] = b"P";
}

/// Kind of peripheral on the far end of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    /// ATM card (PIN-holding authentication token).
    Card,
    /// Cash-dispensing security module.
    Hsm,
}

/// Which mode a session expects the device to be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    /// One-time factory initialization.
    Provisioning,
    /// Normal post-provisioning operation.
    Operational,
}

/// Device state tag reported during the sync handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTag {
    /// `CARD_P`: card awaiting provisioning.
    CardUnprovisioned,
    /// `CARD_N`: provisioned card in normal operation.
    CardProvisioned,
    /// `HSM_P`: HSM awaiting provisioning.
    HsmUnprovisioned,
    /// `HSM_N`: provisioned HSM in normal operation.
    HsmProvisioned,
}

impl SyncTag {
    /// Wire bytes for this tag.
    #[must_use]
    pub const fn as_bytes(self) -> &'static [u8] {
        match self {
            Self::CardUnprovisioned => b"CARD_P",
            Self::CardProvisioned => b"CARD_N",
            Self::HsmUnprovisioned => b"HSM_P",
            Self::HsmProvisioned => b"HSM_N",
        }
    }

    /// Parse a received frame body as a sync tag, ignoring NUL padding.
    ///
    /// `None` for anything else (garbage, echoes, protocol messages); the
    /// handshake treats that as a retry, not an error.
    #[must_use]
    pub fn parse(msg: &[u8]) -> Option<Self> {
        match strip_padding(msg) {
            b"CARD_P" => Some(Self::CardUnprovisioned),
            b"CARD_N" => Some(Self::CardProvisioned),
            b"HSM_P" => Some(Self::HsmUnprovisioned),
            b"HSM_N" => Some(Self::HsmProvisioned),
            _ => None,
        }
    }

    /// The tag a device of `kind` reports when in `mode`.
    #[must_use]
    pub const fn expected(kind: DeviceKind, mode: SessionMode) -> Self {
        match (kind, mode) {
            (DeviceKind::Card, SessionMode::Provisioning) => Self::CardUnprovisioned,
            (DeviceKind::Card, SessionMode::Operational) => Self::CardProvisioned,
            (DeviceKind::Hsm, SessionMode::Provisioning) => Self::HsmUnprovisioned,
            (DeviceKind::Hsm, SessionMode::Operational) => Self::HsmProvisioned,
        }
    }

    /// Device kind this tag names.
    #[must_use]
    pub const fn kind(self) -> DeviceKind {
        match self {
            Self::CardUnprovisioned | Self::CardProvisioned => DeviceKind::Card,
            Self::HsmUnprovisioned | Self::HsmProvisioned => DeviceKind::Hsm,
        }
    }

    /// Mode this tag reports.
    #[must_use]
    pub const fn mode(self) -> SessionMode {
        match self {
            Self::CardUnprovisioned | Self::HsmUnprovisioned => SessionMode::Provisioning,
            Self::CardProvisioned | Self::HsmProvisioned => SessionMode::Operational,
        }
    }
}

/// Card operation op-codes, sent as a single ASCII digit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardOp {
    /// Disclose identity for a balance check.
    CheckBalance,
    /// Disclose identity for a withdrawal.
    Withdraw,
    /// Replace the stored PIN.
    ChangePin,
}

impl CardOp {
    /// Wire byte for this op-code.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        match self {
            Self::CheckBalance => b'1',
            Self::Withdraw => b'2',
            Self::ChangePin => b'3',
        }
    }

    /// Parse a received op-code byte.
    #[must_use]
    pub const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            b'1' => Some(Self::CheckBalance),
            b'2' => Some(Self::Withdraw),
            b'3' => Some(Self::ChangePin),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_round_trip() {
        for tag in [
            SyncTag::CardUnprovisioned,
            SyncTag::CardProvisioned,
            SyncTag::HsmUnprovisioned,
            SyncTag::HsmProvisioned,
        ] {
            assert_eq!(SyncTag::parse(tag.as_bytes()), Some(tag));
            assert_eq!(SyncTag::expected(tag.kind(), tag.mode()), tag);
        }
    }

    #[test]
    fn tag_parse_ignores_nul_padding() {
        assert_eq!(SyncTag::parse(b"CARD_N\0\0"), Some(SyncTag::CardProvisioned));
    }

    #[test]
    fn tag_parse_rejects_other_messages() {
        assert_eq!(SyncTag::parse(b"READY"), None);
        assert_eq!(SyncTag::parse(b"CARD_X"), None);
        assert_eq!(SyncTag::parse(b""), None);
    }

    #[test]
    fn provisioning_suffix_means_unprovisioned() {
        // The `_P` tag is the factory state; `_N` is post-provisioning.
        assert_eq!(SyncTag::parse(b"CARD_P").map(SyncTag::mode), Some(SessionMode::Provisioning));
        assert_eq!(SyncTag::parse(b"HSM_N").map(SyncTag::mode), Some(SessionMode::Operational));
    }

    #[test]
    fn card_op_bytes() {
        for op in [CardOp::CheckBalance, CardOp::Withdraw, CardOp::ChangePin] {
            assert_eq!(CardOp::from_byte(op.as_byte()), Some(op));
        }
        assert_eq!(CardOp::from_byte(b'4'), None);
        assert_eq!(CardOp::from_byte(0x01), None);
    }
}
