//! Bank wire codec.
//!
//! Fixed-layout request/response records for the bank link: a one-byte
//! ASCII opcode followed by fixed-width big-endian fields. Identities are
//! raw 36-byte fields; amounts are 4-byte unsigned big-endian. Responses
//! open with a one-byte status: `O` okay, `N` refused, `E` error.
//!
//! Pure codec only. The transport that carries these records is out of
//! scope; the in-process [`Ledger`](../../tellerline-atm) collaborator is
//! the usual consumer, and this codec exists so a networked bank can speak
//! the same records.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::{
    errors::{ProtocolError, Result},
    fields::{DEVICE_ID_LEN, DeviceId},
};

/// Balance lookup opcode.
const OP_BALANCE: u8 = b'b';
/// Withdrawal authorization opcode.
const OP_WITHDRAW: u8 = b'w';

/// Response status: request authorized.
const STATUS_OKAY: u8 = b'O';
/// Response status: request refused (business rule).
const STATUS_REFUSED: u8 = b'N';
/// Response status: request malformed or unprocessable.
const STATUS_ERROR: u8 = b'E';

/// Fixed-width body of a withdrawal request (Big Endian amount).
///
/// All fields are byte arrays, so the struct has no padding and can be
/// safely cast from untrusted wire bytes.
#[repr(C)]
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct WithdrawBody {
    hsm_id: [u8; DEVICE_ID_LEN],
    card_id: [u8; DEVICE_ID_LEN],
    amount: [u8; 4],
}

/// A request on the bank link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BankRequest {
    /// `b` + card identity: look up an account balance.
    Balance {
        /// Account being queried.
        card_id: DeviceId,
    },
    /// `w` + HSM identity + card identity + amount: authorize a debit.
    Withdraw {
        /// Terminal requesting the dispense.
        hsm_id: DeviceId,
        /// Account being debited.
        card_id: DeviceId,
        /// Bill count to debit.
        amount: u32,
    },
}

impl BankRequest {
    /// Encode to wire bytes.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::Balance { card_id } => {
                let mut out = Vec::with_capacity(1 + DEVICE_ID_LEN);
                out.push(OP_BALANCE);
                out.extend_from_slice(card_id.as_bytes());
                out
            },
            Self::Withdraw { hsm_id, card_id, amount } => {
                let body = WithdrawBody {
                    hsm_id: *hsm_id.as_bytes(),
                    card_id: *card_id.as_bytes(),
                    amount: amount.to_be_bytes(),
                };
                let mut out = Vec::with_capacity(1 + std::mem::size_of::<WithdrawBody>());
                out.push(OP_WITHDRAW);
                out.extend_from_slice(body.as_bytes());
                out
            },
        }
    }

    /// Decode from wire bytes.
    ///
    /// # Errors
    ///
    /// - [`ProtocolError::MalformedBankMessage`] on unknown opcode or a
    ///   body that is not exactly the fixed width.
    /// - [`ProtocolError::InvalidDeviceId`] if an identity field is not a
    ///   valid 36-byte identity.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let (&opcode, body) =
            bytes.split_first().ok_or(ProtocolError::MalformedBankMessage)?;

        match opcode {
            OP_BALANCE => {
                if body.len() != DEVICE_ID_LEN {
                    return Err(ProtocolError::MalformedBankMessage);
                }
                Ok(Self::Balance { card_id: DeviceId::from_wire(body)? })
            },
            OP_WITHDRAW => {
                let body = WithdrawBody::ref_from_bytes(body)
                    .map_err(|_| ProtocolError::MalformedBankMessage)?;

                Ok(Self::Withdraw {
                    hsm_id: DeviceId::from_wire(&body.hsm_id)?,
                    card_id: DeviceId::from_wire(&body.card_id)?,
                    amount: u32::from_be_bytes(body.amount),
                })
            },
            _ => Err(ProtocolError::MalformedBankMessage),
        }
    }
}

/// A response on the bank link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BankResponse {
    /// `O` + 4-byte balance: balance lookup succeeded.
    BalanceOkay {
        /// Current account balance.
        balance: u32,
    },
    /// `O` + 36-byte identity echo: debit authorized; the echoed terminal
    /// identity is the authorization proof the HSM challenge reuses.
    WithdrawOkay {
        /// Echoed terminal identity.
        hsm_id: DeviceId,
    },
    /// `N`: refused by a business rule (no payload detail on the wire).
    Refused,
    /// `E`: the request itself could not be processed.
    Error,
}

impl BankResponse {
    /// Encode to wire bytes.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::BalanceOkay { balance } => {
                let mut out = Vec::with_capacity(5);
                out.push(STATUS_OKAY);
                out.extend_from_slice(&balance.to_be_bytes());
                out
            },
            Self::WithdrawOkay { hsm_id } => {
                let mut out = Vec::with_capacity(1 + DEVICE_ID_LEN);
                out.push(STATUS_OKAY);
                out.extend_from_slice(hsm_id.as_bytes());
                out
            },
            Self::Refused => vec![STATUS_REFUSED],
            Self::Error => vec![STATUS_ERROR],
        }
    }

    /// Decode the response to a [`BankRequest`], which fixes the expected
    /// okay-payload shape.
    ///
    /// # Errors
    ///
    /// - [`ProtocolError::MalformedBankMessage`] on an unknown status byte
    ///   or a payload of the wrong width for the request.
    pub fn decode(request: &BankRequest, bytes: &[u8]) -> Result<Self> {
        let (&status, body) =
            bytes.split_first().ok_or(ProtocolError::MalformedBankMessage)?;

        match status {
            STATUS_REFUSED if body.is_empty() => Ok(Self::Refused),
            STATUS_ERROR if body.is_empty() => Ok(Self::Error),
            STATUS_OKAY => match request {
                BankRequest::Balance { .. } => {
                    let amount: [u8; 4] =
                        body.try_into().map_err(|_| ProtocolError::MalformedBankMessage)?;
                    Ok(Self::BalanceOkay { balance: u32::from_be_bytes(amount) })
                },
                BankRequest::Withdraw { .. } => {
                    if body.len() != DEVICE_ID_LEN {
                        return Err(ProtocolError::MalformedBankMessage);
                    }
                    Ok(Self::WithdrawOkay { hsm_id: DeviceId::from_wire(body)? })
                },
            },
            _ => Err(ProtocolError::MalformedBankMessage),
        }
    }
}
