//! Withdrawal orchestration.
//!
//! Sequences the card, the ledger, and the HSM so that no step's success
//! is assumed without the previous step's proof: the card must disclose
//! its identity before the ledger is asked, the ledger must book the
//! debit before the HSM is asked to dispense, and the dispense challenge
//! uses the identity echoed back by the debit authorization.
//!
//! Nothing here retries. A device removal mid-call unwinds the whole
//! operation with its typed cause and the caller decides whether to start
//! over from the card.

use tellerline_proto::{Bill, DeviceId, DeviceKind, Pin};
use thiserror::Error;
use tracing::{info, warn};

use tellerline_core::{CardClient, Environment, HsmClient, HsmError, LinkError};

use crate::ledger::{Ledger, LedgerError};

/// Largest bill count a single dispense can carry (one wire byte).
pub const MAX_DISPENSE: u32 = 255;

/// Failures of an ATM operation, by cause.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AtmError {
    /// The required device is not attached.
    #[error("no {0:?} device attached")]
    NotAttached(DeviceKind),

    /// Requested bill count outside `1..=255`.
    #[error("invalid amount {amount}: must be 1..={MAX_DISPENSE}")]
    InvalidAmount {
        /// Amount requested.
        amount: u32,
    },

    /// The card refused the PIN.
    #[error("card refused the PIN")]
    BadPin,

    /// The HSM is attached but reports no identity (unprovisioned).
    #[error("HSM has no identity")]
    HsmUnavailable,

    /// The ledger refused or failed the request.
    #[error("ledger refused: {0}")]
    Ledger(#[from] LedgerError),

    /// Card-side link or protocol failure.
    #[error("card failure: {0}")]
    Card(#[source] LinkError),

    /// HSM-side link, protocol, or dispense failure.
    #[error("HSM failure: {0}")]
    Hsm(#[source] HsmError),
}

/// One ATM terminal: a card slot, an HSM bay, and the ledger they answer to.
pub struct Atm<E: Environment, L: Ledger> {
    card: CardClient<E>,
    hsm: HsmClient<E>,
    ledger: L,
}

impl<E: Environment, L: Ledger> Atm<E, L> {
    /// Assemble a terminal from its device clients and ledger.
    #[must_use]
    pub fn new(card: CardClient<E>, hsm: HsmClient<E>, ledger: L) -> Self {
        Self { card, hsm, ledger }
    }

    /// The card client, mainly for attach state and provisioning flows.
    #[must_use]
    pub fn card(&self) -> &CardClient<E> {
        &self.card
    }

    /// The HSM client.
    #[must_use]
    pub fn hsm(&self) -> &HsmClient<E> {
        &self.hsm
    }

    /// The ledger.
    #[must_use]
    pub fn ledger(&self) -> &L {
        &self.ledger
    }

    /// Balance of the account behind the inserted card.
    ///
    /// # Errors
    ///
    /// [`AtmError::NotAttached`], [`AtmError::BadPin`], a ledger refusal,
    /// or a card failure.
    pub async fn check_balance(&self, pin: &Pin) -> Result<u32, AtmError> {
        self.require_attached(DeviceKind::Card)?;

        let card_id = self
            .card
            .check_balance(pin)
            .await
            .map_err(AtmError::Card)?
            .ok_or(AtmError::BadPin)?;
        let balance = self.ledger.balance_of(&card_id)?;
        info!(%card_id, balance, "balance disclosed");
        Ok(balance)
    }

    /// Change the inserted card's PIN.
    ///
    /// # Errors
    ///
    /// [`AtmError::NotAttached`], [`AtmError::BadPin`] when `old_pin` is
    /// refused, or a card failure.
    pub async fn change_pin(&self, old_pin: &Pin, new_pin: &Pin) -> Result<(), AtmError> {
        self.require_attached(DeviceKind::Card)?;

        if self.card.change_pin(old_pin, new_pin).await.map_err(AtmError::Card)? {
            Ok(())
        } else {
            Err(AtmError::BadPin)
        }
    }

    /// Withdraw `amount` bills against the inserted card.
    ///
    /// The debit is booked before the HSM dispenses; a dispense failure
    /// after a booked debit is surfaced as an HSM failure (the bills never
    /// left the bay, but the ledger reflects the authorization).
    ///
    /// # Errors
    ///
    /// Every step has a typed cause: [`AtmError::NotAttached`],
    /// [`AtmError::InvalidAmount`], [`AtmError::BadPin`],
    /// [`AtmError::HsmUnavailable`], a ledger refusal, or a device
    /// failure.
    pub async fn withdraw(&self, pin: &Pin, amount: u32) -> Result<Vec<Bill>, AtmError> {
        self.require_attached(DeviceKind::Hsm)?;
        self.require_attached(DeviceKind::Card)?;
        let Ok(count) = u8::try_from(amount) else {
            return Err(AtmError::InvalidAmount { amount });
        };
        if count == 0 {
            return Err(AtmError::InvalidAmount { amount });
        }

        let card_id =
            self.card.withdraw(pin).await.map_err(AtmError::Card)?.ok_or(AtmError::BadPin)?;
        info!(%card_id, amount, "card authorized withdrawal");

        let hsm_id = self
            .hsm
            .identity()
            .await
            .map_err(AtmError::Hsm)?
            .ok_or(AtmError::HsmUnavailable)?;

        let auth = self.ledger.debit(&hsm_id, &card_id, amount)?;

        let bills = match self.hsm.withdraw(&auth.terminal, count).await {
            Ok(bills) => bills,
            Err(err) => {
                warn!(%card_id, amount, %err, "dispense failed after booked debit");
                return Err(AtmError::Hsm(err));
            },
        };
        info!(%card_id, amount, "withdrawal dispensed");
        Ok(bills)
    }

    /// Provision a factory card and open its account.
    ///
    /// # Errors
    ///
    /// [`AtmError::NotAttached`], a card failure (including
    /// already-provisioned), or a ledger refusal.
    pub async fn provision_card(
        &self,
        id: &DeviceId,
        pin: &Pin,
        balance: u32,
    ) -> Result<(), AtmError> {
        self.require_attached(DeviceKind::Card)?;
        self.card.provision(id, pin).await.map_err(AtmError::Card)?;
        self.ledger.create_account(id, balance)?;
        Ok(())
    }

    /// Provision a factory HSM and record its inventory.
    ///
    /// # Errors
    ///
    /// [`AtmError::NotAttached`], [`AtmError::InvalidAmount`] for more
    /// bills than one dispense byte can address, an HSM failure
    /// (including already-provisioned), or a ledger refusal.
    pub async fn provision_atm(&self, id: &DeviceId, bills: &[Bill]) -> Result<(), AtmError> {
        self.require_attached(DeviceKind::Hsm)?;
        let count = u32::try_from(bills.len()).unwrap_or(u32::MAX);
        if count > MAX_DISPENSE {
            return Err(AtmError::InvalidAmount { amount: count });
        }
        self.hsm.provision(id, bills).await.map_err(AtmError::Hsm)?;
        self.ledger.create_terminal(id, count)?;
        Ok(())
    }

    fn require_attached(&self, kind: DeviceKind) -> Result<(), AtmError> {
        let attached = match kind {
            DeviceKind::Card => self.card.link().is_attached(),
            DeviceKind::Hsm => self.hsm.link().is_attached(),
        };
        if attached { Ok(()) } else { Err(AtmError::NotAttached(kind)) }
    }
}
