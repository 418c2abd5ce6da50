//! Account and terminal ledger.
//!
//! The ledger is the single serialization point of a withdrawal: the
//! balance check, the inventory check, and both decrements happen inside
//! one [`Ledger::debit`] call, so two concurrent withdrawals can never
//! both pass the check against a stale balance.

use std::{
    collections::HashMap,
    sync::{Mutex, PoisonError},
};

use serde::{Deserialize, Serialize};
use tellerline_proto::DeviceId;
use thiserror::Error;
use tracing::{debug, info};

/// Refusals and failures from the ledger.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// No account exists for the card identity.
    #[error("unknown account")]
    UnknownAccount,

    /// No terminal record exists for the HSM identity.
    #[error("unknown terminal")]
    UnknownTerminal,

    /// The account balance cannot cover the request.
    #[error("insufficient funds: balance {balance}, requested {requested}")]
    InsufficientFunds {
        /// Balance at the time of the check.
        balance: u32,
        /// Amount requested.
        requested: u32,
    },

    /// The terminal's recorded bill inventory cannot cover the request.
    #[error("insufficient terminal inventory: {available} bills, requested {requested}")]
    InsufficientInventory {
        /// Bills recorded for the terminal.
        available: u32,
        /// Bills requested.
        requested: u32,
    },

    /// An account already exists for the card identity.
    #[error("account already exists")]
    AccountExists,

    /// A terminal record already exists for the HSM identity.
    #[error("terminal already exists")]
    TerminalExists,
}

/// Proof of a successful debit, carrying the terminal identity the debit
/// was booked against. Dispensing challenges the HSM with this identity,
/// never with the caller-supplied one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebitAuthorization {
    /// Terminal the inventory was decremented for.
    pub terminal: DeviceId,
}

/// Stored state of one card account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountRecord {
    /// Current balance, in bills.
    pub balance: u32,
}

/// Stored state of one terminal (HSM) inventory mirror.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalRecord {
    /// Bills the ledger believes the terminal holds.
    pub inventory: u32,
}

/// Authoritative balance and inventory store.
///
/// # Invariants
///
/// - Balances and inventories never go negative.
/// - [`debit`](Self::debit) decrements the account and the terminal by
///   exactly `amount`, or neither.
pub trait Ledger: Send + Sync + 'static {
    /// Current balance of `card`'s account.
    ///
    /// # Errors
    ///
    /// [`LedgerError::UnknownAccount`].
    fn balance_of(&self, card: &DeviceId) -> Result<u32, LedgerError>;

    /// Bills recorded for `terminal`.
    ///
    /// # Errors
    ///
    /// [`LedgerError::UnknownTerminal`].
    fn terminal_inventory(&self, terminal: &DeviceId) -> Result<u32, LedgerError>;

    /// Atomically debit `card` by `amount` and decrement `terminal`'s
    /// inventory by the same, after checking both can cover it.
    ///
    /// # Errors
    ///
    /// [`LedgerError::UnknownTerminal`], [`LedgerError::UnknownAccount`],
    /// [`LedgerError::InsufficientInventory`], or
    /// [`LedgerError::InsufficientFunds`]. On any of these nothing is
    /// changed.
    fn debit(
        &self,
        terminal: &DeviceId,
        card: &DeviceId,
        amount: u32,
    ) -> Result<DebitAuthorization, LedgerError>;

    /// Overwrite the balance of an existing account.
    ///
    /// # Errors
    ///
    /// [`LedgerError::UnknownAccount`].
    fn set_balance(&self, card: &DeviceId, balance: u32) -> Result<(), LedgerError>;

    /// Create an account for a freshly provisioned card.
    ///
    /// # Errors
    ///
    /// [`LedgerError::AccountExists`].
    fn create_account(&self, card: &DeviceId, balance: u32) -> Result<(), LedgerError>;

    /// Create an inventory record for a freshly provisioned terminal.
    ///
    /// # Errors
    ///
    /// [`LedgerError::TerminalExists`].
    fn create_terminal(&self, terminal: &DeviceId, inventory: u32) -> Result<(), LedgerError>;
}

#[derive(Default)]
struct Books {
    accounts: HashMap<DeviceId, AccountRecord>,
    terminals: HashMap<DeviceId, TerminalRecord>,
}

/// In-memory [`Ledger`].
///
/// One mutex over both maps keeps a debit's check and decrement in a
/// single critical section.
#[derive(Default)]
pub struct MemoryLedger {
    books: Mutex<Books>,
}

impl MemoryLedger {
    /// Empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Books> {
        self.books.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Ledger for MemoryLedger {
    fn balance_of(&self, card: &DeviceId) -> Result<u32, LedgerError> {
        let books = self.lock();
        books.accounts.get(card).map(|a| a.balance).ok_or(LedgerError::UnknownAccount)
    }

    fn terminal_inventory(&self, terminal: &DeviceId) -> Result<u32, LedgerError> {
        let books = self.lock();
        books.terminals.get(terminal).map(|t| t.inventory).ok_or(LedgerError::UnknownTerminal)
    }

    fn debit(
        &self,
        terminal: &DeviceId,
        card: &DeviceId,
        amount: u32,
    ) -> Result<DebitAuthorization, LedgerError> {
        let mut books = self.lock();

        let inventory =
            books.terminals.get(terminal).map(|t| t.inventory).ok_or(LedgerError::UnknownTerminal)?;
        if inventory < amount {
            debug!(%terminal, inventory, amount, "debit refused: terminal shortfall");
            return Err(LedgerError::InsufficientInventory {
                available: inventory,
                requested: amount,
            });
        }

        let balance =
            books.accounts.get(card).map(|a| a.balance).ok_or(LedgerError::UnknownAccount)?;
        if balance < amount {
            debug!(%card, balance, amount, "debit refused: insufficient funds");
            return Err(LedgerError::InsufficientFunds { balance, requested: amount });
        }

        // Both lookups succeeded above; the entries are present.
        if let Some(t) = books.terminals.get_mut(terminal) {
            t.inventory = inventory - amount;
        }
        if let Some(a) = books.accounts.get_mut(card) {
            a.balance = balance - amount;
        }
        info!(%terminal, %card, amount, "debit booked");
        Ok(DebitAuthorization { terminal: *terminal })
    }

    fn set_balance(&self, card: &DeviceId, balance: u32) -> Result<(), LedgerError> {
        let mut books = self.lock();
        let account = books.accounts.get_mut(card).ok_or(LedgerError::UnknownAccount)?;
        account.balance = balance;
        Ok(())
    }

    fn create_account(&self, card: &DeviceId, balance: u32) -> Result<(), LedgerError> {
        let mut books = self.lock();
        if books.accounts.contains_key(card) {
            return Err(LedgerError::AccountExists);
        }
        books.accounts.insert(*card, AccountRecord { balance });
        info!(%card, balance, "account created");
        Ok(())
    }

    fn create_terminal(&self, terminal: &DeviceId, inventory: u32) -> Result<(), LedgerError> {
        let mut books = self.lock();
        if books.terminals.contains_key(terminal) {
            return Err(LedgerError::TerminalExists);
        }
        books.terminals.insert(*terminal, TerminalRecord { inventory });
        info!(%terminal, inventory, "terminal created");
        Ok(())
    }
}
