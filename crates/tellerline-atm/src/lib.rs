//! Withdrawal orchestration and ledger for the Tellerline ATM system.
//!
//! [`Atm`] sequences the card protocol, the [`Ledger`], and the HSM
//! protocol for balance checks, PIN changes, withdrawals, and device
//! provisioning. The ledger is the sole serialization point across
//! concurrent operations; device links serialize themselves.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod atm;
pub mod ledger;

pub use atm::{Atm, AtmError, MAX_DISPENSE};
pub use ledger::{DebitAuthorization, Ledger, LedgerError, MemoryLedger};
