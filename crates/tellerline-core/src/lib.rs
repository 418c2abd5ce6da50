//! Device link layer and protocol clients for the Tellerline ATM system.
//!
//! Sits between the raw byte channels of `tellerline-proto` and the
//! withdrawal orchestration in `tellerline-atm`:
//!
//! - [`Channel`]: capability trait for an ordered byte stream (real serial
//!   or in-memory emulation), plus [`PortScanner`] for hot-plug discovery.
//! - [`framed`]: length-prefixed frame push/pull with the device's settle
//!   delay and read timeout.
//! - [`DeviceLink`]: owns one channel behind a lock, watches for
//!   attach/detach, and converts I/O failure into [`LinkError::DeviceRemoved`].
//! - [`sync`]: the READY/tag/GO handshake that disambiguates the four
//!   device states before any session.
//! - [`CardClient`] / [`HsmClient`]: the per-device command/response
//!   protocols, including one-shot provisioning.
//!
//! # Concurrency
//!
//! The link lock is held for one low-level read or write at a time, never
//! across a whole protocol exchange, so attach/detach watchers and a slow
//! in-flight request cannot deadlock each other. A detach during a blocking
//! operation unwinds the protocol call with `DeviceRemoved`; nothing is
//! retried automatically.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod card;
mod channel;
pub mod env;
mod error;
pub mod framed;
mod hsm;
mod link;
pub mod sync;

pub use card::CardClient;
pub use channel::{Channel, IoChannel, PortScanner};
pub use env::{Environment, SystemEnv};
pub use error::{HsmError, LinkError};
pub use hsm::HsmClient;
pub use link::{DeviceLink, LinkConfig, LinkState, PortWatcher};
