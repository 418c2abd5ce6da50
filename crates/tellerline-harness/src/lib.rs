//! Emulated devices for Tellerline protocol testing.
//!
//! Device behavior is expressed as pure state machines ([`CardDevice`],
//! [`HsmDevice`]): one deframed message in, zero or more reply frames
//! out, no I/O. [`spawn_device`] puts a machine behind an in-memory port
//! whose controller end plugs into a `DeviceLink` like a real serial
//! port, and [`ScriptedScanner`] lets tests script hot-plug events for
//! the link watchers.
//!
//! Everything runs under Tokio's paused clock, so settle delays, read
//! timeouts, and watcher poll intervals cost no wall time.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod card_device;
mod hsm_device;
mod port;

pub use card_device::CardDevice;
pub use hsm_device::HsmDevice;
pub use port::{Endpoint, ScriptedScanner, spawn_device};

/// A device-side state machine: consume one message, emit reply frames.
pub trait Device: Send + 'static {
    /// Transition on `msg`, returning the frames to send back, in order.
    fn handle(&mut self, msg: &[u8]) -> Vec<Vec<u8>>;
}
