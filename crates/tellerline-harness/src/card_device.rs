//! Emulated card device.
//!
//! A pure state machine mirroring the card firmware's observable behavior:
//! every call to [`CardDevice::handle`] consumes one deframed message and
//! returns the frames the card would send back, with no I/O involved.
//! Notable quirks kept intact:
//!
//! - Any non-`READY` message while waiting for sync is echoed back, which
//!   is what the controller's retry loop absorbs.
//! - After acking a balance-check or withdraw op the card volunteers its
//!   identity immediately, so one input produces two replies.
//! - A wrong PIN or failed step drops the card back to its sync state.

use tellerline_proto::{CardOp, DeviceId, Pin, literals, strip_padding};
use tracing::debug;

use crate::Device;

/// What the card is waiting for next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CardState {
    AwaitReady,
    AwaitGo,
    ProvAwaitPin,
    ProvAwaitId,
    AwaitPin,
    AwaitOp,
    AwaitNewPin,
}

/// Emulated ATM card.
pub struct CardDevice {
    state: CardState,
    provisioned: bool,
    pin: Vec<u8>,
    id: Vec<u8>,
}

impl CardDevice {
    /// Factory-fresh card awaiting provisioning.
    #[must_use]
    pub fn factory() -> Self {
        Self { state: CardState::AwaitReady, provisioned: false, pin: Vec::new(), id: Vec::new() }
    }

    /// Card already provisioned with `id` and `pin`.
    #[must_use]
    pub fn provisioned(id: &DeviceId, pin: &Pin) -> Self {
        Self {
            state: CardState::AwaitReady,
            provisioned: true,
            pin: pin.as_bytes().to_vec(),
            id: id.as_bytes().to_vec(),
        }
    }

    /// Whether the card has been provisioned.
    #[must_use]
    pub fn is_provisioned(&self) -> bool {
        self.provisioned
    }

    /// The PIN the card currently accepts.
    #[must_use]
    pub fn stored_pin(&self) -> &[u8] {
        &self.pin
    }

    /// Consume one message, yielding the card's reply frames.
    pub fn handle(&mut self, msg: &[u8]) -> Vec<Vec<u8>> {
        let msg = strip_padding(msg);
        match self.state {
            CardState::AwaitReady => {
                if msg == strip_padding(literals::READY) {
                    self.state = CardState::AwaitGo;
                    let tag: &[u8] = if self.provisioned { b"CARD_N" } else { b"CARD_P" };
                    vec![tag.to_vec()]
                } else {
                    // Echo; the controller retries with READY.
                    debug!(?msg, "card echoing unexpected sync message");
                    vec![msg.to_vec()]
                }
            },
            CardState::AwaitGo => {
                if msg == strip_padding(literals::GO) {
                    if self.provisioned {
                        self.state = CardState::AwaitPin;
                        vec![]
                    } else {
                        self.state = CardState::ProvAwaitPin;
                        vec![literals::PROVISION.to_vec()]
                    }
                } else {
                    self.state = CardState::AwaitReady;
                    vec![]
                }
            },
            CardState::ProvAwaitPin => {
                self.pin = msg.to_vec();
                self.state = CardState::ProvAwaitId;
                vec![literals::ACK.to_vec()]
            },
            CardState::ProvAwaitId => {
                self.id = msg.to_vec();
                self.provisioned = true;
                self.state = CardState::AwaitReady;
                debug!("card provisioning complete");
                vec![literals::ACK.to_vec()]
            },
            CardState::AwaitPin => {
                if msg == self.pin.as_slice() {
                    self.state = CardState::AwaitOp;
                    vec![literals::PIN_OK.to_vec()]
                } else {
                    debug!("card refusing wrong PIN");
                    self.state = CardState::AwaitReady;
                    vec![literals::BAD.to_vec()]
                }
            },
            CardState::AwaitOp => match msg.first().copied().and_then(CardOp::from_byte) {
                Some(CardOp::ChangePin) => {
                    self.state = CardState::AwaitNewPin;
                    vec![literals::ACK.to_vec()]
                },
                Some(CardOp::CheckBalance | CardOp::Withdraw) => {
                    self.state = CardState::AwaitReady;
                    vec![literals::ACK.to_vec(), self.id.clone()]
                },
                None => {
                    self.state = CardState::AwaitReady;
                    vec![literals::BAD.to_vec()]
                },
            },
            CardState::AwaitNewPin => {
                self.pin = msg.to_vec();
                self.state = CardState::AwaitReady;
                vec![literals::SUCCESS.to_vec()]
            },
        }
    }
}

impl Device for CardDevice {
    fn handle(&mut self, msg: &[u8]) -> Vec<Vec<u8>> {
        Self::handle(self, msg)
    }
}
