//! Emulated HSM device.
//!
//! Mirrors the HSM firmware's observable behavior as a pure state
//! machine. Bills are stored FIFO and leave the inventory only in a
//! dispense that was preceded by a correct identity challenge; a refused
//! challenge or an inventory shortfall dispenses nothing and returns the
//! HSM to its sync state.

use std::collections::VecDeque;

use tellerline_proto::{Bill, DeviceId, literals, strip_padding};
use tracing::debug;

use crate::Device;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HsmState {
    AwaitReady,
    AwaitGo,
    ProvAwaitId,
    ProvAwaitCount,
    ProvLoadBills(u8),
    AwaitChallenge,
    AwaitAmount,
}

/// Emulated HSM.
pub struct HsmDevice {
    state: HsmState,
    provisioned: bool,
    id: Vec<u8>,
    bills: VecDeque<Vec<u8>>,
}

impl HsmDevice {
    /// Factory-fresh HSM awaiting provisioning.
    #[must_use]
    pub fn factory() -> Self {
        Self {
            state: HsmState::AwaitReady,
            provisioned: false,
            id: Vec::new(),
            bills: VecDeque::new(),
        }
    }

    /// HSM already provisioned with `id` and a loaded `bills` stack.
    #[must_use]
    pub fn provisioned(id: &DeviceId, bills: &[Bill]) -> Self {
        Self {
            state: HsmState::AwaitReady,
            provisioned: true,
            id: id.as_bytes().to_vec(),
            bills: bills.iter().map(|b| b.as_bytes().to_vec()).collect(),
        }
    }

    /// Whether the HSM has been provisioned.
    #[must_use]
    pub fn is_provisioned(&self) -> bool {
        self.provisioned
    }

    /// Bills currently held.
    #[must_use]
    pub fn inventory(&self) -> usize {
        self.bills.len()
    }

    /// Consume one message, yielding the HSM's reply frames.
    pub fn handle(&mut self, msg: &[u8]) -> Vec<Vec<u8>> {
        let msg = strip_padding(msg);
        match self.state {
            HsmState::AwaitReady => {
                if msg == strip_padding(literals::READY) {
                    self.state = HsmState::AwaitGo;
                    let tag: &[u8] = if self.provisioned { b"HSM_N" } else { b"HSM_P" };
                    vec![tag.to_vec()]
                } else {
                    debug!(?msg, "HSM echoing unexpected sync message");
                    vec![msg.to_vec()]
                }
            },
            HsmState::AwaitGo => {
                if msg == strip_padding(literals::GO) {
                    if self.provisioned {
                        self.state = HsmState::AwaitChallenge;
                        vec![self.id.clone()]
                    } else {
                        self.state = HsmState::ProvAwaitId;
                        vec![literals::PROVISION.to_vec()]
                    }
                } else {
                    self.state = HsmState::AwaitReady;
                    vec![]
                }
            },
            HsmState::ProvAwaitId => {
                self.id = msg.to_vec();
                self.state = HsmState::ProvAwaitCount;
                vec![literals::ACK.to_vec()]
            },
            HsmState::ProvAwaitCount => {
                let count = msg.first().copied().unwrap_or(0);
                if count == 0 {
                    self.provisioned = true;
                    self.state = HsmState::AwaitReady;
                } else {
                    self.state = HsmState::ProvLoadBills(count);
                }
                vec![literals::ACK.to_vec()]
            },
            HsmState::ProvLoadBills(remaining) => {
                self.bills.push_back(msg.to_vec());
                if remaining <= 1 {
                    self.provisioned = true;
                    self.state = HsmState::AwaitReady;
                    debug!(bills = self.bills.len(), "HSM provisioning complete");
                } else {
                    self.state = HsmState::ProvLoadBills(remaining - 1);
                }
                vec![literals::ACK.to_vec()]
            },
            HsmState::AwaitChallenge => {
                if msg == self.id.as_slice() {
                    self.state = HsmState::AwaitAmount;
                    vec![literals::ACK.to_vec()]
                } else {
                    debug!("HSM refusing identity challenge");
                    self.state = HsmState::AwaitReady;
                    vec![literals::BAD.to_vec()]
                }
            },
            HsmState::AwaitAmount => {
                self.state = HsmState::AwaitReady;
                let count = usize::from(msg.first().copied().unwrap_or(0));
                if count > self.bills.len() {
                    debug!(count, held = self.bills.len(), "HSM refusing dispense");
                    return vec![literals::BAD.to_vec()];
                }
                let mut replies = Vec::with_capacity(count + 1);
                replies.push(literals::ACK.to_vec());
                for _ in 0..count {
                    if let Some(bill) = self.bills.pop_front() {
                        replies.push(bill);
                    }
                }
                replies
            },
        }
    }
}

impl Device for HsmDevice {
    fn handle(&mut self, msg: &[u8]) -> Vec<Vec<u8>> {
        Self::handle(self, msg)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use tellerline_proto::MAX_PAYLOAD;

    use super::*;

    const ID: &str = "aaaaaaaa-bbbb-cccc-dddd-eeeeeeeeeeee";

    fn bills(n: usize) -> Vec<Bill> {
        (0..n).map(|i| Bill::new(format!("bill-{i:04}").into_bytes()).unwrap()).collect()
    }

    fn hsm(n: usize) -> HsmDevice {
        HsmDevice::provisioned(&DeviceId::new(ID).unwrap(), &bills(n))
    }

    fn challenge() -> Vec<u8> {
        let mut msg = ID.as_bytes().to_vec();
        msg.push(0);
        msg
    }

    #[test]
    fn sync_discloses_identity_then_dispenses_fifo() {
        let mut hsm = hsm(3);
        assert_eq!(hsm.handle(b"READY\0"), vec![b"HSM_N".to_vec()]);
        assert_eq!(hsm.handle(b"GO\0"), vec![ID.as_bytes().to_vec()]);
        assert_eq!(hsm.handle(&challenge()), vec![b"K".to_vec()]);
        assert_eq!(
            hsm.handle(&[2]),
            vec![b"K".to_vec(), b"bill-0000".to_vec(), b"bill-0001".to_vec()]
        );
        assert_eq!(hsm.inventory(), 1);
    }

    #[test]
    fn wrong_challenge_dispenses_nothing() {
        let mut hsm = hsm(3);
        hsm.handle(b"READY\0");
        hsm.handle(b"GO\0");
        assert_eq!(hsm.handle(b"wrong-identity\0"), vec![b"BAD".to_vec()]);
        assert_eq!(hsm.inventory(), 3);
        // Back in sync state.
        assert_eq!(hsm.handle(b"READY\0"), vec![b"HSM_N".to_vec()]);
    }

    #[test]
    fn shortfall_refuses_and_keeps_inventory() {
        let mut hsm = hsm(2);
        hsm.handle(b"READY\0");
        hsm.handle(b"GO\0");
        hsm.handle(&challenge());
        assert_eq!(hsm.handle(&[5]), vec![b"BAD".to_vec()]);
        assert_eq!(hsm.inventory(), 2);
    }

    #[test]
    fn provisioning_loads_bills_and_flips_mode() {
        let mut hsm = HsmDevice::factory();
        assert_eq!(hsm.handle(b"READY\0"), vec![b"HSM_P".to_vec()]);
        assert_eq!(hsm.handle(b"GO\0"), vec![b"P".to_vec()]);
        assert_eq!(hsm.handle(&challenge()), vec![b"K".to_vec()]);
        assert_eq!(hsm.handle(&[2]), vec![b"K".to_vec()]);
        assert_eq!(hsm.handle(b"bill-0000"), vec![b"K".to_vec()]);
        assert_eq!(hsm.handle(b"bill-0001"), vec![b"K".to_vec()]);

        assert!(hsm.is_provisioned());
        assert_eq!(hsm.inventory(), 2);
        assert_eq!(hsm.handle(b"READY\0"), vec![b"HSM_N".to_vec()]);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        // Garbage never wedges the machine, never mints bills, and never
        // produces a reply too large to frame.
        #[test]
        fn arbitrary_message_sequences_never_grow_inventory(
            msgs in prop::collection::vec(
                prop::collection::vec(any::<u8>(), 0..=MAX_PAYLOAD),
                0..32,
            ),
        ) {
            let mut hsm = hsm(8);
            let mut last = hsm.inventory();
            for msg in &msgs {
                for reply in hsm.handle(msg) {
                    prop_assert!(reply.len() <= MAX_PAYLOAD);
                }
                let now = hsm.inventory();
                prop_assert!(now <= last);
                last = now;
            }
        }
    }
}
