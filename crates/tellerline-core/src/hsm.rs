//! HSM protocol client.
//!
//! The HSM conversation is stateful across calls: [`HsmClient::identity`]
//! syncs and leaves the HSM waiting for the identity challenge that
//! [`HsmClient::withdraw`] sends. The two must alternate; `withdraw`
//! deliberately does not re-sync, because a fresh handshake would discard
//! the challenge the HSM is holding.
//!
//! Dispense refusals are typed: a failed challenge is [`HsmError::AuthFailure`],
//! an inventory shortfall is [`HsmError::InsufficientInventory`]. Neither
//! dispenses anything; the HSM returns to its sync state.

use tellerline_proto::{Bill, DeviceId, SessionMode, literals, strip_padding};
use tracing::{debug, info};

use crate::{env::Environment, error::HsmError, link::DeviceLink};

/// Client for the HSM bay of an ATM.
pub struct HsmClient<E: Environment> {
    link: DeviceLink<E>,
}

impl<E: Environment> HsmClient<E> {
    /// Wrap an HSM-kind device link.
    #[must_use]
    pub fn new(link: DeviceLink<E>) -> Self {
        Self { link }
    }

    /// The underlying link.
    #[must_use]
    pub fn link(&self) -> &DeviceLink<E> {
        &self.link
    }

    /// Sync and read the HSM's identity, arming the dispense challenge.
    ///
    /// Returns `Ok(None)` if the HSM reports itself unprovisioned.
    ///
    /// # Errors
    ///
    /// Any link, handshake, or field failure.
    pub async fn identity(&self) -> Result<Option<DeviceId>, HsmError> {
        self.link.sync(SessionMode::Operational).await?;
        let reply = self.link.pull_msg().await.map_err(HsmError::Link)?;
        if strip_padding(&reply) == literals::PROVISION {
            debug!("HSM reports no identity yet");
            return Ok(None);
        }
        let id = DeviceId::from_wire(&reply).map_err(|e| HsmError::Link(e.into()))?;
        debug!(%id, "HSM disclosed identity");
        Ok(Some(id))
    }

    /// Answer the armed challenge and dispense `count` bills.
    ///
    /// Must follow an [`identity`](Self::identity) call in the same
    /// session. On success every dispensed bill is returned in the order
    /// the HSM stored them.
    ///
    /// # Errors
    ///
    /// - [`HsmError::AuthFailure`] if `id` does not match the HSM's
    ///   stored identity.
    /// - [`HsmError::InsufficientInventory`] if fewer than `count` bills
    ///   remain.
    /// - [`HsmError::Link`] on transport or desync failure.
    pub async fn withdraw(&self, id: &DeviceId, count: u8) -> Result<Vec<Bill>, HsmError> {
        self.link.push_msg(&nul_terminated(id.as_bytes())).await?;
        let reply = self.link.pull_msg().await.map_err(HsmError::Link)?;
        if strip_padding(&reply) != literals::ACK {
            debug!("HSM rejected identity challenge");
            return Err(HsmError::AuthFailure);
        }

        self.link.push_msg(&[count]).await?;
        let reply = self.link.pull_msg().await.map_err(HsmError::Link)?;
        match strip_padding(&reply) {
            r if r == literals::ACK => {},
            r if r == literals::BAD => return Err(HsmError::InsufficientInventory),
            _ => return Err(HsmError::Link(crate::LinkError::desync("dispense-ack", &reply))),
        }

        let mut bills = Vec::with_capacity(usize::from(count));
        for _ in 0..count {
            let msg = self.link.pull_msg().await.map_err(HsmError::Link)?;
            let bill = Bill::from_wire(&msg).map_err(|e| HsmError::Link(e.into()))?;
            bills.push(bill);
        }
        info!(count, "HSM dispensed bills");
        Ok(bills)
    }

    /// Write identity and bill inventory onto a factory HSM.
    ///
    /// # Errors
    ///
    /// [`HsmError::Link`] wrapping [`AlreadyProvisioned`] when the HSM is
    /// not factory fresh, plus any link or desync failure.
    ///
    /// [`AlreadyProvisioned`]: crate::LinkError::AlreadyProvisioned
    pub async fn provision(&self, id: &DeviceId, bills: &[Bill]) -> Result<(), HsmError> {
        self.link.sync(SessionMode::Provisioning).await?;

        let greeting = self.link.pull_msg().await.map_err(HsmError::Link)?;
        if strip_padding(&greeting) != literals::PROVISION {
            return Err(HsmError::Link(crate::LinkError::desync(
                "provision-greeting",
                &greeting,
            )));
        }

        self.push_acked("provision-id", &nul_terminated(id.as_bytes())).await?;
        let count = u8::try_from(bills.len())
            .map_err(|_| HsmError::Link(crate::LinkError::desync("provision-count", b"")))?;
        self.push_acked("provision-count", &[count]).await?;
        for bill in bills {
            self.push_acked("provision-bill", bill.as_bytes()).await?;
        }
        info!(%id, count, "HSM provisioned");
        Ok(())
    }

    /// Push a message whose only valid reply is the `K` ack.
    async fn push_acked(&self, step: &'static str, payload: &[u8]) -> Result<(), HsmError> {
        self.link.push_msg(payload).await?;
        let reply = self.link.pull_msg().await.map_err(HsmError::Link)?;
        if strip_padding(&reply) != literals::ACK {
            return Err(HsmError::Link(crate::LinkError::desync(step, &reply)));
        }
        Ok(())
    }
}

/// NUL-terminate a provisioning or challenge field.
fn nul_terminated(body: &[u8]) -> Vec<u8> {
    let mut msg = Vec::with_capacity(body.len() + 1);
    msg.extend_from_slice(body);
    msg.push(0);
    msg
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{DuplexStream, duplex};

    use super::*;
    use crate::{
        LinkError,
        channel::IoChannel,
        env::SystemEnv,
        framed::{read_frame, write_frame},
        link::LinkConfig,
    };

    const HSM_ID: &str = "aaaaaaaa-bbbb-cccc-dddd-eeeeeeeeeeee";

    fn client() -> HsmClient<SystemEnv> {
        HsmClient::new(DeviceLink::new(
            tellerline_proto::DeviceKind::Hsm,
            SystemEnv,
            LinkConfig {
                settle_delay: Duration::from_millis(10),
                read_timeout: Duration::from_millis(500),
                poll_interval: Duration::from_millis(50),
                max_sync_attempts: 4,
            },
        ))
    }

    async fn attach(client: &HsmClient<SystemEnv>, near: DuplexStream) {
        client.link().attach(Box::new(IoChannel::new(near))).await;
    }

    async fn accept_sync(chan: &mut IoChannel<DuplexStream>, tag: &[u8]) {
        assert_eq!(read_frame(chan).await.unwrap(), literals::READY);
        write_frame(chan, tag).await.unwrap();
        assert_eq!(read_frame(chan).await.unwrap(), literals::GO);
    }

    fn challenge(id: &str) -> Vec<u8> {
        let mut msg = id.as_bytes().to_vec();
        msg.push(0);
        msg
    }

    #[tokio::test(start_paused = true)]
    async fn identity_then_withdraw_dispenses_bills() {
        let (near, far) = duplex(1024);
        let client = client();
        attach(&client, near).await;

        let peer = tokio::spawn(async move {
            let mut chan = IoChannel::new(far);
            accept_sync(&mut chan, b"HSM_N").await;
            write_frame(&mut chan, HSM_ID.as_bytes()).await.unwrap();
            assert_eq!(read_frame(&mut chan).await.unwrap(), challenge(HSM_ID));
            write_frame(&mut chan, b"K").await.unwrap();
            assert_eq!(read_frame(&mut chan).await.unwrap(), [2]);
            write_frame(&mut chan, b"K").await.unwrap();
            write_frame(&mut chan, b"bill-0001").await.unwrap();
            write_frame(&mut chan, b"bill-0002").await.unwrap();
        });

        let id = client.identity().await.unwrap().unwrap();
        assert_eq!(id.as_str(), HSM_ID);
        let bills = client.withdraw(&id, 2).await.unwrap();
        assert_eq!(bills.len(), 2);
        assert_eq!(bills[0].as_bytes(), b"bill-0001");
        peer.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn unprovisioned_identity_is_none() {
        let (near, far) = duplex(1024);
        let client = client();
        attach(&client, near).await;

        let peer = tokio::spawn(async move {
            let mut chan = IoChannel::new(far);
            accept_sync(&mut chan, b"HSM_N").await;
            write_frame(&mut chan, b"P").await.unwrap();
        });

        assert_eq!(client.identity().await.unwrap(), None);
        peer.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn failed_challenge_is_an_auth_failure() {
        let (near, far) = duplex(1024);
        let client = client();
        attach(&client, near).await;

        let peer = tokio::spawn(async move {
            let mut chan = IoChannel::new(far);
            accept_sync(&mut chan, b"HSM_N").await;
            write_frame(&mut chan, HSM_ID.as_bytes()).await.unwrap();
            let _ = read_frame(&mut chan).await.unwrap();
            write_frame(&mut chan, b"BAD").await.unwrap();
        });

        assert!(client.identity().await.unwrap().is_some());
        let stale = DeviceId::new("00000000-0000-0000-0000-000000000000").unwrap();
        assert_eq!(client.withdraw(&stale, 1).await, Err(HsmError::AuthFailure));
        peer.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn inventory_shortfall_dispenses_nothing() {
        let (near, far) = duplex(1024);
        let client = client();
        attach(&client, near).await;

        let peer = tokio::spawn(async move {
            let mut chan = IoChannel::new(far);
            accept_sync(&mut chan, b"HSM_N").await;
            write_frame(&mut chan, HSM_ID.as_bytes()).await.unwrap();
            assert_eq!(read_frame(&mut chan).await.unwrap(), challenge(HSM_ID));
            write_frame(&mut chan, b"K").await.unwrap();
            assert_eq!(read_frame(&mut chan).await.unwrap(), [200]);
            write_frame(&mut chan, b"BAD").await.unwrap();
        });

        let id = client.identity().await.unwrap().unwrap();
        assert_eq!(client.withdraw(&id, 200).await, Err(HsmError::InsufficientInventory));
        peer.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn provision_loads_identity_and_bills() {
        let (near, far) = duplex(1024);
        let client = client();
        attach(&client, near).await;

        let peer = tokio::spawn(async move {
            let mut chan = IoChannel::new(far);
            accept_sync(&mut chan, b"HSM_P").await;
            write_frame(&mut chan, b"P").await.unwrap();
            assert_eq!(read_frame(&mut chan).await.unwrap(), challenge(HSM_ID));
            write_frame(&mut chan, b"K").await.unwrap();
            assert_eq!(read_frame(&mut chan).await.unwrap(), [2]);
            write_frame(&mut chan, b"K").await.unwrap();
            assert_eq!(read_frame(&mut chan).await.unwrap(), b"bill-0001");
            write_frame(&mut chan, b"K").await.unwrap();
            assert_eq!(read_frame(&mut chan).await.unwrap(), b"bill-0002");
            write_frame(&mut chan, b"K").await.unwrap();
        });

        let id = DeviceId::new(HSM_ID).unwrap();
        let bills =
            vec![Bill::new(&b"bill-0001"[..]).unwrap(), Bill::new(&b"bill-0002"[..]).unwrap()];
        client.provision(&id, &bills).await.unwrap();
        peer.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn provisioning_a_provisioned_hsm_is_reported() {
        let (near, far) = duplex(1024);
        let client = client();
        attach(&client, near).await;

        let peer = tokio::spawn(async move {
            let mut chan = IoChannel::new(far);
            assert_eq!(read_frame(&mut chan).await.unwrap(), literals::READY);
            write_frame(&mut chan, b"HSM_N").await.unwrap();
        });

        let id = DeviceId::new(HSM_ID).unwrap();
        assert_eq!(
            client.provision(&id, &[]).await,
            Err(HsmError::Link(LinkError::AlreadyProvisioned))
        );
        peer.await.unwrap();
    }
}
