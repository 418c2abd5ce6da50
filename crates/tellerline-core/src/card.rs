//! Card protocol client.
//!
//! Each public method runs one complete session: sync the link in the
//! right mode, exchange the fixed command/response sequence, return. The
//! card never volunteers data; every reply answers exactly one pushed
//! message, which is what lets a half-finished session be abandoned and
//! re-synced.
//!
//! A wrong PIN is a normal outcome (`Ok(None)` / `Ok(false)`), not an
//! error. Errors mean the conversation itself broke.

use tellerline_proto::{CardOp, DeviceId, Pin, SessionMode, literals, strip_padding};
use tracing::{debug, info};

use crate::{env::Environment, error::LinkError, link::DeviceLink};

/// Client for the card slot of an ATM.
pub struct CardClient<E: Environment> {
    link: DeviceLink<E>,
}

impl<E: Environment> CardClient<E> {
    /// Wrap a card-kind device link.
    #[must_use]
    pub fn new(link: DeviceLink<E>) -> Self {
        Self { link }
    }

    /// The underlying link.
    #[must_use]
    pub fn link(&self) -> &DeviceLink<E> {
        &self.link
    }

    /// Authenticate and retrieve the card identity for a balance check.
    ///
    /// Returns `Ok(None)` when the card refuses the PIN.
    ///
    /// # Errors
    ///
    /// [`LinkError::NotProvisioned`] for a factory card, plus any link or
    /// desync failure.
    pub async fn check_balance(&self, pin: &Pin) -> Result<Option<DeviceId>, LinkError> {
        self.identity_op(CardOp::CheckBalance, pin).await
    }

    /// Authenticate and retrieve the card identity for a withdrawal.
    ///
    /// Returns `Ok(None)` when the card refuses the PIN.
    ///
    /// # Errors
    ///
    /// [`LinkError::NotProvisioned`] for a factory card, plus any link or
    /// desync failure.
    pub async fn withdraw(&self, pin: &Pin) -> Result<Option<DeviceId>, LinkError> {
        self.identity_op(CardOp::Withdraw, pin).await
    }

    /// Replace the card's stored PIN.
    ///
    /// Returns `Ok(false)` when the card refuses `old_pin`.
    ///
    /// # Errors
    ///
    /// [`LinkError::NotProvisioned`] for a factory card, plus any link or
    /// desync failure.
    pub async fn change_pin(&self, old_pin: &Pin, new_pin: &Pin) -> Result<bool, LinkError> {
        self.link.sync(SessionMode::Operational).await?;
        if !self.authenticate(old_pin).await? {
            return Ok(false);
        }
        self.send_op(CardOp::ChangePin).await?;

        self.link.push_msg(new_pin.as_bytes()).await?;
        let reply = self.link.pull_msg().await?;
        if strip_padding(&reply) != literals::SUCCESS {
            return Err(LinkError::desync("pin-change", &reply));
        }
        info!("card PIN changed");
        Ok(true)
    }

    /// Write identity and PIN onto a factory card.
    ///
    /// # Errors
    ///
    /// [`LinkError::AlreadyProvisioned`] when the card is not factory
    /// fresh, plus any link or desync failure.
    pub async fn provision(&self, id: &DeviceId, pin: &Pin) -> Result<(), LinkError> {
        self.link.sync(SessionMode::Provisioning).await?;

        let greeting = self.link.pull_msg().await?;
        if strip_padding(&greeting) != literals::PROVISION {
            return Err(LinkError::desync("provision-greeting", &greeting));
        }

        self.push_acked("provision-pin", &nul_terminated(pin.as_bytes())).await?;
        self.push_acked("provision-id", &nul_terminated(id.as_bytes())).await?;
        info!(%id, "card provisioned");
        Ok(())
    }

    /// The shared check-balance / withdraw shape: authenticate, name the
    /// op, read back the identity.
    async fn identity_op(&self, op: CardOp, pin: &Pin) -> Result<Option<DeviceId>, LinkError> {
        self.link.sync(SessionMode::Operational).await?;
        if !self.authenticate(pin).await? {
            return Ok(None);
        }
        self.send_op(op).await?;

        let reply = self.link.pull_msg().await?;
        let id = DeviceId::from_wire(&reply)?;
        debug!(?op, %id, "card disclosed identity");
        Ok(Some(id))
    }

    /// Challenge the card with a PIN. `OK` accepts, `BAD` refuses,
    /// anything else is a desync.
    async fn authenticate(&self, pin: &Pin) -> Result<bool, LinkError> {
        self.link.push_msg(pin.as_bytes()).await?;
        let reply = self.link.pull_msg().await?;
        match strip_padding(&reply) {
            r if r == literals::PIN_OK => Ok(true),
            r if r == literals::BAD => {
                debug!("card refused PIN");
                Ok(false)
            },
            _ => Err(LinkError::desync("pin-challenge", &reply)),
        }
    }

    /// Name the operation for an authenticated session.
    async fn send_op(&self, op: CardOp) -> Result<(), LinkError> {
        self.push_acked("op-ack", &[op.as_byte()]).await
    }

    /// Push a message whose only valid reply is the `K` ack.
    async fn push_acked(&self, step: &'static str, payload: &[u8]) -> Result<(), LinkError> {
        self.link.push_msg(payload).await?;
        let reply = self.link.pull_msg().await?;
        if strip_padding(&reply) != literals::ACK {
            return Err(LinkError::desync(step, &reply));
        }
        Ok(())
    }
}

/// NUL-terminate a provisioning field, matching what devices store.
fn nul_terminated(body: &[u8]) -> Vec<u8> {
    let mut msg = Vec::with_capacity(body.len() + 1);
    msg.extend_from_slice(body);
    msg.push(0);
    msg
}
