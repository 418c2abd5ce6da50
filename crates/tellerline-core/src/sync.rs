//! The READY/tag/GO sync handshake.
//!
//! Every session opens with the controller framing `READY` and the device
//! answering one of four tags (kind x mode). The controller either
//! proceeds (`GO`), reports a mode mismatch, or retries: a device that was
//! mid-protocol when the controller started a new session answers with
//! whatever its current state produces (often an echo), and the retry loop
//! absorbs that until the device falls back into its sync state.
//!
//! The retry loop is bounded here ([`LinkConfig::max_sync_attempts`] with a
//! per-read timeout); the original firmware protocol would spin forever on
//! a silent or confused peer.
//!
//! [`LinkConfig::max_sync_attempts`]: crate::LinkConfig#structfield.max_sync_attempts

use tellerline_proto::{SessionMode, SyncTag, literals};
use tracing::{debug, info};

use crate::{
    channel::Channel,
    env::Environment,
    error::LinkError,
    framed::{read_frame_timeout, write_frame_settled},
    link::LinkConfig,
};

/// What one handshake reply means for the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagOutcome {
    /// Reply is the expected tag; send `GO` and proceed.
    Match,
    /// Right device kind, wrong provisioning mode. Not retried.
    WrongMode,
    /// Echo, garbage, or a different device kind; resend `READY`.
    Retry,
}

/// Classify a handshake reply against the expected tag.
#[must_use]
pub fn classify(reply: &[u8], expected: SyncTag) -> TagOutcome {
    match SyncTag::parse(reply) {
        Some(tag) if tag == expected => TagOutcome::Match,
        Some(tag) if tag.kind() == expected.kind() => TagOutcome::WrongMode,
        _ => TagOutcome::Retry,
    }
}

/// The error a mode mismatch raises, which depends on what was expected.
#[must_use]
pub fn mode_mismatch(expected: SessionMode) -> LinkError {
    match expected {
        // Expected a provisioned device, found a factory one.
        SessionMode::Operational => LinkError::NotProvisioned,
        // Expected a factory device, found a provisioned one.
        SessionMode::Provisioning => LinkError::AlreadyProvisioned,
    }
}

/// Probe a freshly opened channel to classify the attached device.
///
/// Runs the `READY` exchange but accepts any of the four tags and does
/// not send `GO`, leaving the device to fall back into its sync state
/// when the first real session begins. Used by the attach watcher to
/// decide whether a new endpoint carries the right kind of device.
///
/// # Errors
///
/// - [`LinkError::SyncExhausted`] if no tag arrives within the attempt
///   budget.
/// - [`LinkError::DeviceRemoved`] if the endpoint drops mid-probe.
pub async fn probe<E: Environment>(
    chan: &mut (dyn Channel + '_),
    env: &E,
    config: &LinkConfig,
) -> Result<SyncTag, LinkError> {
    for attempt in 1..=config.max_sync_attempts {
        write_frame_settled(chan, env, literals::READY, config.settle_delay).await?;

        let reply = match read_frame_timeout(chan, env, config.read_timeout).await {
            Ok(reply) => reply,
            Err(LinkError::ReadTimeout { .. }) => {
                debug!(attempt, "probe attempt timed out");
                continue;
            },
            Err(err) => return Err(err),
        };

        if let Some(tag) = SyncTag::parse(&reply) {
            info!(?tag, "probe classified attached device");
            return Ok(tag);
        }
        debug!(attempt, "probe reply was not a tag, retrying");
    }

    Err(LinkError::SyncExhausted { attempts: config.max_sync_attempts })
}
