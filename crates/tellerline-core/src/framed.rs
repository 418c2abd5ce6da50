//! Framed message push/pull over a raw channel.
//!
//! One frame is a single length-prefixed message (`tellerline-proto`
//! framing). Reading a header byte and then fewer body bytes than it
//! promises is a [`ProtocolError::ShortRead`]; the stream closing between
//! frames is [`LinkError::DeviceRemoved`]. After every write the sender
//! observes the device's settle delay before issuing the next physical
//! write (the firmware needs turnaround time between frames).

use std::time::Duration;

use tellerline_proto::{ProtocolError, encode_frame, payload_len};
use tracing::warn;

use crate::{channel::Channel, env::Environment, error::LinkError};

/// Fill `buf` from the channel, stopping early only on clean close.
///
/// Returns the number of bytes read. Any I/O failure is reported as
/// [`LinkError::DeviceRemoved`].
async fn read_full(chan: &mut (dyn Channel + '_), buf: &mut [u8]) -> Result<usize, LinkError> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = chan.read(&mut buf[filled..]).await.map_err(|_| LinkError::DeviceRemoved)?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Pull one frame body from the channel.
///
/// # Errors
///
/// - [`LinkError::DeviceRemoved`] if the stream closes before a header
///   byte arrives or any read fails.
/// - [`ProtocolError::ShortRead`] (via [`LinkError::Protocol`]) if the
///   stream closes mid-body; the session is desynchronized.
pub async fn read_frame(chan: &mut (dyn Channel + '_)) -> Result<Vec<u8>, LinkError> {
    let mut header = [0u8; 1];
    if read_full(chan, &mut header).await? == 0 {
        return Err(LinkError::DeviceRemoved);
    }

    let expected = payload_len(header[0]);
    let mut body = vec![0u8; expected];
    let actual = read_full(chan, &mut body).await?;
    if actual < expected {
        warn!(expected, actual, "short read, session desynchronized");
        return Err(LinkError::Protocol(ProtocolError::ShortRead { expected, actual }));
    }

    Ok(body)
}

/// Pull one frame, failing with [`LinkError::ReadTimeout`] if the peer
/// stays silent.
///
/// A timeout does not invalidate the channel; the handshake retry loop
/// treats it as one failed attempt.
pub async fn read_frame_timeout<E: Environment>(
    chan: &mut (dyn Channel + '_),
    env: &E,
    timeout: Duration,
) -> Result<Vec<u8>, LinkError> {
    tokio::select! {
        result = read_frame(chan) => result,
        () = env.sleep(timeout) => Err(LinkError::ReadTimeout { elapsed: timeout }),
    }
}

/// Push one framed message to the channel (no settle delay).
///
/// # Errors
///
/// - [`ProtocolError::MessageTooLarge`] if the payload cannot be framed.
/// - [`LinkError::DeviceRemoved`] on any write failure.
pub async fn write_frame(
    chan: &mut (dyn Channel + '_),
    payload: &[u8],
) -> Result<(), LinkError> {
    let frame = encode_frame(payload)?;
    chan.write_all(&frame).await.map_err(|_| LinkError::DeviceRemoved)
}

/// Push one framed message, then wait out the device settle delay.
pub async fn write_frame_settled<E: Environment>(
    chan: &mut (dyn Channel + '_),
    env: &E,
    payload: &[u8],
    settle: Duration,
) -> Result<(), LinkError> {
    write_frame(chan, payload).await?;
    env.sleep(settle).await;
    Ok(())
}
