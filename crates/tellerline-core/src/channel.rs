//! Byte-channel capability traits.
//!
//! A [`Channel`] is an ordered, reliable-until-disconnected byte stream
//! with a single owner: one end of a serial cable or of an in-memory
//! emulated port. Both the real transport and the test emulator implement
//! the same trait, so every layer above dispatches statically on the
//! capability, never on the concrete device type.
//!
//! [`PortScanner`] abstracts endpoint enumeration for hot-plug watching:
//! the link manager diffs successive `list_ports` snapshots instead of
//! talking to an OS serial enumerator directly.

use std::io;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// An ordered byte stream to one attached device.
///
/// Channels are created on attach and destroyed on detach or error; a
/// reconnect always produces a fresh channel, never reuses one.
#[async_trait]
pub trait Channel: Send {
    /// Read up to `buf.len()` bytes. `Ok(0)` means the peer closed the
    /// link.
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write the entire buffer.
    async fn write_all(&mut self, buf: &[u8]) -> io::Result<()>;
}

/// Adapter exposing any async byte stream as a [`Channel`].
///
/// Covers serial-port streams and the in-memory duplex used by the
/// emulator harness.
pub struct IoChannel<T> {
    io: T,
}

impl<T> IoChannel<T> {
    /// Wrap an async byte stream.
    pub fn new(io: T) -> Self {
        Self { io }
    }
}

#[async_trait]
impl<T> Channel for IoChannel<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.io.read(buf).await
    }

    async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.io.write_all(buf).await
    }
}

/// Enumerates and opens link endpoints for hot-plug discovery.
///
/// `list_ports` must be cheap; the attach and detach watchers call it on
/// every poll tick.
pub trait PortScanner: Send + Sync + 'static {
    /// Names of the endpoints currently present.
    fn list_ports(&self) -> Vec<String>;

    /// Open a named endpoint, taking exclusive ownership of its stream.
    fn open(&self, port: &str) -> io::Result<Box<dyn Channel>>;
}
