//! In-memory ports for emulated devices.
//!
//! [`spawn_device`] wires a device state machine to one end of an
//! in-memory duplex stream and pumps frames through it: deframe input,
//! feed the machine, frame the replies. The other end is handed to a
//! [`DeviceLink`] exactly like a real serial port would be.
//!
//! [`ScriptedScanner`] is a [`PortScanner`] whose port set is mutated by
//! the test, driving the hot-plug watchers.
//!
//! [`DeviceLink`]: tellerline_core::DeviceLink

use std::{
    collections::BTreeMap,
    io,
    sync::{Arc, Mutex, PoisonError},
};

use tellerline_core::{
    Channel, IoChannel, PortScanner,
    framed::{read_frame, write_frame},
};
use tokio::io::{DuplexStream, duplex};
use tracing::debug;

use crate::Device;

/// Handle to a spawned device: inspect its state, or rip it out.
pub struct Endpoint<D> {
    device: Arc<Mutex<D>>,
    task: tokio::task::JoinHandle<()>,
}

impl<D> Endpoint<D> {
    /// Run `f` against the device state.
    pub fn with_device<R>(&self, f: impl FnOnce(&D) -> R) -> R {
        let guard = self.device.lock().unwrap_or_else(PoisonError::into_inner);
        f(&guard)
    }

    /// Simulate yanking the device mid-conversation: the pump task is
    /// aborted and its stream end dropped, so the controller side sees
    /// the channel close.
    pub fn unplug(self) {
        self.task.abort();
    }
}

/// Spawn `device` behind an in-memory port, returning the controller-side
/// channel and a handle to the device.
pub fn spawn_device<D: Device>(device: D) -> (Box<dyn Channel>, Endpoint<D>) {
    let (near, far) = duplex(4096);
    let device = Arc::new(Mutex::new(device));
    let task = tokio::spawn(pump(IoChannel::new(far), Arc::clone(&device)));
    (Box::new(IoChannel::new(near)), Endpoint { device, task })
}

/// Deframe, transition, frame. Exits when either stream end closes.
async fn pump<D: Device>(mut chan: IoChannel<DuplexStream>, device: Arc<Mutex<D>>) {
    loop {
        let Ok(msg) = read_frame(&mut chan).await else {
            debug!("device port closed");
            return;
        };
        let replies = {
            let mut dev = device.lock().unwrap_or_else(PoisonError::into_inner);
            dev.handle(&msg)
        };
        for reply in replies {
            if write_frame(&mut chan, &reply).await.is_err() {
                return;
            }
        }
    }
}

type PortFactory = Box<dyn Fn() -> Box<dyn Channel> + Send + Sync>;

/// [`PortScanner`] over a test-controlled port table.
///
/// Each [`plug`](Self::plug) registers a factory; every `open` of that
/// port calls it, so a re-probed port gets a fresh channel. Clones share
/// the table.
#[derive(Clone, Default)]
pub struct ScriptedScanner {
    ports: Arc<Mutex<BTreeMap<String, PortFactory>>>,
}

impl ScriptedScanner {
    /// Empty scanner.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `port` visible, backed by `factory`.
    pub fn plug(
        &self,
        port: &str,
        factory: impl Fn() -> Box<dyn Channel> + Send + Sync + 'static,
    ) {
        let mut ports = self.ports.lock().unwrap_or_else(PoisonError::into_inner);
        ports.insert(port.to_string(), Box::new(factory));
    }

    /// Remove `port` from the visible set.
    pub fn unplug(&self, port: &str) {
        let mut ports = self.ports.lock().unwrap_or_else(PoisonError::into_inner);
        ports.remove(port);
    }
}

impl PortScanner for ScriptedScanner {
    fn list_ports(&self) -> Vec<String> {
        let ports = self.ports.lock().unwrap_or_else(PoisonError::into_inner);
        ports.keys().cloned().collect()
    }

    fn open(&self, port: &str) -> io::Result<Box<dyn Channel>> {
        let ports = self.ports.lock().unwrap_or_else(PoisonError::into_inner);
        ports
            .get(port)
            .map(|factory| factory())
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such port"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct UpperEcho;

    impl Device for UpperEcho {
        fn handle(&mut self, msg: &[u8]) -> Vec<Vec<u8>> {
            vec![msg.to_ascii_uppercase()]
        }
    }

    #[tokio::test(start_paused = true)]
    async fn pump_frames_each_reply() {
        let (mut chan, endpoint) = spawn_device(UpperEcho);
        write_frame(chan.as_mut(), b"ready").await.unwrap();
        assert_eq!(read_frame(chan.as_mut()).await.unwrap(), b"READY");
        endpoint.unplug();
    }

    #[tokio::test(start_paused = true)]
    async fn unplug_closes_the_controller_side() {
        let (mut chan, endpoint) = spawn_device(UpperEcho);
        endpoint.unplug();
        // Abort drops the far end; the next read observes the close.
        assert!(read_frame(chan.as_mut()).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn scanner_lists_and_opens_plugged_ports() {
        let scanner = ScriptedScanner::new();
        assert!(scanner.list_ports().is_empty());

        scanner.plug("vdev0", || spawn_device(UpperEcho).0);
        assert_eq!(scanner.list_ports(), vec!["vdev0".to_string()]);
        assert!(scanner.open("vdev0").is_ok());

        scanner.unplug("vdev0");
        assert!(scanner.open("vdev0").is_err());
    }
}
