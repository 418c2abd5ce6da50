//! Device link management.
//!
//! A [`DeviceLink`] is the long-lived handle for one device slot (the card
//! slot or the HSM bay). The physical channel behind it comes and goes:
//! a [`PortWatcher`] polls a [`PortScanner`] for new endpoints, probes
//! them, and installs the channel when the right kind of device shows up.
//! Protocol clients borrow the link for framed I/O and never learn which
//! port backs it.
//!
//! The channel lives under a [`tokio::sync::Mutex`] held for one framed
//! operation at a time. Any session-fatal failure drops the channel in
//! place, so a half-dead endpoint cannot poison the next session.

use std::{collections::HashSet, sync::Arc, time::Duration};

use tellerline_proto::{DeviceKind, SessionMode, SyncTag, literals};
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

use crate::{
    channel::{Channel, PortScanner},
    env::Environment,
    error::LinkError,
    framed::{read_frame_timeout, write_frame_settled},
    sync::{TagOutcome, classify, mode_mismatch, probe},
};

/// Timing and retry knobs for a device link.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Quiet period after every framed write, giving the device time to
    /// consume the message before the next one lands.
    pub settle_delay: Duration,
    /// How long a framed read may wait before the peer counts as silent.
    pub read_timeout: Duration,
    /// How often the port watcher re-lists endpoints.
    pub poll_interval: Duration,
    /// Sync handshake attempts before giving up on a session.
    pub max_sync_attempts: u32,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_millis(100),
            read_timeout: Duration::from_secs(2),
            poll_interval: Duration::from_millis(250),
            max_sync_attempts: 8,
        }
    }
}

/// Link lifecycle, driven by handshake outcome and I/O failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// No device present. Framed I/O fails with [`LinkError::DeviceRemoved`].
    Disconnected,
    /// A probed device is installed; no session has been opened yet.
    AwaitingSync,
    /// The last handshake opened a provisioning session.
    Provisioning,
    /// The last handshake opened an operational session.
    Operational,
}

impl LinkState {
    /// True unless the link is [`Disconnected`](Self::Disconnected).
    #[must_use]
    pub fn is_attached(self) -> bool {
        self != Self::Disconnected
    }
}

struct Shared<E: Environment> {
    kind: DeviceKind,
    config: LinkConfig,
    env: E,
    channel: Mutex<Option<Box<dyn Channel>>>,
    state: watch::Sender<LinkState>,
}

/// Handle for one device slot. Cheap to clone; all clones share the
/// installed channel and observe the same attach state.
pub struct DeviceLink<E: Environment> {
    shared: Arc<Shared<E>>,
}

impl<E: Environment> Clone for DeviceLink<E> {
    fn clone(&self) -> Self {
        Self { shared: Arc::clone(&self.shared) }
    }
}

impl<E: Environment> DeviceLink<E> {
    /// Create a detached link for `kind` devices.
    #[must_use]
    pub fn new(kind: DeviceKind, env: E, config: LinkConfig) -> Self {
        let (state, _) = watch::channel(LinkState::Disconnected);
        Self {
            shared: Arc::new(Shared { kind, config, env, channel: Mutex::new(None), state }),
        }
    }

    /// Device kind this link accepts.
    #[must_use]
    pub fn kind(&self) -> DeviceKind {
        self.shared.kind
    }

    /// Link configuration.
    #[must_use]
    pub fn config(&self) -> &LinkConfig {
        &self.shared.config
    }

    /// Install a channel, replacing any previous one. The link enters
    /// [`LinkState::AwaitingSync`]; the next handshake sets the mode.
    pub async fn attach(&self, channel: Box<dyn Channel>) {
        let mut guard = self.shared.channel.lock().await;
        *guard = Some(channel);
        self.shared.state.send_replace(LinkState::AwaitingSync);
        info!(kind = ?self.shared.kind, "device attached");
    }

    /// Drop the installed channel, if any.
    pub async fn detach(&self) {
        let mut guard = self.shared.channel.lock().await;
        if guard.take().is_some() {
            info!(kind = ?self.shared.kind, "device detached");
        }
        self.shared.state.send_replace(LinkState::Disconnected);
    }

    /// Subscribe to attach-state changes.
    #[must_use]
    pub fn state(&self) -> watch::Receiver<LinkState> {
        self.shared.state.subscribe()
    }

    /// True if a channel is currently installed.
    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.shared.state.borrow().is_attached()
    }

    /// Wait until a device is attached.
    pub async fn wait_attached(&self) {
        let mut rx = self.shared.state.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|s| s.is_attached()).await;
    }

    /// Frame `payload` and write it to the device, then settle.
    ///
    /// # Errors
    ///
    /// [`LinkError::DeviceRemoved`] when detached or when the write hits a
    /// dead endpoint; [`LinkError::Protocol`] when `payload` exceeds the
    /// frame size.
    pub async fn push_msg(&self, payload: &[u8]) -> Result<(), LinkError> {
        let mut guard = self.shared.channel.lock().await;
        let chan = guard.as_mut().ok_or(LinkError::DeviceRemoved)?;
        let res = write_frame_settled(
            chan.as_mut(),
            &self.shared.env,
            payload,
            self.shared.config.settle_delay,
        )
        .await;
        self.after_io(&mut guard, res)
    }

    /// Read one framed message from the device.
    ///
    /// # Errors
    ///
    /// [`LinkError::DeviceRemoved`] when detached or when the endpoint
    /// closes; [`LinkError::ReadTimeout`] when the device goes silent;
    /// [`LinkError::Protocol`] on a truncated frame body.
    pub async fn pull_msg(&self) -> Result<Vec<u8>, LinkError> {
        let mut guard = self.shared.channel.lock().await;
        let chan = guard.as_mut().ok_or(LinkError::DeviceRemoved)?;
        let res =
            read_frame_timeout(chan.as_mut(), &self.shared.env, self.shared.config.read_timeout)
                .await;
        self.after_io(&mut guard, res)
    }

    /// Run the sync handshake, opening a `mode` session with the device.
    ///
    /// Retries through echoes and stale replies until the expected tag
    /// arrives, then confirms with `GO`. A tag of the right kind but the
    /// wrong mode is not retried; it is a caller-facing mismatch.
    ///
    /// # Errors
    ///
    /// [`LinkError::NotProvisioned`] / [`LinkError::AlreadyProvisioned`]
    /// on a mode mismatch, [`LinkError::SyncExhausted`] when the attempt
    /// budget runs out, plus any framed I/O failure.
    pub async fn sync(&self, mode: SessionMode) -> Result<(), LinkError> {
        let expected = SyncTag::expected(self.shared.kind, mode);
        for attempt in 1..=self.shared.config.max_sync_attempts {
            self.push_msg(literals::READY).await?;
            let reply = match self.pull_msg().await {
                Ok(reply) => reply,
                Err(LinkError::ReadTimeout { .. }) => {
                    debug!(attempt, kind = ?self.shared.kind, "sync read timed out");
                    continue;
                },
                Err(err) => return Err(err),
            };
            match classify(&reply, expected) {
                TagOutcome::Match => {
                    self.push_msg(literals::GO).await?;
                    self.shared.state.send_replace(match mode {
                        SessionMode::Provisioning => LinkState::Provisioning,
                        SessionMode::Operational => LinkState::Operational,
                    });
                    debug!(kind = ?self.shared.kind, ?mode, attempt, "session synchronized");
                    return Ok(());
                },
                TagOutcome::WrongMode => return Err(mode_mismatch(mode)),
                TagOutcome::Retry => {
                    debug!(attempt, kind = ?self.shared.kind, "stale sync reply, retrying");
                },
            }
        }
        Err(LinkError::SyncExhausted { attempts: self.shared.config.max_sync_attempts })
    }

    /// Spawn a background watcher that keeps this link attached to
    /// whatever matching device `scanner` exposes.
    ///
    /// Endpoints present at startup are probed on the first poll. A new
    /// endpoint is probed once when it appears; the probe tag decides
    /// whether it belongs to this link. When the attached endpoint drops
    /// out of the port list, the link detaches.
    pub fn spawn_watcher<S: PortScanner>(&self, scanner: S) -> PortWatcher {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let link = self.clone();
        let task = tokio::spawn(async move {
            let mut known: HashSet<String> = HashSet::new();
            let mut current: Option<String> = None;
            loop {
                tokio::select! {
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    },
                    () = link.shared.env.sleep(link.shared.config.poll_interval) => {},
                }

                let ports = scanner.list_ports();
                if let Some(port) = &current
                    && !ports.iter().any(|p| p == port)
                {
                    debug!(port, kind = ?link.shared.kind, "attached endpoint disappeared");
                    link.detach().await;
                    current = None;
                }

                if !link.is_attached() {
                    current = None;
                    for port in &ports {
                        if !known.contains(port) && link.try_adopt(&scanner, port).await {
                            current = Some(port.clone());
                            break;
                        }
                    }
                }

                known = ports.into_iter().collect();
            }
        });
        PortWatcher { stop: stop_tx, task }
    }

    /// Probe `port` and attach it if it carries a matching device.
    async fn try_adopt<S: PortScanner>(&self, scanner: &S, port: &str) -> bool {
        let mut chan = match scanner.open(port) {
            Ok(chan) => chan,
            Err(err) => {
                debug!(port, %err, "endpoint refused to open");
                return false;
            },
        };
        match probe(chan.as_mut(), &self.shared.env, &self.shared.config).await {
            Ok(tag) if tag.kind() == self.shared.kind => {
                info!(port, ?tag, "adopting endpoint");
                self.attach(chan).await;
                true
            },
            Ok(tag) => {
                debug!(port, ?tag, "endpoint carries a different device kind");
                false
            },
            Err(err) => {
                debug!(port, %err, "endpoint probe failed");
                false
            },
        }
    }

    /// Drop the channel on session-fatal failures so later operations see
    /// a clean detach instead of a wedged stream.
    fn after_io<T>(
        &self,
        guard: &mut Option<Box<dyn Channel>>,
        res: Result<T, LinkError>,
    ) -> Result<T, LinkError> {
        if let Err(err) = &res
            && err.is_fatal_to_session()
        {
            *guard = None;
            self.shared.state.send_replace(LinkState::Disconnected);
            warn!(kind = ?self.shared.kind, %err, "link lost mid-operation");
        }
        res
    }
}

/// Handle for a spawned port watcher.
pub struct PortWatcher {
    stop: watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
}

impl PortWatcher {
    /// Stop the watcher and wait for its task to exit.
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        let _ = self.task.await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use tokio::io::{DuplexStream, duplex};

    use super::*;
    use crate::{
        channel::IoChannel,
        env::SystemEnv,
        framed::{read_frame, write_frame},
    };

    fn test_link(kind: DeviceKind) -> DeviceLink<SystemEnv> {
        DeviceLink::new(
            kind,
            SystemEnv,
            LinkConfig {
                settle_delay: Duration::from_millis(10),
                read_timeout: Duration::from_millis(500),
                poll_interval: Duration::from_millis(50),
                max_sync_attempts: 4,
            },
        )
    }

    /// Peer task answering `READY` with `tag` and swallowing `GO`.
    async fn tag_device(mut chan: IoChannel<DuplexStream>, tag: &'static [u8]) {
        loop {
            let Ok(msg) = read_frame(&mut chan).await else { return };
            if msg == literals::READY {
                let _ = write_frame(&mut chan, tag).await;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn detached_link_refuses_io() {
        let link = test_link(DeviceKind::Card);
        assert!(!link.is_attached());
        assert_eq!(link.push_msg(b"1").await, Err(LinkError::DeviceRemoved));
        assert_eq!(link.pull_msg().await, Err(LinkError::DeviceRemoved));
    }

    #[tokio::test(start_paused = true)]
    async fn attach_is_visible_without_a_prior_subscriber() {
        // State changes must land even while nobody is watching; a late
        // subscriber sees the current state, not the initial one.
        let (near, _far) = duplex(256);
        let link = test_link(DeviceKind::Hsm);
        link.attach(Box::new(IoChannel::new(near))).await;

        assert!(link.is_attached());
        assert_eq!(*link.state().borrow(), LinkState::AwaitingSync);

        link.detach().await;
        assert!(!link.is_attached());
    }

    #[tokio::test(start_paused = true)]
    async fn push_and_pull_round_trip() {
        let (near, far) = duplex(256);
        let link = test_link(DeviceKind::Card);
        link.attach(Box::new(IoChannel::new(near))).await;

        let peer = tokio::spawn(async move {
            let mut chan = IoChannel::new(far);
            let msg = read_frame(&mut chan).await.unwrap();
            assert_eq!(msg, b"hello");
            write_frame(&mut chan, b"world").await.unwrap();
        });

        link.push_msg(b"hello").await.unwrap();
        assert_eq!(link.pull_msg().await.unwrap(), b"world");
        peer.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn peer_close_detaches_the_link() {
        let (near, far) = duplex(256);
        let link = test_link(DeviceKind::Card);
        link.attach(Box::new(IoChannel::new(near))).await;
        drop(far);

        assert_eq!(link.pull_msg().await, Err(LinkError::DeviceRemoved));
        assert!(!link.is_attached());
        // The dead channel is gone, not wedged.
        assert_eq!(link.pull_msg().await, Err(LinkError::DeviceRemoved));
    }

    #[tokio::test(start_paused = true)]
    async fn sync_confirms_matching_tag_with_go() {
        let (near, far) = duplex(256);
        let link = test_link(DeviceKind::Card);
        link.attach(Box::new(IoChannel::new(near))).await;

        let peer = tokio::spawn(async move {
            let mut chan = IoChannel::new(far);
            assert_eq!(read_frame(&mut chan).await.unwrap(), literals::READY);
            write_frame(&mut chan, b"CARD_N").await.unwrap();
            assert_eq!(read_frame(&mut chan).await.unwrap(), literals::GO);
        });

        link.sync(SessionMode::Operational).await.unwrap();
        peer.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn sync_retries_through_a_stale_echo() {
        let (near, far) = duplex(256);
        let link = test_link(DeviceKind::Hsm);
        link.attach(Box::new(IoChannel::new(near))).await;

        let peer = tokio::spawn(async move {
            let mut chan = IoChannel::new(far);
            // Stale reply from an interrupted session, then a clean tag.
            assert_eq!(read_frame(&mut chan).await.unwrap(), literals::READY);
            write_frame(&mut chan, b"BAD").await.unwrap();
            assert_eq!(read_frame(&mut chan).await.unwrap(), literals::READY);
            write_frame(&mut chan, b"HSM_N").await.unwrap();
            assert_eq!(read_frame(&mut chan).await.unwrap(), literals::GO);
        });

        link.sync(SessionMode::Operational).await.unwrap();
        peer.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn sync_reports_mode_mismatch_without_retrying() {
        let (near, far) = duplex(256);
        let link = test_link(DeviceKind::Card);
        link.attach(Box::new(IoChannel::new(near))).await;
        tokio::spawn(tag_device(IoChannel::new(far), b"CARD_P"));

        assert_eq!(link.sync(SessionMode::Operational).await, Err(LinkError::NotProvisioned));
    }

    #[tokio::test(start_paused = true)]
    async fn sync_gives_up_on_a_silent_device() {
        let (near, far) = duplex(256);
        let link = test_link(DeviceKind::Card);
        link.attach(Box::new(IoChannel::new(near))).await;
        // Peer reads but never answers.
        tokio::spawn(async move {
            let mut chan = IoChannel::new(far);
            while read_frame(&mut chan).await.is_ok() {}
        });

        assert_eq!(
            link.sync(SessionMode::Operational).await,
            Err(LinkError::SyncExhausted { attempts: 4 })
        );
    }

    /// Scanner over a mutable port list; every open spawns a tag device.
    struct TestScanner {
        ports: Arc<StdMutex<Vec<String>>>,
        tag: &'static [u8],
    }

    impl PortScanner for TestScanner {
        fn list_ports(&self) -> Vec<String> {
            self.ports.lock().unwrap().clone()
        }

        fn open(&self, _port: &str) -> std::io::Result<Box<dyn Channel>> {
            let (near, far) = duplex(256);
            tokio::spawn(tag_device(IoChannel::new(far), self.tag));
            Ok(Box::new(IoChannel::new(near)))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn watcher_adopts_a_new_matching_endpoint() {
        let ports = Arc::new(StdMutex::new(Vec::new()));
        let link = test_link(DeviceKind::Card);
        let watcher =
            link.spawn_watcher(TestScanner { ports: Arc::clone(&ports), tag: b"CARD_N" });

        assert!(!link.is_attached());
        ports.lock().unwrap().push("vdev0".to_string());
        link.wait_attached().await;

        watcher.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn watcher_ignores_the_wrong_device_kind() {
        let ports = Arc::new(StdMutex::new(vec!["vdev0".to_string()]));
        let link = test_link(DeviceKind::Card);
        let watcher =
            link.spawn_watcher(TestScanner { ports: Arc::clone(&ports), tag: b"HSM_N" });

        // Give the watcher several poll rounds on the paused clock.
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!link.is_attached());

        watcher.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn watcher_detaches_when_the_endpoint_vanishes() {
        let ports = Arc::new(StdMutex::new(vec!["vdev0".to_string()]));
        let link = test_link(DeviceKind::Hsm);
        let watcher =
            link.spawn_watcher(TestScanner { ports: Arc::clone(&ports), tag: b"HSM_N" });

        link.wait_attached().await;
        ports.lock().unwrap().clear();

        let mut state = link.state();
        state.wait_for(|s| *s == LinkState::Disconnected).await.unwrap();

        watcher.stop().await;
    }
}
