//! Connection state machine shared by every device transport.
//!
//! [`TransportManager`] owns at most one session with a pendant. It frames
//! the inbound byte stream into newline-delimited JSON, hands each message
//! to the [`Host`], serialises outbound messages, and keeps the link alive
//! with a fixed-delay reconnect timer. Everything link specific (discovery,
//! opening a session, client ids, which settings to persist) lives behind
//! the [`Driver`] trait.
//!
//! ```text
//! Uninitialized -> Idle -> Connecting -> Connected
//!                              ^            |
//!                              |            v
//!                  ReconnectScheduled <- Disconnected
//!
//! any state -> ShuttingDown (terminal)
//! ```
//!
//! Manager state sits behind a `parking_lot` mutex that is never held
//! across an `.await`; connect attempts are serialised by a separate async
//! lock so a second `connect` always tears down the first session before
//! opening its own.

use super::host::{ClientTransport, DeviceSettings, DiscoveredDevice, Host, SettingsPatch};
use crate::error::{Error, Result};
use crate::framing::LineFramer;
use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use log::{debug, info, trace, warn};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Delay between a lost connection and the next attempt.
pub const RECONNECT_DELAY: Duration = Duration::from_millis(5000);

/// Manager lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Phase {
    /// `initialize` has not succeeded yet.
    Uninitialized,
    /// Ready, no session.
    Idle,
    /// A connect attempt is in flight.
    Connecting,
    /// A session is open.
    Connected,
    /// The last session ended or the last attempt failed.
    Disconnected,
    /// A reconnect timer is armed.
    ReconnectScheduled,
    /// Terminal.
    ShuttingDown,
}

/// Snapshot returned by [`TransportManager::status`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Status<T> {
    /// `initialize` succeeded.
    pub initialized: bool,
    /// A session is open.
    pub connected: bool,
    /// Device of the open session.
    pub device: Option<T>,
    /// Client id of the open session.
    pub client_id: Option<String>,
    /// Current phase.
    pub phase: Phase,
    /// A reconnect timer is armed.
    pub reconnect_pending: bool,
}

/// Write half of an open session.
#[async_trait]
pub trait Link: Send + Sync {
    /// Write one encoded message.
    async fn send(&self, data: &[u8]) -> Result<()>;

    /// Close the session. Must be safe to call more than once.
    async fn close(&self);
}

/// An open session as produced by a [`Driver`].
///
/// `inbound` ends when the device goes away; the manager treats that as a
/// device-initiated close.
pub struct Connection {
    /// Raw bytes from the device, in wire order.
    pub inbound: BoxStream<'static, Vec<u8>>,
    /// Write half.
    pub link: Arc<dyn Link>,
}

/// Link-specific half of a transport.
#[async_trait]
pub trait Driver: Send + Sync + 'static {
    /// Device description used to connect and reported in [`Status`].
    type Target: Clone + Debug + Serialize + Send + Sync + 'static;

    /// Id the transport registers under with the host.
    const TRANSPORT_ID: &'static str;

    /// Whether the backend is usable on this machine.
    async fn probe(&self) -> Result<bool>;

    /// Discover nearby devices for at most `duration`.
    async fn scan(&self, duration: Duration) -> Result<Vec<DiscoveredDevice>>;

    /// Open a session. Returns the target as resolved during the handshake
    /// (e.g. with a looked-up channel filled in).
    async fn open(&self, target: &Self::Target) -> Result<(Self::Target, Connection)>;

    /// Stable client id derived from the device address.
    fn client_id(&self, target: &Self::Target) -> String;

    /// Saved device to reconnect to, if any.
    fn saved_target(&self, settings: &DeviceSettings) -> Option<Self::Target>;

    /// Whether automatic (re)connection is enabled.
    fn auto_connect(&self, settings: &DeviceSettings) -> bool;

    /// Settings to write through after a successful connect.
    fn remember(&self, target: &Self::Target) -> SettingsPatch;
}

struct Session<T> {
    generation: u64,
    target: T,
    client_id: String,
    link: Arc<dyn Link>,
    reader: JoinHandle<()>,
}

struct State<T> {
    phase: Phase,
    initialized: bool,
    scanning: bool,
    session: Option<Session<T>>,
    generation: u64,
    reconnect: Option<(u64, JoinHandle<()>)>,
    ticket: u64,
}

impl<T> State<T> {
    fn shutting_down(&self) -> bool {
        self.phase == Phase::ShuttingDown
    }
}

struct Inner<D: Driver> {
    driver: D,
    host: Arc<dyn Host>,
    state: Mutex<State<D::Target>>,
    connect_lock: tokio::sync::Mutex<()>,
}

/// One transport's connection manager. Cheap to clone; clones share state.
pub struct TransportManager<D: Driver> {
    inner: Arc<Inner<D>>,
}

impl<D: Driver> Clone for TransportManager<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct ScanGuard<'a, T>(&'a Mutex<State<T>>);

impl<T> Drop for ScanGuard<'_, T> {
    fn drop(&mut self) {
        self.0.lock().scanning = false;
    }
}

impl<D: Driver> TransportManager<D> {
    /// Create an uninitialized manager.
    pub fn new(driver: D, host: Arc<dyn Host>) -> Self {
        Self {
            inner: Arc::new(Inner {
                driver,
                host,
                state: Mutex::new(State {
                    phase: Phase::Uninitialized,
                    initialized: false,
                    scanning: false,
                    session: None,
                    generation: 0,
                    reconnect: None,
                    ticket: 0,
                }),
                connect_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Id this transport registers under.
    pub fn transport_id(&self) -> &'static str {
        D::TRANSPORT_ID
    }

    /// The link driver.
    pub fn driver(&self) -> &D {
        &self.inner.driver
    }

    /// Probe the backend, register with the host and start the saved
    /// device's auto-connect.
    ///
    /// Returns `Ok(false)` when the backend is unavailable on this machine.
    /// Calling it again after success is a no-op.
    pub async fn initialize(&self) -> Result<bool> {
        let id = D::TRANSPORT_ID;
        {
            let state = self.inner.state.lock();
            if state.shutting_down() {
                return Err(Error::ShuttingDown);
            }
            if state.initialized {
                return Ok(true);
            }
        }

        if !self.inner.driver.probe().await? {
            info!("[{id}] Transport unavailable on this host");
            return Ok(false);
        }

        {
            let mut state = self.inner.state.lock();
            if state.shutting_down() {
                return Err(Error::ShuttingDown);
            }
            state.initialized = true;
            state.phase = Phase::Idle;
        }
        self.inner
            .host
            .register_client_transport(id, Arc::new(self.clone()));
        info!("[{id}] Transport initialized");

        let settings = self.inner.host.settings();
        if self.inner.driver.auto_connect(&settings) {
            if let Some(target) = self.inner.driver.saved_target(&settings) {
                let this = self.clone();
                tokio::spawn(async move { this.auto_connect(target).await });
            }
        }
        Ok(true)
    }

    async fn auto_connect(&self, target: D::Target) {
        let _guard = self.inner.connect_lock.lock().await;
        {
            let state = self.inner.state.lock();
            if state.shutting_down() || state.session.is_some() {
                return;
            }
        }
        if let Err(e) = self.connect_locked(target).await {
            warn!("[{}] Auto-connect failed: {e}", D::TRANSPORT_ID);
            self.schedule_reconnect();
        }
    }

    /// Discover nearby devices. Only one scan runs at a time.
    pub async fn scan_devices(&self, duration: Duration) -> Result<Vec<DiscoveredDevice>> {
        self.ensure_ready()?;
        {
            let mut state = self.inner.state.lock();
            if state.scanning {
                return Err(Error::ScanInProgress);
            }
            state.scanning = true;
        }
        let _guard = ScanGuard(&self.inner.state);

        debug!("[{}] Scanning for {}ms", D::TRANSPORT_ID, duration.as_millis());
        let devices = self.inner.driver.scan(duration).await?;
        info!("[{}] Found {} device(s)", D::TRANSPORT_ID, devices.len());
        Ok(devices)
    }

    /// Connect to `target`, replacing any open session.
    ///
    /// Failures are returned to the caller; no reconnect is scheduled.
    pub async fn connect(&self, target: D::Target) -> Result<()> {
        self.ensure_ready()?;
        self.cancel_reconnect();
        let _guard = self.inner.connect_lock.lock().await;
        // A timer may have been armed while we waited.
        self.cancel_reconnect();
        self.connect_locked(target).await
    }

    /// Close the open session, if any, and cancel a pending reconnect.
    pub async fn disconnect(&self) {
        self.cancel_reconnect();
        let _guard = self.inner.connect_lock.lock().await;
        self.cancel_reconnect();
        self.teardown().await;

        let mut state = self.inner.state.lock();
        if state.initialized && !state.shutting_down() {
            state.phase = Phase::Idle;
        }
    }

    /// Enter the terminal shutdown phase and close everything.
    pub async fn shutdown(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.shutting_down() {
                return;
            }
            state.phase = Phase::ShuttingDown;
            if let Some((_, handle)) = state.reconnect.take() {
                handle.abort();
            }
        }
        self.teardown().await;
        info!("[{}] Transport shut down", D::TRANSPORT_ID);
    }

    /// Current status snapshot.
    pub fn status(&self) -> Status<D::Target> {
        let state = self.inner.state.lock();
        Status {
            initialized: state.initialized,
            connected: state.session.is_some(),
            device: state.session.as_ref().map(|s| s.target.clone()),
            client_id: state.session.as_ref().map(|s| s.client_id.clone()),
            phase: state.phase,
            reconnect_pending: state.reconnect.is_some(),
        }
    }

    /// Whether a session is open.
    pub fn is_connected(&self) -> bool {
        self.inner.state.lock().session.is_some()
    }

    /// Whether a reconnect timer is armed.
    pub fn reconnect_pending(&self) -> bool {
        self.inner.state.lock().reconnect.is_some()
    }

    /// Encode `message` as one JSON line and write it to the device.
    pub async fn send(&self, message: &Value) -> Result<()> {
        let link = self
            .inner
            .state
            .lock()
            .session
            .as_ref()
            .map(|s| Arc::clone(&s.link))
            .ok_or_else(|| Error::Connection("not connected".to_string()))?;

        let mut line = serde_json::to_string(message)?;
        line.push('\n');
        link.send(line.as_bytes()).await
    }

    fn ensure_ready(&self) -> Result<()> {
        let state = self.inner.state.lock();
        if state.shutting_down() {
            Err(Error::ShuttingDown)
        } else if !state.initialized {
            Err(Error::NotInitialized)
        } else {
            Ok(())
        }
    }

    fn cancel_reconnect(&self) {
        let mut state = self.inner.state.lock();
        if let Some((_, handle)) = state.reconnect.take() {
            handle.abort();
            if state.phase == Phase::ReconnectScheduled {
                state.phase = Phase::Disconnected;
            }
            debug!("[{}] Cancelled pending reconnect", D::TRANSPORT_ID);
        }
    }

    /// Connect with `connect_lock` already held.
    async fn connect_locked(&self, target: D::Target) -> Result<()> {
        let id = D::TRANSPORT_ID;
        self.teardown().await;
        {
            let mut state = self.inner.state.lock();
            if state.shutting_down() {
                return Err(Error::ShuttingDown);
            }
            state.phase = Phase::Connecting;
        }

        info!("[{id}] Connecting to {target:?}");
        let (target, connection) = match self.inner.driver.open(&target).await {
            Ok(opened) => opened,
            Err(e) => {
                let mut state = self.inner.state.lock();
                if state.phase == Phase::Connecting {
                    state.phase = Phase::Disconnected;
                }
                return Err(e);
            },
        };

        let client_id = self.inner.driver.client_id(&target);
        let Connection { inbound, link } = connection;
        let rejected = {
            let mut state = self.inner.state.lock();
            if state.shutting_down() {
                Some(link)
            } else {
                state.generation += 1;
                let generation = state.generation;
                let reader = tokio::spawn(self.clone().read_loop(
                    generation,
                    client_id.clone(),
                    inbound,
                ));
                state.session = Some(Session {
                    generation,
                    target: target.clone(),
                    client_id: client_id.clone(),
                    link,
                    reader,
                });
                state.phase = Phase::Connected;
                None
            }
        };
        if let Some(link) = rejected {
            link.close().await;
            return Err(Error::ShuttingDown);
        }

        let patch = self.inner.driver.remember(&target);
        if !patch.is_empty() {
            self.inner.host.update_settings(patch);
        }
        info!("[{id}] Connected as {client_id}");
        Ok(())
    }

    async fn teardown(&self) {
        let session = {
            let mut state = self.inner.state.lock();
            let session = state.session.take();
            if session.is_some() && !state.shutting_down() {
                state.phase = Phase::Disconnected;
            }
            session
        };
        if let Some(session) = session {
            session.reader.abort();
            session.link.close().await;
            info!("[{}] Closed session {}", D::TRANSPORT_ID, session.client_id);
        }
    }

    async fn read_loop(
        self,
        generation: u64,
        client_id: String,
        mut inbound: BoxStream<'static, Vec<u8>>,
    ) {
        let id = D::TRANSPORT_ID;
        let mut framer = LineFramer::new();
        while let Some(chunk) = inbound.next().await {
            for line in framer.feed(&chunk) {
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<Value>(&line) {
                    Ok(message) => self
                        .inner
                        .host
                        .submit_client_message(id, &client_id, message),
                    Err(e) => warn!("[{id}] Dropping non-JSON line from {client_id}: {e}"),
                }
            }
        }
        if !framer.pending().is_empty() {
            debug!(
                "[{id}] Discarding {} bytes of unterminated input",
                framer.pending().len()
            );
        }
        self.session_closed(generation).await;
    }

    /// Device-side close of the session tagged `generation`.
    async fn session_closed(&self, generation: u64) {
        let session = {
            let mut state = self.inner.state.lock();
            match &state.session {
                Some(s) if s.generation == generation => {},
                _ => return,
            }
            if !state.shutting_down() {
                state.phase = Phase::Disconnected;
            }
            state.session.take()
        };
        // Runs on the reader task itself; its handle is dropped, not aborted.
        if let Some(session) = session {
            warn!("[{}] Connection {} lost", D::TRANSPORT_ID, session.client_id);
            session.link.close().await;
        }
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&self) {
        let id = D::TRANSPORT_ID;
        let settings = self.inner.host.settings();
        let mut state = self.inner.state.lock();
        if let Some((_, handle)) = state.reconnect.take() {
            handle.abort();
        }
        if state.shutting_down() || !state.initialized {
            return;
        }
        if self.inner.driver.saved_target(&settings).is_none() {
            debug!("[{id}] No saved device, not reconnecting");
            return;
        }
        if !self.inner.driver.auto_connect(&settings) {
            debug!("[{id}] Auto-connect disabled, not reconnecting");
            return;
        }

        state.ticket += 1;
        let ticket = state.ticket;
        let this = self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(RECONNECT_DELAY).await;
            this.run_reconnect(ticket).await;
        });
        state.reconnect = Some((ticket, handle));
        state.phase = Phase::ReconnectScheduled;
        info!(
            "[{id}] Reconnecting in {}ms",
            RECONNECT_DELAY.as_millis()
        );
    }

    async fn run_reconnect(&self, ticket: u64) {
        let id = D::TRANSPORT_ID;
        let _guard = self.inner.connect_lock.lock().await;
        {
            let mut state = self.inner.state.lock();
            if !matches!(state.reconnect, Some((t, _)) if t == ticket) {
                return;
            }
            // Detach our own handle so a failed attempt can re-arm.
            state.reconnect = None;
            if state.shutting_down() || state.session.is_some() {
                return;
            }
        }

        let Some(target) = self.inner.driver.saved_target(&self.inner.host.settings()) else {
            debug!("[{id}] Saved device was cleared, not reconnecting");
            return;
        };
        match self.connect_locked(target).await {
            Ok(()) => info!("[{id}] Reconnected"),
            Err(e) => {
                warn!("[{id}] Reconnect failed: {e}");
                self.schedule_reconnect();
            },
        }
    }
}

#[async_trait]
impl<D: Driver> ClientTransport for TransportManager<D> {
    async fn on_broadcast(&self, kind: &str, message: &Value) {
        if !self.is_connected() {
            trace!("[{}] Not connected, dropping {kind} broadcast", D::TRANSPORT_ID);
            return;
        }
        if let Err(e) = self.send(message).await {
            warn!("[{}] Failed to relay {kind} broadcast: {e}", D::TRANSPORT_ID);
        }
    }

    async fn on_shutdown(&self) {
        self.shutdown().await;
    }
}
