//! Adapter transports and the serialized command channel.
//!
//! A [`Connection`] owns exactly one physical link (serial SPP, BLE or TCP)
//! and guarantees at most one command is in flight at a time.

mod ble;
pub mod clean;
mod discovery;
mod stream;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::ObdError;

pub use ble::{BleLink, GattChannel, NotificationSink, DEFAULT_BLE_MTU, NOTIFICATION_QUEUE_CAPACITY};
pub use clean::{clean_response, is_echo, looks_like_response, parse_adapter_identity};
pub use discovery::{filter_adapters, AdapterTarget, DeviceType, DiscoveredAdapter, KnownDevice};
pub use stream::{ByteStream, StreamLink, TCP_CONNECT_TIMEOUT};

/// Default per-command timeout
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(2);

/// `ATZ` can take seconds on cheap clones
pub const RESET_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause after reset before the adapter accepts commands reliably
pub const RESET_SETTLE: Duration = Duration::from_millis(500);

/// Commands sent after reset, in order. Responses are discarded.
pub const INIT_SEQUENCE: &[&str] = &["ATE0", "ATL0", "ATS0", "ATSP0"];

/// Physical channel kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportKind {
    /// Bluetooth Classic serial port profile
    SerialSpp,
    /// Bluetooth Low Energy
    Ble,
    /// WiFi adapter over TCP
    Tcp,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::SerialSpp => write!(f, "Bluetooth SPP"),
            TransportKind::Ble => write!(f, "BLE"),
            TransportKind::Tcp => write!(f, "WiFi"),
        }
    }
}

/// The closed set of physical links
enum Link {
    Stream(StreamLink),
    Ble(BleLink),
}

impl Link {
    async fn exchange(&mut self, command: &str, timeout: Duration) -> Result<String, ObdError> {
        match self {
            Link::Stream(link) => link.exchange(command, timeout).await,
            Link::Ble(link) => link.exchange(command, timeout).await,
        }
    }

    async fn interrupt(&mut self, timeout: Duration) -> Result<String, ObdError> {
        match self {
            Link::Stream(link) => link.interrupt(timeout).await,
            Link::Ble(link) => link.exchange("", timeout).await,
        }
    }

    async fn read_pending(&mut self, window: Duration) -> Result<String, ObdError> {
        match self {
            Link::Stream(link) => link.read_pending(window).await,
            Link::Ble(link) => link.read_pending(window).await,
        }
    }

    async fn close(&mut self) {
        match self {
            Link::Stream(link) => link.close().await,
            Link::Ble(link) => link.close().await,
        }
    }
}

/// Adapter identity parsed from the reset banner
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdapterIdentity {
    pub name: String,
    pub version: String,
}

/// A serialized command channel to one adapter
pub struct Connection {
    kind: TransportKind,
    link: tokio::sync::Mutex<Option<Link>>,
    connected: AtomicBool,
    identity: Mutex<AdapterIdentity>,
    last_activity: Mutex<Instant>,
}

impl Connection {
    fn with_link(kind: TransportKind, link: Link) -> Self {
        Self {
            kind,
            link: tokio::sync::Mutex::new(Some(link)),
            connected: AtomicBool::new(true),
            identity: Mutex::new(AdapterIdentity {
                name: "Unknown ELM327".to_string(),
                version: String::new(),
            }),
            last_activity: Mutex::new(Instant::now()),
        }
    }

    /// Wrap an open byte stream. The adapter is not initialized yet.
    pub fn from_stream<S: ByteStream + 'static>(kind: TransportKind, stream: S) -> Self {
        Self::with_link(kind, Link::Stream(StreamLink::new(stream)))
    }

    /// Wrap a BLE link. Register its sink with the GATT callback first.
    pub fn from_ble(link: BleLink) -> Self {
        Self::with_link(TransportKind::Ble, Link::Ble(link))
    }

    /// Open the channel described by `target` and run the AT initialization.
    pub async fn connect(target: AdapterTarget) -> Result<Self, ObdError> {
        let connection = match target {
            AdapterTarget::Serial { path, baud_rate } => {
                let link = StreamLink::open_serial(&path, baud_rate)?;
                Self::with_link(TransportKind::SerialSpp, Link::Stream(link))
            }
            AdapterTarget::Tcp { host, port } => {
                let link = StreamLink::open_tcp(&host, port).await?;
                Self::with_link(TransportKind::Tcp, Link::Stream(link))
            }
            AdapterTarget::Ble(link) => Self::from_ble(link),
        };

        if let Err(e) = connection.initialize().await {
            connection.disconnect().await;
            return Err(e);
        }
        Ok(connection)
    }

    /// Wake the adapter (serial only) and run the AT init sequence.
    pub async fn initialize(&self) -> Result<(), ObdError> {
        if self.kind == TransportKind::SerialSpp {
            let mut guard = self.link.lock().await;
            if let Some(Link::Stream(link)) = guard.as_mut() {
                let woken = link.wake_up().await;
                self.check(&mut guard, woken).await?;
            }
        }

        let reset = self.send_command("ATZ", RESET_TIMEOUT).await?;
        tokio::time::sleep(RESET_SETTLE).await;
        if reset.trim().is_empty() {
            return Err(ObdError::Connect("adapter did not answer ATZ".into()));
        }

        let (name, version) = parse_adapter_identity(&reset);
        info!(adapter = %name, version = %version, transport = %self.kind, "Adapter reset");
        *lock(&self.identity) = AdapterIdentity { name, version };

        for command in INIT_SEQUENCE {
            self.send_command(command, COMMAND_TIMEOUT).await?;
        }
        Ok(())
    }

    /// Send one command and return the cleaned response.
    ///
    /// Callers are serialized; a timeout yields whatever partial text arrived.
    pub async fn send_command(&self, command: &str, timeout: Duration) -> Result<String, ObdError> {
        let mut guard = self.link.lock().await;
        let link = guard.as_mut().ok_or(ObdError::NotConnected)?;

        *lock(&self.last_activity) = Instant::now();
        debug!(">> {}", command);
        let raw = link.exchange(command, timeout).await;
        let raw = self.check(&mut guard, raw).await?;
        let cleaned = clean_response(&raw, command);
        debug!("<< {}", cleaned.replace('\n', " | "));
        Ok(cleaned)
    }

    /// Send a lone carriage return without draining pending input first,
    /// then read up to the prompt. This is how a running bus monitor is
    /// stopped.
    pub async fn interrupt(&self, timeout: Duration) -> Result<String, ObdError> {
        let mut guard = self.link.lock().await;
        let link = guard.as_mut().ok_or(ObdError::NotConnected)?;

        *lock(&self.last_activity) = Instant::now();
        debug!(">> <interrupt>");
        let raw = link.interrupt(timeout).await;
        let raw = self.check(&mut guard, raw).await?;
        let cleaned = clean_response(&raw, "");
        debug!("<< {}", cleaned.replace('\n', " | "));
        Ok(cleaned)
    }

    /// Read unsolicited output (bus monitor frames) for up to `window`.
    pub async fn read_pending(&self, window: Duration) -> Result<String, ObdError> {
        let mut guard = self.link.lock().await;
        let link = guard.as_mut().ok_or(ObdError::NotConnected)?;
        let pending = link.read_pending(window).await;
        self.check(&mut guard, pending).await
    }

    /// A transport fault leaves the link unusable: drop it so later calls
    /// see `NotConnected`.
    async fn check<T>(&self, link: &mut Option<Link>, result: Result<T, ObdError>) -> Result<T, ObdError> {
        if let Err(ObdError::Transport(reason)) = &result {
            warn!(transport = %self.kind, "Adapter channel lost: {}", reason);
            self.connected.store(false, Ordering::SeqCst);
            if let Some(mut dead) = link.take() {
                dead.close().await;
            }
        }
        result
    }

    /// Release the channel. Idempotent, never fails.
    pub async fn disconnect(&self) {
        let link = self.link.lock().await.take();
        self.connected.store(false, Ordering::SeqCst);
        if let Some(mut link) = link {
            info!(transport = %self.kind, "Disconnecting adapter");
            link.close().await;
        } else {
            debug!("Disconnect on a closed connection");
        }
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn identity(&self) -> AdapterIdentity {
        lock(&self.identity).clone()
    }

    pub fn adapter_name(&self) -> String {
        lock(&self.identity).name.clone()
    }

    pub fn adapter_version(&self) -> String {
        lock(&self.identity).version.clone()
    }

    /// Timestamp of the last command sent
    pub fn last_activity(&self) -> Instant {
        *lock(&self.last_activity)
    }

    /// Time since the last command was sent
    pub fn idle_time(&self) -> Duration {
        self.last_activity().elapsed()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
