//! Byte-stream links: Bluetooth SPP (serial) and WiFi (TCP).
//!
//! Both carry the ELM327 text protocol unframed, so they share one reader
//! that accumulates bytes until the prompt arrives.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, info, warn};

use crate::error::ObdError;
use crate::transport::clean::PROMPT;

/// Connect deadline for WiFi adapters, separate from per-command timeouts
pub const TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Wake-up attempts before declaring a serial adapter dead
const WAKE_ATTEMPTS: usize = 5;
const WAKE_TIMEOUT: Duration = Duration::from_secs(2);

/// How long a stale-input drain waits for more bytes
const FLUSH_WINDOW: Duration = Duration::from_millis(5);
/// Upper bounds on one drain; a monitoring adapter never goes quiet
const FLUSH_LIMIT: Duration = Duration::from_millis(50);
const FLUSH_MAX_BYTES: usize = 4096;

const READ_CHUNK: usize = 256;

/// Anything that moves bytes both ways: a serial port, a socket, a pipe.
pub trait ByteStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ByteStream for T {}

/// Prompt-framed link over a byte stream
pub struct StreamLink {
    stream: Box<dyn ByteStream>,
}

impl StreamLink {
    /// Wrap an already-open stream
    pub fn new<S: ByteStream + 'static>(stream: S) -> Self {
        Self {
            stream: Box::new(stream),
        }
    }

    /// Open a serial device (an RFCOMM-bound SPP port or a USB cable)
    pub fn open_serial(path: &str, baud_rate: u32) -> Result<Self, ObdError> {
        info!(path, baud_rate, "Opening serial adapter");
        let port = tokio_serial::new(path, baud_rate)
            .timeout(Duration::from_millis(100))
            .open_native_async()?;
        Ok(Self::new(port))
    }

    /// Open a TCP connection to a WiFi adapter
    pub async fn open_tcp(host: &str, port: u16) -> Result<Self, ObdError> {
        Self::open_tcp_within(host, port, TCP_CONNECT_TIMEOUT).await
    }

    async fn open_tcp_within(host: &str, port: u16, deadline: Duration) -> Result<Self, ObdError> {
        info!(host, port, "Connecting to WiFi adapter");
        let stream = timeout(deadline, TcpStream::connect((host, port)))
            .await
            .map_err(|_| {
                ObdError::Connect(format!(
                    "timed out after {}ms connecting to {host}:{port}",
                    deadline.as_millis()
                ))
            })?
            .map_err(|e| ObdError::Connect(format!("{host}:{port}: {e}")))?;
        stream.set_nodelay(true)?;
        Ok(Self::new(stream))
    }

    /// Nudge a sleeping adapter with empty lines until it shows a prompt.
    pub async fn wake_up(&mut self) -> Result<(), ObdError> {
        for attempt in 1..=WAKE_ATTEMPTS {
            let raw = self.exchange("", WAKE_TIMEOUT).await?;
            if raw.contains(PROMPT) || !raw.trim().is_empty() {
                debug!(attempt, "Adapter awake");
                return Ok(());
            }
            warn!(attempt, "Adapter did not answer wake-up");
        }
        Err(ObdError::Connect(format!(
            "adapter did not wake after {WAKE_ATTEMPTS} attempts"
        )))
    }

    /// Send one command and read until the prompt or `deadline`.
    ///
    /// A timeout is not an error; whatever arrived is returned.
    pub async fn exchange(&mut self, command: &str, deadline: Duration) -> Result<String, ObdError> {
        self.flush_input().await?;

        let mut line = String::with_capacity(command.len() + 1);
        line.push_str(command);
        line.push('\r');
        self.stream.write_all(line.as_bytes()).await?;
        self.stream.flush().await?;

        self.read_until_prompt(deadline).await
    }

    /// Write a bare carriage return and read until the prompt.
    ///
    /// Stops a running bus monitor. Nothing is drained first: the monitor's
    /// output is exactly what this reads through.
    pub async fn interrupt(&mut self, deadline: Duration) -> Result<String, ObdError> {
        self.stream.write_all(b"\r").await?;
        self.stream.flush().await?;
        self.read_until_prompt(deadline).await
    }

    /// Collect whatever arrives within `window` without sending anything.
    pub async fn read_pending(&mut self, window: Duration) -> Result<String, ObdError> {
        let end = Instant::now() + window;
        let mut buf = Vec::new();
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            let remaining = end.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match timeout(remaining, self.stream.read(&mut chunk)).await {
                Ok(Ok(0)) => return Err(ObdError::Transport("adapter closed the channel".into())),
                Ok(Ok(n)) => buf.extend_from_slice(&chunk[..n]),
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => break,
            }
        }
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    /// Shut the stream down, ignoring failures.
    pub async fn close(&mut self) {
        if let Err(e) = self.stream.shutdown().await {
            debug!("Ignoring shutdown error: {}", e);
        }
    }

    async fn read_until_prompt(&mut self, deadline: Duration) -> Result<String, ObdError> {
        let end = Instant::now() + deadline;
        let mut buf = Vec::new();
        let mut chunk = [0u8; READ_CHUNK];

        loop {
            let remaining = end.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                debug!(bytes = buf.len(), "Read timed out before prompt");
                break;
            }
            match timeout(remaining, self.stream.read(&mut chunk)).await {
                Ok(Ok(0)) => return Err(ObdError::Transport("adapter closed the channel".into())),
                Ok(Ok(n)) => {
                    buf.extend_from_slice(&chunk[..n]);
                    if chunk[..n].contains(&(PROMPT as u8)) {
                        break;
                    }
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => {
                    debug!(bytes = buf.len(), "Read timed out before prompt");
                    break;
                }
            }
        }

        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    /// Discard bytes left over from a previous, timed-out exchange.
    ///
    /// Gives up after [`FLUSH_LIMIT`] or [`FLUSH_MAX_BYTES`] so a chatty
    /// adapter cannot hold the link.
    async fn flush_input(&mut self) -> Result<(), ObdError> {
        let end = Instant::now() + FLUSH_LIMIT;
        let mut flushed = 0;
        let mut quiet = false;
        let mut chunk = [0u8; READ_CHUNK];
        while flushed < FLUSH_MAX_BYTES {
            let window = FLUSH_WINDOW.min(end.saturating_duration_since(Instant::now()));
            if window.is_zero() {
                break;
            }
            match timeout(window, self.stream.read(&mut chunk)).await {
                Ok(Ok(0)) => return Err(ObdError::Transport("adapter closed the channel".into())),
                Ok(Ok(n)) => flushed += n,
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => {
                    quiet = true;
                    break;
                }
            }
        }
        if flushed > 0 {
            debug!(bytes = flushed, "Flushed stale input");
        }
        if !quiet {
            warn!(bytes = flushed, "Adapter still talking, sending anyway");
        }
        Ok(())
    }
}
