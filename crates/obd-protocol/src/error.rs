//! OBD-II Error Types

use thiserror::Error;

/// Errors that can occur while talking to an OBD-II adapter.
///
/// Only channel-level failures are represented here. A negative or empty
/// response from the vehicle is never an error: it surfaces as `None` or an
/// empty collection from the engine.
#[derive(Debug, Error)]
pub enum ObdError {
    /// The channel could not be opened or the adapter never answered
    #[error("Connection failed: {0}")]
    Connect(String),

    /// Read/write failure on an open channel
    #[error("Transport error: {0}")]
    Transport(String),

    /// Operation attempted without an open connection
    #[error("OBD adapter not connected")]
    NotConnected,

    /// A scope or bus-monitor loop already owns the engine
    #[error("A scope or bus monitor loop is already running")]
    ScopeAlreadyRunning,

    /// Adapter lacks a capability the operation needs
    #[error("Adapter does not support {0}")]
    Unsupported(&'static str),

    /// Name or hex literal did not resolve to a registered PID
    #[error("Unknown PID: {0}")]
    UnknownPid(String),

    /// Caller supplied a malformed argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl From<std::io::Error> for ObdError {
    fn from(err: std::io::Error) -> Self {
        ObdError::Transport(err.to_string())
    }
}

impl From<tokio_serial::Error> for ObdError {
    fn from(err: tokio_serial::Error) -> Self {
        ObdError::Connect(err.to_string())
    }
}
