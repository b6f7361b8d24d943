//! Gateway error types

use obd_protocol::ObdError;
use thiserror::Error;

/// Errors surfaced by the session orchestrator and the tunnel
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Obd(#[from] ObdError),

    #[error("No adapter connected")]
    NotConnected,

    #[error("Settings error: {0}")]
    Settings(String),

    #[error("Tunnel error: {0}")]
    Tunnel(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Missing or malformed request fields
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl GatewayError {
    /// Status code reported back through the tunnel
    pub fn status(&self) -> u16 {
        match self {
            GatewayError::BadRequest(_)
            | GatewayError::Json(_)
            | GatewayError::Obd(ObdError::InvalidArgument(_) | ObdError::UnknownPid(_)) => 400,
            GatewayError::NotFound(_) => 404,
            _ => 500,
        }
    }
}

impl From<config::ConfigError> for GatewayError {
    fn from(err: config::ConfigError) -> Self {
        GatewayError::Settings(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for GatewayError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        GatewayError::Tunnel(err.to_string())
    }
}
