//! OBD Gateway
//!
//! Session orchestration for one OBD adapter and a WebSocket tunnel that
//! exposes it to a remote shop server.

pub mod error;
pub mod keepalive;
pub mod logging;
pub mod routes;
pub mod service;
pub mod settings;
pub mod tunnel;

pub use error::GatewayError;
pub use logging::init_logging;
pub use routes::{TunnelRequest, TunnelResponse};
pub use service::GatewayService;
pub use settings::GatewaySettings;
