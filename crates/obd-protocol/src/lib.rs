//! OBD-II / UDS protocol engine for ELM327-compatible adapters
//!
//! The crate talks to an adapter over Bluetooth serial, BLE or WiFi, hides
//! its echo and framing quirks, and exposes typed operations: live PIDs,
//! trouble codes, VIN, module discovery, UDS data identifiers and a
//! high-rate scope loop.

pub mod dtc;
pub mod engine;
mod error;
pub mod hex;
pub mod mock;
pub mod pid;
pub mod transport;
pub mod uds;
pub mod vin;

pub use dtc::{Dtc, DtcStatus};
pub use engine::{AdapterCapabilities, Bus, DiagnosticSnapshot, EcuModule, ProtocolEngine, ScopeSample};
pub use error::ObdError;
pub use pid::{registry, PidCategory, PidDefinition, PidReading};
pub use transport::{AdapterTarget, Connection, TransportKind};
pub use uds::DidResult;
pub use vin::VinInfo;

/// OBD-II service (mode) bytes
pub mod mode {
    /// Current data
    pub const CURRENT_DATA: u8 = 0x01;
    /// Freeze frame data
    pub const FREEZE_FRAME: u8 = 0x02;
    /// Stored trouble codes
    pub const READ_DTC: u8 = 0x03;
    /// Clear trouble codes
    pub const CLEAR_DTC: u8 = 0x04;
    /// Pending trouble codes
    pub const PENDING_DTC: u8 = 0x07;
    /// Vehicle information
    pub const VEHICLE_INFO: u8 = 0x09;
    /// Permanent trouble codes
    pub const PERMANENT_DTC: u8 = 0x0A;
    /// Added to the request mode in a positive response
    pub const POSITIVE_RESPONSE_OFFSET: u8 = 0x40;
}
