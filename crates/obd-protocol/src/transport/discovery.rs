//! Adapter discovery over already-paired devices.

use serde::{Deserialize, Serialize};

use crate::transport::{BleLink, TransportKind};

/// Name fragments seen on OBD-II adapters in the wild
const ADAPTER_NAME_HINTS: &[&str] = &[
    "OBD", "ELM", "OBDLINK", "VLINK", "V-LINK", "VEEPEAK", "KONNWEI", "VGATE", "ICAR", "STN", "CX",
];

/// Radio type reported by the platform for a paired device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceType {
    Classic,
    Le,
    Dual,
    Unknown,
}

/// A device the platform already knows about
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnownDevice {
    pub name: Option<String>,
    pub address: String,
    pub device_type: DeviceType,
}

/// A device that looks like an OBD adapter, with the transport to use
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveredAdapter {
    pub name: String,
    pub address: String,
    pub kind: TransportKind,
}

/// Where to connect
pub enum AdapterTarget {
    /// Serial device path, e.g. an RFCOMM binding of an SPP adapter
    Serial { path: String, baud_rate: u32 },
    /// GATT link; its notification sink must already be wired up
    Ble(BleLink),
    /// WiFi adapter
    Tcp { host: String, port: u16 },
}

/// Keep devices whose name looks like an OBD adapter and pick a transport.
///
/// Dual-mode devices go over SPP: classic RFCOMM is faster and does not
/// need chunked writes.
pub fn filter_adapters(devices: &[KnownDevice]) -> Vec<DiscoveredAdapter> {
    devices
        .iter()
        .filter_map(|device| {
            let name = device.name.as_deref()?.trim();
            let upper = name.to_ascii_uppercase();
            if !ADAPTER_NAME_HINTS.iter().any(|hint| upper.contains(hint)) {
                return None;
            }
            let kind = match device.device_type {
                DeviceType::Le => TransportKind::Ble,
                DeviceType::Classic | DeviceType::Dual | DeviceType::Unknown => TransportKind::SerialSpp,
            };
            Some(DiscoveredAdapter {
                name: name.to_string(),
                address: device.address.clone(),
                kind,
            })
        })
        .collect()
}
