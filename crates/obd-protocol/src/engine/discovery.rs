//! ECU module discovery, bus switching and request targeting.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::capabilities::is_accepted;
use super::{is_live_response, ProtocolEngine, AT_TIMEOUT};
use crate::error::ObdError;
use crate::uds::TESTER_PRESENT;
use crate::vin::has_ms_can;

/// Functional (broadcast) request address
pub const BROADCAST_ADDRESS: u16 = 0x7DF;

/// Physical response headers that may answer a broadcast
const BROADCAST_RESPONSES: std::ops::RangeInclusive<u16> = 0x7E8..=0x7EF;
/// Emission ECUs probed by address even when they stayed silent on broadcast
const EMISSION_REQUESTS: std::ops::RangeInclusive<u16> = 0x7E0..=0x7E7;

/// Response = request + 8 on 11-bit diagnostic CAN
const RESPONSE_OFFSET: u16 = 0x08;

const BROADCAST_TIMEOUT: Duration = Duration::from_secs(5);
const PRESENCE_TIMEOUT: Duration = Duration::from_millis(500);
/// `ATST` value used while probing (x4 ms)
const PROBE_TIMING: &str = "ATST19";
const DEFAULT_TIMING: &str = "ATST32";

/// Well-known modules on the primary diagnostic bus
pub const HS_CAN_MODULES: &[(&str, u16)] = &[
    ("PCM", 0x7E0),
    ("TCM", 0x7E1),
    ("ABS", 0x760),
    ("BCM", 0x726),
    ("IPC", 0x720),
    ("RCM", 0x737),
    ("PSCM", 0x730),
    ("APIM", 0x7D0),
    ("HVAC", 0x733),
    ("GWM", 0x716),
    ("PAM", 0x736),
    ("ACM", 0x727),
];

/// Comfort modules on the medium-speed bus of some manufacturers
pub const MS_CAN_MODULES: &[(&str, u16)] = &[
    ("IPC", 0x720),
    ("GPSM", 0x701),
    ("HVAC", 0x733),
    ("FCIM", 0x7A7),
    ("ACM", 0x727),
    ("SCCM", 0x724),
    ("DDM", 0x740),
    ("PDM", 0x741),
    ("RGTM", 0x775),
];

/// Physical CAN bus the adapter is attached to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Bus {
    /// Primary diagnostic bus, 500 kbps
    #[default]
    #[serde(rename = "HS-CAN")]
    HsCan,
    /// Secondary body bus, 125 kbps
    #[serde(rename = "MS-CAN")]
    MsCan,
}

impl fmt::Display for Bus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Bus::HsCan => write!(f, "HS-CAN"),
            Bus::MsCan => write!(f, "MS-CAN"),
        }
    }
}

impl FromStr for Bus {
    type Err = ObdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().replace(['-', '_'], "").as_str() {
            "HSCAN" | "HS" => Ok(Bus::HsCan),
            "MSCAN" | "MS" => Ok(Bus::MsCan),
            _ => Err(ObdError::InvalidArgument(format!("unknown bus '{s}'"))),
        }
    }
}

/// An addressable ECU
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EcuModule {
    pub name: String,
    pub request_address: u16,
    pub response_address: u16,
    pub bus: Bus,
}

impl EcuModule {
    pub fn new(name: impl Into<String>, request_address: u16, bus: Bus) -> Self {
        Self {
            name: name.into(),
            request_address,
            response_address: request_address + RESPONSE_OFFSET,
            bus,
        }
    }

    /// Name from the known table, or `ECU_0x7E3` style when unknown
    fn for_request(request_address: u16) -> Self {
        let name = HS_CAN_MODULES
            .iter()
            .find(|(_, addr)| *addr == request_address)
            .map(|(name, _)| name.to_string())
            .unwrap_or_else(|| format!("ECU_0x{request_address:03X}"));
        Self::new(name, request_address, Bus::HsCan)
    }
}

/// Addresses probed on the primary bus: the known table, then the
/// remaining emission ECU addresses.
pub fn standard_probe_addresses() -> Vec<EcuModule> {
    let mut modules: Vec<EcuModule> = HS_CAN_MODULES
        .iter()
        .map(|(name, addr)| EcuModule::new(*name, *addr, Bus::HsCan))
        .collect();
    for addr in EMISSION_REQUESTS {
        if !modules.iter().any(|m| m.request_address == addr) {
            modules.push(EcuModule::for_request(addr));
        }
    }
    modules
}

/// Look a module up by name in the known tables, primary bus first.
pub fn module_by_name(name: &str) -> Option<EcuModule> {
    let find = |table: &[(&str, u16)], bus| {
        table
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(n, addr)| EcuModule::new(*n, *addr, bus))
    };
    find(HS_CAN_MODULES, Bus::HsCan).or_else(|| find(MS_CAN_MODULES, Bus::MsCan))
}

/// Response headers (7E8..7EF) seen in a headers-on broadcast answer.
pub fn parse_broadcast_headers(text: &str) -> Vec<u16> {
    let mut headers = Vec::new();
    for line in text.lines().map(str::trim) {
        let Some(candidate) = line.get(..3) else {
            continue;
        };
        let Ok(header) = u16::from_str_radix(candidate, 16) else {
            continue;
        };
        if BROADCAST_RESPONSES.contains(&header) && !headers.contains(&header) {
            headers.push(header);
        }
    }
    headers
}

impl ProtocolEngine {
    /// Move the adapter to `bus`. `Ok(false)` if the adapter refused.
    ///
    /// No command is sent when the engine already believes it is on `bus`.
    pub async fn switch_bus(&self, bus: Bus) -> Result<bool, ObdError> {
        if self.current_bus() == bus {
            return Ok(true);
        }

        let switched = match bus {
            Bus::MsCan => {
                let vendor = self.capabilities().is_vendor_extended
                    && is_accepted(&self.command("STP33", AT_TIMEOUT).await?);
                if vendor {
                    true
                } else {
                    // User-defined protocol B: 11-bit CAN at 125 kbps
                    self.command("ATPBE004", AT_TIMEOUT).await?;
                    is_accepted(&self.command("ATSPB", AT_TIMEOUT).await?)
                }
            }
            Bus::HsCan => is_accepted(&self.command("ATSP6", AT_TIMEOUT).await?),
        };

        if switched {
            info!(bus = %bus, "Switched bus");
            self.state().current_bus = bus;
        } else {
            warn!(bus = %bus, "Adapter refused bus switch");
        }
        Ok(switched)
    }

    /// Address all following requests to `module`.
    pub async fn set_target(&self, module: &EcuModule) -> Result<(), ObdError> {
        self.command(&format!("ATSH{:03X}", module.request_address), AT_TIMEOUT)
            .await?;
        self.command(&format!("ATCRA{:03X}", module.response_address), AT_TIMEOUT)
            .await?;
        Ok(())
    }

    /// Back to broadcast requests with no receive filter.
    pub async fn restore_broadcast(&self) -> Result<(), ObdError> {
        self.command(&format!("ATSH{BROADCAST_ADDRESS:03X}"), AT_TIMEOUT)
            .await?;
        self.command("ATCRA", AT_TIMEOUT).await?;
        Ok(())
    }

    /// Switch to the module's bus and target it. `Ok(false)` if the bus
    /// could not be reached.
    pub(super) async fn prepare_module(&self, module: &EcuModule) -> Result<bool, ObdError> {
        if !self.switch_bus(module.bus).await? {
            return Ok(false);
        }
        self.set_target(module).await?;
        Ok(true)
    }

    /// Undo [`prepare_module`](Self::prepare_module); never fails.
    pub(super) async fn release_module(&self) {
        if let Err(e) = self.restore_broadcast().await {
            warn!("Could not restore broadcast addressing: {}", e);
        }
        if let Err(e) = self.switch_bus(Bus::HsCan).await {
            warn!("Could not return to the primary bus: {}", e);
        }
    }

    /// Find the ECUs present on the vehicle.
    ///
    /// Broadcast first, then individual probes of well-known addresses,
    /// then the secondary bus when the VIN suggests it exists. Adapter
    /// addressing is restored whatever happens; only transport failures
    /// are returned as errors.
    pub async fn discover_modules(&self) -> Result<Vec<EcuModule>, ObdError> {
        info!("Discovering modules");
        let scan = self.scan_primary_bus().await;
        self.restore_after_scan().await;
        let mut modules = scan?;

        let vin = match self.cached_vin() {
            Some(vin) => Some(vin),
            None => self.read_vin().await?,
        };
        if vin.as_deref().is_some_and(has_ms_can) {
            modules.extend(self.scan_secondary_bus().await?);
        } else {
            debug!("Skipping secondary bus scan");
        }

        info!(count = modules.len(), "Discovery complete");
        self.state().modules = modules.clone();
        Ok(modules)
    }

    async fn scan_primary_bus(&self) -> Result<Vec<EcuModule>, ObdError> {
        self.command("ATH1", AT_TIMEOUT).await?;
        self.command("ATS1", AT_TIMEOUT).await?;

        let mut modules = Vec::new();
        let response = self.command("0100", BROADCAST_TIMEOUT).await?;
        if is_live_response(&response) {
            for header in parse_broadcast_headers(&response) {
                modules.push(EcuModule::for_request(header - RESPONSE_OFFSET));
            }
        }
        info!(count = modules.len(), "Broadcast answers");

        self.command(PROBE_TIMING, AT_TIMEOUT).await?;
        for candidate in standard_probe_addresses() {
            if modules
                .iter()
                .any(|m| m.request_address == candidate.request_address)
            {
                continue;
            }
            self.set_target(&candidate).await?;
            if self.module_present(true).await? {
                debug!(module = %candidate.name, "Module answered probe");
                modules.push(candidate);
            }
        }
        Ok(modules)
    }

    async fn restore_after_scan(&self) {
        if let Err(e) = self.restore_broadcast().await {
            warn!("Could not restore broadcast addressing: {}", e);
        }
        self.restore_display().await;
        self.command_best_effort(DEFAULT_TIMING).await;
    }

    async fn scan_secondary_bus(&self) -> Result<Vec<EcuModule>, ObdError> {
        if !self.switch_bus(Bus::MsCan).await? {
            info!("Secondary bus not reachable");
            return Ok(Vec::new());
        }

        let mut found = Vec::new();
        let mut outcome = Ok(());
        for (name, addr) in MS_CAN_MODULES {
            let module = EcuModule::new(*name, *addr, Bus::MsCan);
            let present = match self.set_target(&module).await {
                Ok(()) => self.module_present(false).await,
                Err(e) => Err(e),
            };
            match present {
                Ok(true) => found.push(module),
                Ok(false) => {}
                Err(e) => {
                    outcome = Err(e);
                    break;
                }
            }
        }

        self.release_module().await;
        info!(count = found.len(), "Secondary bus modules");
        outcome.map(|()| found)
    }

    /// Tester-present probe, optionally falling back to a Mode 01 request.
    ///
    /// A negative response still proves the module is there.
    async fn module_present(&self, mode01_fallback: bool) -> Result<bool, ObdError> {
        let response = self.command(TESTER_PRESENT, PRESENCE_TIMEOUT).await?;
        if is_live_response(&response) {
            return Ok(true);
        }
        if !mode01_fallback {
            return Ok(false);
        }
        let response = self.command("0100", PRESENCE_TIMEOUT).await?;
        Ok(is_live_response(&response))
    }
}
