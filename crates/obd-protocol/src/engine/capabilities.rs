//! Adapter feature detection.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{is_live_response, ProtocolEngine};
use crate::hex::response_bytes;
use crate::transport::parse_adapter_identity;

/// Largest batch any adapter is asked for
pub const MAX_BATCH_PIDS: usize = 6;
const BASIC_BATCH_PIDS: u8 = 3;

const PROBE_TIMEOUT: Duration = Duration::from_millis(1000);
/// The monitor never prompts on its own; wait this long for first frames
const MONITOR_PROBE_TIMEOUT: Duration = Duration::from_millis(300);

/// Substrings of `ATI` that identify an STN-family adapter
const VENDOR_MARKERS: &[&str] = &["STN", "OBDLINK"];

/// What the connected adapter can do beyond plain ELM327
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdapterCapabilities {
    pub is_vendor_extended: bool,
    pub device_name: String,
    pub firmware_version: String,
    pub supports_adaptive_timing: bool,
    pub supports_bus_monitor: bool,
    pub supports_fast_execute: bool,
    pub supports_batch_pids: bool,
    pub max_batch_pids: u8,
}

impl Default for AdapterCapabilities {
    fn default() -> Self {
        Self {
            is_vendor_extended: false,
            device_name: String::new(),
            firmware_version: String::new(),
            supports_adaptive_timing: false,
            supports_bus_monitor: false,
            supports_fast_execute: false,
            supports_batch_pids: false,
            max_batch_pids: 1,
        }
    }
}

/// The adapter flagged the command as unknown.
pub fn is_rejected(text: &str) -> bool {
    text.contains('?')
}

/// Non-empty and not rejected.
pub fn is_accepted(text: &str) -> bool {
    !text.trim().is_empty() && !is_rejected(text)
}

impl ProtocolEngine {
    /// Probe the adapter and cache what it supports.
    ///
    /// Never fails: a probe that errors counts as "not supported".
    pub async fn detect_adapter(&self) -> AdapterCapabilities {
        let mut caps = AdapterCapabilities::default();

        if let Some(sti) = self.probe("STI", PROBE_TIMEOUT).await.filter(|r| is_accepted(r)) {
            caps.is_vendor_extended = true;
            let (name, version) = parse_adapter_identity(&sti);
            caps.device_name = name;
            caps.firmware_version = version;
            if let Some(info) = self.probe("STDI", PROBE_TIMEOUT).await.filter(|r| is_accepted(r)) {
                if let Some(line) = info.lines().next() {
                    caps.device_name = line.trim().to_string();
                }
            }
        }

        if let Some(ati) = self.probe("ATI", PROBE_TIMEOUT).await.filter(|r| is_accepted(r)) {
            let upper = ati.to_ascii_uppercase();
            if VENDOR_MARKERS.iter().any(|m| upper.contains(m)) {
                caps.is_vendor_extended = true;
            }
            if caps.device_name.is_empty() {
                let (name, version) = parse_adapter_identity(&ati);
                caps.device_name = name;
                caps.firmware_version = version;
            }
        }

        if caps.is_vendor_extended {
            caps.supports_adaptive_timing = self
                .probe("STAF", PROBE_TIMEOUT)
                .await
                .is_some_and(|r| is_accepted(&r));

            caps.supports_bus_monitor = self
                .probe("STMA", MONITOR_PROBE_TIMEOUT)
                .await
                .is_some_and(|r| !is_rejected(&r));
            if caps.supports_bus_monitor {
                // Any character ends the monitor
                if let Err(e) = self.conn.interrupt(PROBE_TIMEOUT).await {
                    debug!("Monitor stop after probe failed: {}", e);
                }
            }

            caps.supports_fast_execute = self
                .probe("STPX H:7DF, D:0100, R:1", PROBE_TIMEOUT)
                .await
                .is_some_and(|r| is_accepted(&r));
        }

        caps.supports_batch_pids = self
            .probe("010C0D", PROBE_TIMEOUT)
            .await
            .is_some_and(|r| is_live_response(&r) && response_bytes(&r).len() >= 6);
        caps.max_batch_pids = if caps.is_vendor_extended {
            MAX_BATCH_PIDS as u8
        } else {
            BASIC_BATCH_PIDS
        };

        info!(
            device = %caps.device_name,
            firmware = %caps.firmware_version,
            vendor = caps.is_vendor_extended,
            monitor = caps.supports_bus_monitor,
            fast = caps.supports_fast_execute,
            batch = caps.supports_batch_pids,
            "Adapter capabilities"
        );
        self.state().capabilities = caps.clone();
        caps
    }

    async fn probe(&self, command: &str, timeout: Duration) -> Option<String> {
        match self.command(command, timeout).await {
            Ok(response) => Some(response),
            Err(e) => {
                debug!(command, "Probe failed: {}", e);
                None
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn set_capabilities(&self, caps: AdapterCapabilities) {
        self.state().capabilities = caps;
    }
}
