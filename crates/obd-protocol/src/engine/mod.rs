//! OBD-II / UDS protocol engine.
//!
//! Issues AT, OBD and UDS commands through a [`Connection`], parses the
//! answers and tracks adapter-side state (bus, capabilities, discovered
//! modules). One orchestrating task is expected to drive an engine at a
//! time; the connection serializes individual commands, not sequences.

mod capabilities;
mod did;
mod discovery;
mod scope;

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::dtc::{parse_dtc_response, Dtc, DtcStatus};
use crate::error::ObdError;
use crate::hex::{parse_hex, response_bytes, strip_frame_index};
use crate::mode;
use crate::pid::{registry, PidDefinition, PidReading, SNAPSHOT_PIDS};
use crate::transport::{Connection, COMMAND_TIMEOUT};
use crate::vin::{decode_vin, parse_vin_response, VinInfo};

pub use capabilities::{is_accepted, is_rejected, AdapterCapabilities, MAX_BATCH_PIDS};
pub use discovery::{
    module_by_name, parse_broadcast_headers, standard_probe_addresses, Bus, EcuModule, BROADCAST_ADDRESS,
    HS_CAN_MODULES, MS_CAN_MODULES,
};
pub use scope::{stpx_command, ScopeSample};

/// Short AT housekeeping commands
pub const AT_TIMEOUT: Duration = Duration::from_secs(1);
/// Multi-frame Mode 09 responses are slow
pub const VIN_TIMEOUT: Duration = Duration::from_secs(5);
/// DTC reads may span several ECUs
pub const DTC_TIMEOUT: Duration = Duration::from_secs(5);

const CURRENT_DATA_RESPONSE: u8 = mode::CURRENT_DATA + mode::POSITIVE_RESPONSE_OFFSET;

/// Mode 01 support-bitmask query bases, in query order
pub const SUPPORT_BASES: [u8; 7] = [0x00, 0x20, 0x40, 0x60, 0x80, 0xA0, 0xC0];

/// Markers that mean "no usable data" even though the adapter answered
const NON_LIVE_MARKERS: &[&str] = &[
    "NO DATA",
    "ERROR",
    "UNABLE TO CONNECT",
    "CAN ERROR",
    "BUS",
    "STOPPED",
    "BUFFER FULL",
];

/// VIN, trouble codes and the most useful live values in one pass
#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticSnapshot {
    pub vin: Option<String>,
    pub vehicle: Option<VinInfo>,
    pub dtcs: Vec<Dtc>,
    pub pids: Vec<PidReading>,
}

#[derive(Debug, Default)]
struct EngineState {
    supported_pids: BTreeSet<u8>,
    current_bus: Bus,
    capabilities: AdapterCapabilities,
    modules: Vec<EcuModule>,
    vin: Option<String>,
}

/// Protocol engine bound to one connection
pub struct ProtocolEngine {
    conn: Arc<Connection>,
    state: Mutex<EngineState>,
    /// Stop signal of the running scope/monitor loop, if any
    loop_slot: Mutex<Option<watch::Sender<bool>>>,
}

impl ProtocolEngine {
    pub fn new(conn: Arc<Connection>) -> Self {
        Self {
            conn,
            state: Mutex::new(EngineState::default()),
            loop_slot: Mutex::new(None),
        }
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    pub fn capabilities(&self) -> AdapterCapabilities {
        self.state().capabilities.clone()
    }

    /// Bus the engine believes the adapter is on.
    ///
    /// This is a cache: a raw command that changes the protocol behind the
    /// engine's back is not noticed.
    pub fn current_bus(&self) -> Bus {
        self.state().current_bus
    }

    /// Modules found by the last discovery
    pub fn modules(&self) -> Vec<EcuModule> {
        self.state().modules.clone()
    }

    /// PIDs cached by the last support query
    pub fn cached_supported_pids(&self) -> Vec<u8> {
        self.state().supported_pids.iter().copied().collect()
    }

    /// VIN cached by the last successful read
    pub fn cached_vin(&self) -> Option<String> {
        self.state().vin.clone()
    }

    /// Re-run the AT initialization and forget everything learned so far.
    pub async fn reset_adapter(&self) -> Result<AdapterCapabilities, ObdError> {
        info!("Resetting adapter");
        self.conn.initialize().await?;
        *self.state() = EngineState::default();
        Ok(self.detect_adapter().await)
    }

    /// Query the Mode 01 support bitmasks and cache the union.
    pub async fn get_supported_pids(&self) -> Result<Vec<u8>, ObdError> {
        let mut supported = BTreeSet::new();

        for base in SUPPORT_BASES {
            let response = self.command(&format!("01{base:02X}"), COMMAND_TIMEOUT).await?;
            let mask = if is_live_response(&response) {
                merge_support_masks(&response, base)
            } else {
                None
            };

            let Some(mask) = mask else {
                if base == 0x00 {
                    info!("Vehicle does not answer Mode 01");
                    break;
                }
                debug!(base = format!("{base:02X}"), "Support range unavailable, skipping");
                continue;
            };

            let (pids, more) = decode_supported_bitmask(base, &mask);
            supported.extend(pids);
            if !more {
                break;
            }
        }

        info!(count = supported.len(), "Supported PIDs");
        let list = supported.iter().copied().collect();
        self.state().supported_pids = supported;
        Ok(list)
    }

    /// Read and decode one PID. Unknown PIDs and negative answers are `None`.
    pub async fn read_pid(&self, pid: u8) -> Result<Option<PidReading>, ObdError> {
        let Some(def) = registry().get_by_pid(pid) else {
            debug!(pid = format!("{pid:02X}"), "PID not in registry");
            return Ok(None);
        };
        self.read_definition(def).await
    }

    /// Read PIDs by name (or hex literal), batching when the adapter allows.
    ///
    /// Values that cannot be read are simply absent from the result.
    pub async fn read_pids<S: AsRef<str>>(&self, names: &[S]) -> Result<Vec<PidReading>, ObdError> {
        let defs: Vec<&'static PidDefinition> = names
            .iter()
            .filter_map(|name| {
                let def = registry().resolve(name.as_ref());
                if def.is_none() {
                    debug!(name = name.as_ref(), "Unknown PID name");
                }
                def
            })
            .collect();

        let caps = self.capabilities();
        if caps.supports_batch_pids && names.len() > 1 {
            return self.read_pids_batch(&defs, caps.max_batch_pids).await;
        }

        let mut readings = Vec::with_capacity(defs.len());
        for def in defs {
            if let Some(reading) = self.read_definition(def).await? {
                readings.push(reading);
            }
        }
        Ok(readings)
    }

    async fn read_definition(&self, def: &PidDefinition) -> Result<Option<PidReading>, ObdError> {
        let response = self.command(&def.command(), COMMAND_TIMEOUT).await?;
        Ok(decode_pid_response(&response, def))
    }

    async fn read_pids_batch(
        &self,
        defs: &[&'static PidDefinition],
        max_batch: u8,
    ) -> Result<Vec<PidReading>, ObdError> {
        let size = usize::from(max_batch).clamp(1, MAX_BATCH_PIDS);
        let mut readings = Vec::with_capacity(defs.len());

        for chunk in defs.chunks(size) {
            let pids: String = chunk.iter().map(|d| format!("{:02X}", d.pid)).collect();
            let response = self.command(&format!("01{pids}"), COMMAND_TIMEOUT).await?;
            if !is_live_response(&response) {
                debug!(pids = %pids, "Batch read returned no data");
                continue;
            }
            readings.extend(parse_batch_response(&response, chunk));
        }
        Ok(readings)
    }

    /// Adapter-measured supply voltage (`ATRV`).
    pub async fn battery_voltage(&self) -> Result<Option<f64>, ObdError> {
        let response = self.command("ATRV", AT_TIMEOUT).await?;
        Ok(parse_voltage(&response))
    }

    /// Read the VIN via Mode 09 PID 02.
    pub async fn read_vin(&self) -> Result<Option<String>, ObdError> {
        let response = self.command("0902", VIN_TIMEOUT).await?;
        if !is_live_response(&response) {
            debug!("VIN not available");
            return Ok(None);
        }
        let vin = parse_vin_response(&response);
        match &vin {
            Some(vin) => {
                info!(vin = %vin, "VIN read");
                self.state().vin = Some(vin.clone());
            }
            None => warn!(response = %response, "Could not assemble a VIN"),
        }
        Ok(vin)
    }

    /// Trouble codes from one DTC memory.
    pub async fn read_dtcs(&self, status: DtcStatus) -> Result<Vec<Dtc>, ObdError> {
        let response = self
            .command(&format!("{:02X}", status.mode()), DTC_TIMEOUT)
            .await?;
        if !is_live_response(&response) {
            return Ok(Vec::new());
        }
        Ok(parse_dtc_response(&response, status))
    }

    /// Stored, pending and permanent codes, in that order.
    pub async fn read_all_dtcs(&self) -> Result<Vec<Dtc>, ObdError> {
        let mut dtcs = Vec::new();
        for status in DtcStatus::all() {
            dtcs.extend(self.read_dtcs(status).await?);
        }
        info!(count = dtcs.len(), "Read DTCs");
        Ok(dtcs)
    }

    /// Mode 04. True when the ECU or adapter acknowledged.
    pub async fn clear_dtcs(&self) -> Result<bool, ObdError> {
        let response = self.command(&format!("{:02X}", mode::CLEAR_DTC), DTC_TIMEOUT).await?;
        let cleared = is_clear_acknowledged(&response);
        info!(cleared, "Clear DTCs");
        Ok(cleared)
    }

    /// VIN, all DTCs and the snapshot PIDs read one at a time.
    pub async fn snapshot(&self) -> Result<DiagnosticSnapshot, ObdError> {
        let vin = self.read_vin().await?;
        let dtcs = self.read_all_dtcs().await?;

        let mut pids = Vec::with_capacity(SNAPSHOT_PIDS.len());
        for name in SNAPSHOT_PIDS {
            if let Some(def) = registry().resolve(name) {
                if let Some(reading) = self.read_definition(def).await? {
                    pids.push(reading);
                }
            }
        }

        Ok(DiagnosticSnapshot {
            vehicle: vin.as_deref().map(decode_vin),
            vin,
            dtcs,
            pids,
        })
    }

    async fn command(&self, command: &str, timeout: Duration) -> Result<String, ObdError> {
        self.conn.send_command(command, timeout).await
    }

    /// Send a housekeeping command whose failure must not abort the caller.
    async fn command_best_effort(&self, command: &str) {
        if let Err(e) = self.command(command, AT_TIMEOUT).await {
            warn!(command, "Best-effort command failed: {}", e);
        }
    }

    /// Back to the baseline display settings: no headers, no spaces.
    async fn restore_display(&self) {
        self.command_best_effort("ATH0").await;
        self.command_best_effort("ATS0").await;
    }

    fn state(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// True when a cleaned response carries data rather than a status marker.
pub fn is_live_response(text: &str) -> bool {
    let upper = text.trim().to_ascii_uppercase();
    if upper.is_empty() {
        return false;
    }
    if upper.lines().any(|line| line.trim() == "?") {
        return false;
    }
    !NON_LIVE_MARKERS.iter().any(|marker| upper.contains(marker))
}

/// Decode a 4-byte support bitmask for `base`.
///
/// Bit `b` of byte `i` set means PID `base + i*8 + (7-b) + 1` is supported.
/// The flag is bit 0 of the last byte: the next range is available.
pub fn decode_supported_bitmask(base: u8, data: &[u8]) -> (Vec<u8>, bool) {
    let mut pids = Vec::new();
    for (i, byte) in data.iter().take(4).enumerate() {
        for bit in (0..8u8).rev() {
            if byte & (1 << bit) != 0 {
                pids.push(base + (i as u8) * 8 + (7 - bit) + 1);
            }
        }
    }
    let more = data.get(3).is_some_and(|b| b & 0x01 != 0);
    (pids, more)
}

/// Data bytes following `41 <pid>` on the first line that carries them.
pub fn extract_pid_data(text: &str, pid: u8) -> Option<Vec<u8>> {
    text.lines().find_map(|line| line_pid_data(line, pid))
}

/// OR of the 4-byte support masks from every ECU that answered `01<base>`.
pub fn merge_support_masks(text: &str, base: u8) -> Option<[u8; 4]> {
    let mut merged: Option<[u8; 4]> = None;
    for data in text.lines().filter_map(|line| line_pid_data(line, base)) {
        if data.len() < 4 {
            continue;
        }
        let mask = merged.get_or_insert([0; 4]);
        for (acc, byte) in mask.iter_mut().zip(&data) {
            *acc |= byte;
        }
    }
    merged
}

fn line_pid_data(line: &str, pid: u8) -> Option<Vec<u8>> {
    let line = line.trim();
    let bytes = parse_hex(strip_frame_index(line).unwrap_or(line));
    let start = bytes.windows(2).position(|w| w[0] == CURRENT_DATA_RESPONSE && w[1] == pid)?;
    Some(bytes[start + 2..].to_vec())
}

/// Gate, locate and decode a single-PID response.
pub fn decode_pid_response(text: &str, def: &PidDefinition) -> Option<PidReading> {
    if !is_live_response(text) {
        return None;
    }
    let data = extract_pid_data(text, def.pid)?;
    if data.is_empty() {
        return None;
    }
    match def.decode(&data) {
        Some(value) => Some(PidReading::new(def, value)),
        None => {
            debug!(pid = def.name, bytes = data.len(), "PID decode failed");
            None
        }
    }
}

/// Walk a multi-PID response in request order.
///
/// Parsing stops at the first PID byte that does not match the next
/// expected PID; everything before it is kept.
pub fn parse_batch_response(text: &str, chunk: &[&PidDefinition]) -> Vec<PidReading> {
    let bytes = response_bytes(text);
    let Some(marker) = bytes.iter().position(|b| *b == CURRENT_DATA_RESPONSE) else {
        return Vec::new();
    };

    let mut readings = Vec::with_capacity(chunk.len());
    let mut pos = marker + 1;
    for def in chunk {
        if bytes.get(pos) != Some(&def.pid) {
            break;
        }
        pos += 1;
        let Some(data) = bytes.get(pos..pos + def.byte_width) else {
            break;
        };
        if let Some(value) = def.decode(data) {
            readings.push(PidReading::new(def, value));
        }
        pos += def.byte_width;
    }
    readings
}

/// First decimal number in an `ATRV` answer (`12.6V` → 12.6).
pub fn parse_voltage(text: &str) -> Option<f64> {
    let start = text.find(|c: char| c.is_ascii_digit())?;
    let rest = &text[start..];
    let mut end = 0;
    let mut seen_dot = false;
    for (i, c) in rest.char_indices() {
        if c.is_ascii_digit() {
            end = i + 1;
        } else if c == '.' && !seen_dot {
            seen_dot = true;
        } else {
            break;
        }
    }
    rest[..end].parse().ok()
}

/// Mode 04 succeeded if the ECU echoed `44` or the adapter said `OK`.
pub fn is_clear_acknowledged(text: &str) -> bool {
    text.lines().any(|line| {
        let line = line.trim().to_ascii_uppercase();
        line.starts_with("44") || line.contains("OK")
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockAdapter;

    pub(super) async fn engine_with(adapter: &MockAdapter) -> ProtocolEngine {
        let conn = Arc::new(adapter.connection());
        conn.initialize().await.unwrap();
        adapter.clear_log();
        ProtocolEngine::new(conn)
    }

    #[test]
    fn test_live_classification() {
        assert!(is_live_response("410C1AF8"));
        assert!(is_live_response("12.6V"));
        assert!(is_live_response("SEARCHING...\n410D32"));
        assert!(!is_live_response(""));
        assert!(!is_live_response("NO DATA"));
        assert!(!is_live_response("SEARCHING...\nUNABLE TO CONNECT"));
        assert!(!is_live_response("CAN ERROR"));
        assert!(!is_live_response("BUS INIT: ...ERROR"));
        assert!(!is_live_response("BUFFER FULL"));
        assert!(!is_live_response("?"));
        assert!(!is_live_response("STOPPED"));
    }

    #[test]
    fn test_supported_bitmask_formula() {
        let (pids, more) = decode_supported_bitmask(0x00, &[0xBE, 0x3F, 0xA8, 0x13]);
        assert_eq!(
            pids,
            vec![
                0x01, 0x03, 0x04, 0x05, 0x06, 0x07, 0x0B, 0x0C, 0x0D, 0x0E, 0x0F, 0x10, 0x11, 0x13,
                0x15, 0x1C, 0x1F, 0x20
            ]
        );
        assert!(more);

        let (pids, more) = decode_supported_bitmask(0x20, &[0x80, 0x00, 0x00, 0x12]);
        assert_eq!(pids, vec![0x21, 0x3C, 0x3F]);
        assert!(!more);
    }

    #[test]
    fn test_batch_parse_stops_on_mismatch() {
        let reg = registry();
        let chunk = [
            reg.resolve("RPM").unwrap(),
            reg.resolve("SPEED").unwrap(),
            reg.resolve("COOLANT_TEMP").unwrap(),
        ];

        let full = parse_batch_response("410C1AF80D32057B", &chunk);
        assert_eq!(full.len(), 3);
        assert!((full[0].value - 1726.0).abs() < 0.01);
        assert_eq!(full[1].value, 50.0);
        assert_eq!(full[2].value, 83.0);

        // ECU answered SPEED before RPM: nothing after the mismatch is used
        let partial = parse_batch_response("410D320C1AF8", &chunk);
        assert!(partial.is_empty());

        let truncated = parse_batch_response("410C1AF80D", &chunk);
        assert_eq!(truncated.len(), 1);
    }

    #[test]
    fn test_voltage_and_clear_parsing() {
        assert_eq!(parse_voltage("12.6V"), Some(12.6));
        assert_eq!(parse_voltage("VOLT 14V"), Some(14.0));
        assert_eq!(parse_voltage("NO DATA"), None);
        assert!(is_clear_acknowledged("44"));
        assert!(is_clear_acknowledged("OK"));
        assert!(!is_clear_acknowledged("NO DATA"));
    }

    #[tokio::test]
    async fn test_supported_pids_follow_next_range_flag() {
        let adapter = MockAdapter::new();
        adapter.respond("0100", "4100BE3FA813");
        adapter.respond("0120", "4120A0000001");
        adapter.respond("0140", "NO DATA");
        adapter.respond("0160", "416080000000");
        let engine = engine_with(&adapter).await;

        let pids = engine.get_supported_pids().await.unwrap();
        assert!(pids.contains(&0x0C));
        assert!(pids.contains(&0x21));
        assert!(pids.contains(&0x23));
        assert!(pids.contains(&0x61));
        assert_eq!(adapter.commands(), vec!["0100", "0120", "0140", "0160"]);
        assert_eq!(engine.cached_supported_pids(), pids);
    }

    #[tokio::test]
    async fn test_supported_pids_halt_when_next_range_flag_clear() {
        let adapter = MockAdapter::new();
        adapter.respond("0100", "4100BE3FA812");
        let engine = engine_with(&adapter).await;

        let pids = engine.get_supported_pids().await.unwrap();
        assert_eq!(pids.len(), 17);
        assert!(!pids.contains(&0x20));
        assert_eq!(adapter.commands(), vec!["0100"]);
    }

    #[test]
    fn test_support_masks_merge_across_ecus() {
        let text = "4100BE1FA813\n41008007A011";
        assert_eq!(merge_support_masks(text, 0x00), Some([0xBE, 0x1F, 0xA8, 0x13]));

        let spaced = "41 00 98 18 00 13\n41 00 80 08 00 01";
        assert_eq!(merge_support_masks(spaced, 0x00), Some([0x98, 0x18, 0x00, 0x13]));

        assert_eq!(merge_support_masks("410C1AF8", 0x00), None);
        assert_eq!(merge_support_masks("4100BE", 0x00), None);
    }

    #[tokio::test]
    async fn test_supported_pids_union_of_all_ecus() {
        let adapter = MockAdapter::new();
        // Engine ECU lacks 0x1C; transmission ECU reports it and the next range
        adapter.respond("0100", "4100BE3FA810\n410000000011");
        adapter.respond("0120", "412080000000");
        let engine = engine_with(&adapter).await;

        let pids = engine.get_supported_pids().await.unwrap();
        assert!(pids.contains(&0x0C));
        assert!(pids.contains(&0x1C));
        assert!(pids.contains(&0x21));
        assert_eq!(adapter.commands(), vec!["0100", "0120"]);
    }

    #[tokio::test]
    async fn test_supported_pids_abort_without_mode_01() {
        let adapter = MockAdapter::new();
        adapter.respond("0100", "UNABLE TO CONNECT");
        let engine = engine_with(&adapter).await;

        assert!(engine.get_supported_pids().await.unwrap().is_empty());
        assert_eq!(adapter.commands(), vec!["0100"]);
    }

    #[tokio::test]
    async fn test_read_pid() {
        let adapter = MockAdapter::new();
        adapter.respond("010C", "410C1AF8");
        adapter.respond("0105", "NO DATA");
        let engine = engine_with(&adapter).await;

        let rpm = engine.read_pid(0x0C).await.unwrap().unwrap();
        assert_eq!(rpm.name, "RPM");
        assert!((rpm.value - 1726.0).abs() < 0.01);
        assert!(engine.read_pid(0x05).await.unwrap().is_none());
        // Unknown PIDs never reach the adapter
        assert!(engine.read_pid(0xFE).await.unwrap().is_none());
        assert_eq!(adapter.count("01FE"), 0);
    }

    #[tokio::test]
    async fn test_read_pids_sequential_tolerates_failures() {
        let adapter = MockAdapter::new();
        adapter.respond("010C", "410C1AF8");
        adapter.respond("010D", "NO DATA");
        adapter.respond("0105", "41057B");
        let engine = engine_with(&adapter).await;

        let readings = engine
            .read_pids(&["RPM", "SPEED", "ECT", "BOGUS"])
            .await
            .unwrap();
        let names: Vec<_> = readings.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["RPM", "COOLANT_TEMP"]);
    }

    #[tokio::test]
    async fn test_read_pids_uses_batches_when_supported() {
        let adapter = MockAdapter::new();
        adapter.respond("010C0D", "410C1AF80D32");
        adapter.respond("010C0D05", "410C1AF80D32057B");
        adapter.respond("0111", "411180");
        let engine = engine_with(&adapter).await;
        engine.detect_adapter().await;
        assert!(engine.capabilities().supports_batch_pids);
        assert_eq!(engine.capabilities().max_batch_pids, 3);
        adapter.clear_log();

        let readings = engine
            .read_pids(&["RPM", "SPEED", "COOLANT_TEMP", "THROTTLE_POS"])
            .await
            .unwrap();
        assert_eq!(readings.len(), 4);
        assert_eq!(adapter.commands(), vec!["010C0D05", "0111"]);
    }

    #[tokio::test]
    async fn test_dtc_reads_tolerate_missing_modes() {
        let adapter = MockAdapter::new();
        adapter.respond("03", "43020123C100");
        adapter.respond("07", "NO DATA");
        adapter.respond("0A", "4A01810000");
        let engine = engine_with(&adapter).await;

        let dtcs = engine.read_all_dtcs().await.unwrap();
        let codes: Vec<_> = dtcs.iter().map(|d| (d.code.as_str(), d.status)).collect();
        assert_eq!(
            codes,
            vec![
                ("P0123", DtcStatus::Stored),
                ("U0100", DtcStatus::Stored),
                ("B0100", DtcStatus::Permanent),
            ]
        );
    }

    #[tokio::test]
    async fn test_clear_dtcs() {
        let adapter = MockAdapter::new();
        adapter.respond("04", "44");
        let engine = engine_with(&adapter).await;
        assert!(engine.clear_dtcs().await.unwrap());
    }

    #[tokio::test]
    async fn test_vin_and_voltage() {
        let adapter = MockAdapter::new();
        adapter.respond("0902", "014\n0:490201314654\n1:46573145543544\n2:46433130333132");
        adapter.respond("ATRV", "12.6V");
        let engine = engine_with(&adapter).await;

        assert_eq!(engine.read_vin().await.unwrap().as_deref(), Some("1FTFW1ET5DFC10312"));
        assert_eq!(engine.cached_vin().as_deref(), Some("1FTFW1ET5DFC10312"));
        assert_eq!(engine.battery_voltage().await.unwrap(), Some(12.6));
    }

    #[tokio::test]
    async fn test_snapshot_reads_pids_individually() {
        let adapter = MockAdapter::new();
        adapter.respond("010C", "410C1AF8");
        adapter.respond("010D", "410D32");
        let engine = engine_with(&adapter).await;

        let snapshot = engine.snapshot().await.unwrap();
        assert!(snapshot.vin.is_none());
        assert!(snapshot.dtcs.is_empty());
        assert_eq!(snapshot.pids.len(), 2);
        assert_eq!(adapter.count("010C"), 1);
        assert_eq!(adapter.count("0902"), 1);
    }
}
