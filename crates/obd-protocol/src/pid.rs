//! OBD-II PID Definitions and Registry
//!
//! Mode 01 parameter IDs with their decoding formulas. The table is static;
//! [`registry()`] builds the by-PID and by-name indices once on first use.

use std::collections::HashMap;
use std::fmt;
use std::sync::LazyLock;

use serde::{Deserialize, Serialize};

/// Grouping used by UIs to organise PIDs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PidCategory {
    Status,
    Engine,
    Fuel,
    Air,
    Temperature,
    Oxygen,
    Emissions,
    Vehicle,
    Electrical,
}

/// One Mode 01 parameter
pub struct PidDefinition {
    /// PID byte
    pub pid: u8,
    /// Canonical upper-case name
    pub name: &'static str,
    /// Alternative names accepted by [`PidRegistry::resolve`]
    pub aliases: &'static [&'static str],
    /// Data bytes consumed by the formula
    pub byte_width: usize,
    pub unit: &'static str,
    pub category: PidCategory,
    /// Lowest value the formula can produce
    pub min: f64,
    /// Highest value the formula can produce
    pub max: f64,
    formula: fn(&[u8]) -> f64,
}

impl PidDefinition {
    /// Decode the data bytes that follow `41 <pid>`.
    ///
    /// Exactly `byte_width` bytes are consumed; a short buffer yields `None`.
    pub fn decode(&self, data: &[u8]) -> Option<f64> {
        let bytes = data.get(..self.byte_width)?;
        let value = (self.formula)(bytes);
        value.is_finite().then_some(value)
    }

    /// Request string for a single-PID read, e.g. `010C`
    pub fn command(&self) -> String {
        format!("01{:02X}", self.pid)
    }
}

impl fmt::Debug for PidDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PidDefinition")
            .field("pid", &format_args!("0x{:02X}", self.pid))
            .field("name", &self.name)
            .field("byte_width", &self.byte_width)
            .field("unit", &self.unit)
            .finish()
    }
}

impl PartialEq for PidDefinition {
    fn eq(&self, other: &Self) -> bool {
        self.pid == other.pid
    }
}

/// A decoded PID value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PidReading {
    pub pid: u8,
    pub name: String,
    pub value: f64,
    pub unit: String,
}

impl PidReading {
    pub fn new(def: &PidDefinition, value: f64) -> Self {
        Self {
            pid: def.pid,
            name: def.name.to_string(),
            value,
            unit: def.unit.to_string(),
        }
    }
}

fn a(b: &[u8]) -> f64 {
    b[0] as f64
}

fn ab(b: &[u8]) -> f64 {
    b[0] as f64 * 256.0 + b[1] as f64
}

fn percent(b: &[u8]) -> f64 {
    a(b) * 100.0 / 255.0
}

fn temp(b: &[u8]) -> f64 {
    a(b) - 40.0
}

fn trim(b: &[u8]) -> f64 {
    a(b) / 1.28 - 100.0
}

fn torque(b: &[u8]) -> f64 {
    a(b) - 125.0
}

fn catalyst_temp(b: &[u8]) -> f64 {
    ab(b) / 10.0 - 40.0
}

fn o2_voltage(b: &[u8]) -> f64 {
    a(b) / 200.0
}

macro_rules! pid {
    ($pid:expr, $name:expr, [$($alias:expr),*], $width:expr, $unit:expr, $cat:ident, $min:expr, $max:expr, $f:expr) => {
        PidDefinition {
            pid: $pid,
            name: $name,
            aliases: &[$($alias),*],
            byte_width: $width,
            unit: $unit,
            category: PidCategory::$cat,
            min: $min,
            max: $max,
            formula: $f,
        }
    };
}

static PIDS: &[PidDefinition] = &[
    pid!(0x01, "MONITOR_STATUS", ["DTC_COUNT", "MIL_STATUS"], 4, "count", Status, 0.0, 127.0, |b| (b[0] & 0x7F) as f64),
    pid!(0x03, "FUEL_SYSTEM_STATUS", ["FUEL_STATUS"], 2, "", Fuel, 0.0, 255.0, a),
    pid!(0x04, "ENGINE_LOAD", ["LOAD", "CALC_LOAD"], 1, "%", Engine, 0.0, 100.0, percent),
    pid!(0x05, "COOLANT_TEMP", ["ECT", "COOLANT"], 1, "°C", Temperature, -40.0, 215.0, temp),
    pid!(0x06, "SHORT_FUEL_TRIM_1", ["STFT1", "STFT"], 1, "%", Fuel, -100.0, 99.21875, trim),
    pid!(0x07, "LONG_FUEL_TRIM_1", ["LTFT1", "LTFT"], 1, "%", Fuel, -100.0, 99.21875, trim),
    pid!(0x08, "SHORT_FUEL_TRIM_2", ["STFT2"], 1, "%", Fuel, -100.0, 99.21875, trim),
    pid!(0x09, "LONG_FUEL_TRIM_2", ["LTFT2"], 1, "%", Fuel, -100.0, 99.21875, trim),
    pid!(0x0A, "FUEL_PRESSURE", ["FP"], 1, "kPa", Fuel, 0.0, 765.0, |b| a(b) * 3.0),
    pid!(0x0B, "INTAKE_PRESSURE", ["MAP", "BOOST"], 1, "kPa", Air, 0.0, 255.0, a),
    pid!(0x0C, "RPM", ["ENGINE_RPM"], 2, "rpm", Engine, 0.0, 16383.75, |b| ab(b) / 4.0),
    pid!(0x0D, "SPEED", ["VSS", "VEHICLE_SPEED"], 1, "km/h", Vehicle, 0.0, 255.0, a),
    pid!(0x0E, "TIMING_ADVANCE", ["TIMING"], 1, "°", Engine, -64.0, 63.5, |b| a(b) / 2.0 - 64.0),
    pid!(0x0F, "INTAKE_TEMP", ["IAT"], 1, "°C", Temperature, -40.0, 215.0, temp),
    pid!(0x10, "MAF", ["MAF_RATE", "AIR_FLOW"], 2, "g/s", Air, 0.0, 655.35, |b| ab(b) / 100.0),
    pid!(0x11, "THROTTLE_POS", ["TPS", "THROTTLE"], 1, "%", Engine, 0.0, 100.0, percent),
    pid!(0x14, "O2_B1S1", ["O2_1"], 2, "V", Oxygen, 0.0, 1.275, o2_voltage),
    pid!(0x15, "O2_B1S2", ["O2_2"], 2, "V", Oxygen, 0.0, 1.275, o2_voltage),
    pid!(0x1F, "RUN_TIME", ["ENGINE_RUN_TIME"], 2, "s", Engine, 0.0, 65535.0, ab),
    pid!(0x21, "DISTANCE_W_MIL", ["MIL_DISTANCE"], 2, "km", Vehicle, 0.0, 65535.0, ab),
    pid!(0x22, "FUEL_RAIL_PRESSURE_VAC", [], 2, "kPa", Fuel, 0.0, 5177.265, |b| ab(b) * 0.079),
    pid!(0x23, "FUEL_RAIL_PRESSURE_DIRECT", ["FRP"], 2, "kPa", Fuel, 0.0, 655350.0, |b| ab(b) * 10.0),
    pid!(0x2C, "COMMANDED_EGR", ["EGR"], 1, "%", Emissions, 0.0, 100.0, percent),
    pid!(0x2D, "EGR_ERROR", [], 1, "%", Emissions, -100.0, 99.21875, trim),
    pid!(0x2E, "EVAPORATIVE_PURGE", ["EVAP_PURGE"], 1, "%", Emissions, 0.0, 100.0, percent),
    pid!(0x2F, "FUEL_LEVEL", ["FUEL"], 1, "%", Fuel, 0.0, 100.0, percent),
    pid!(0x30, "WARMUPS_SINCE_DTC_CLEAR", ["WARMUPS"], 1, "count", Status, 0.0, 255.0, a),
    pid!(0x31, "DISTANCE_SINCE_DTC_CLEAR", ["CLEAR_DISTANCE"], 2, "km", Vehicle, 0.0, 65535.0, ab),
    pid!(0x33, "BAROMETRIC_PRESSURE", ["BARO"], 1, "kPa", Air, 0.0, 255.0, a),
    pid!(0x3C, "CATALYST_TEMP_B1S1", ["CAT_TEMP"], 2, "°C", Temperature, -40.0, 6513.5, catalyst_temp),
    pid!(0x3D, "CATALYST_TEMP_B2S1", [], 2, "°C", Temperature, -40.0, 6513.5, catalyst_temp),
    pid!(0x3E, "CATALYST_TEMP_B1S2", [], 2, "°C", Temperature, -40.0, 6513.5, catalyst_temp),
    pid!(0x42, "CONTROL_MODULE_VOLTAGE", ["ECU_VOLTAGE", "MODULE_VOLTAGE"], 2, "V", Electrical, 0.0, 65.535, |b| ab(b) / 1000.0),
    pid!(0x43, "ABSOLUTE_LOAD", [], 2, "%", Engine, 0.0, 25700.0, |b| ab(b) * 100.0 / 255.0),
    pid!(0x44, "COMMANDED_EQUIV_RATIO", ["LAMBDA"], 2, "ratio", Fuel, 0.0, 2.0, |b| ab(b) * 2.0 / 65536.0),
    pid!(0x45, "RELATIVE_THROTTLE_POS", [], 1, "%", Engine, 0.0, 100.0, percent),
    pid!(0x46, "AMBIENT_AIR_TEMP", ["AMBIENT_TEMP", "AAT"], 1, "°C", Temperature, -40.0, 215.0, temp),
    pid!(0x47, "THROTTLE_POS_B", [], 1, "%", Engine, 0.0, 100.0, percent),
    pid!(0x49, "ACCELERATOR_POS_D", ["PEDAL_D"], 1, "%", Engine, 0.0, 100.0, percent),
    pid!(0x4A, "ACCELERATOR_POS_E", ["PEDAL_E"], 1, "%", Engine, 0.0, 100.0, percent),
    pid!(0x4C, "COMMANDED_THROTTLE_ACTUATOR", [], 1, "%", Engine, 0.0, 100.0, percent),
    pid!(0x4D, "RUN_TIME_MIL", [], 2, "min", Status, 0.0, 65535.0, ab),
    pid!(0x4E, "TIME_SINCE_DTC_CLEAR", [], 2, "min", Status, 0.0, 65535.0, ab),
    pid!(0x52, "ETHANOL_PERCENT", ["ETHANOL"], 1, "%", Fuel, 0.0, 100.0, percent),
    pid!(0x5A, "RELATIVE_ACCEL_POS", [], 1, "%", Engine, 0.0, 100.0, percent),
    pid!(0x5B, "HYBRID_BATTERY_REMAINING", ["HV_BATTERY"], 1, "%", Electrical, 0.0, 100.0, percent),
    pid!(0x5C, "OIL_TEMP", ["EOT"], 1, "°C", Temperature, -40.0, 215.0, temp),
    pid!(0x5E, "FUEL_RATE", ["FUEL_CONSUMPTION"], 2, "L/h", Fuel, 0.0, 3276.75, |b| ab(b) / 20.0),
    pid!(0x61, "DRIVER_DEMAND_TORQUE", [], 1, "%", Engine, -125.0, 130.0, torque),
    pid!(0x62, "ACTUAL_TORQUE", ["TORQUE"], 1, "%", Engine, -125.0, 130.0, torque),
    pid!(0x63, "REFERENCE_TORQUE", [], 2, "Nm", Engine, 0.0, 65535.0, ab),
    pid!(0xA6, "ODOMETER", ["MILEAGE"], 4, "km", Vehicle, 0.0, 429_496_729.5, |b| {
        u32::from_be_bytes([b[0], b[1], b[2], b[3]]) as f64 / 10.0
    }),
];

/// PIDs read by the diagnostic snapshot, in display order
pub const SNAPSHOT_PIDS: &[&str] = &[
    "RPM",
    "SPEED",
    "COOLANT_TEMP",
    "ENGINE_LOAD",
    "INTAKE_TEMP",
    "MAF",
    "THROTTLE_POS",
    "FUEL_LEVEL",
    "CONTROL_MODULE_VOLTAGE",
    "SHORT_FUEL_TRIM_1",
    "LONG_FUEL_TRIM_1",
    "TIMING_ADVANCE",
    "INTAKE_PRESSURE",
    "AMBIENT_AIR_TEMP",
];

/// Indexed view over the PID table
pub struct PidRegistry {
    by_pid: HashMap<u8, &'static PidDefinition>,
    by_name: HashMap<String, &'static PidDefinition>,
}

static REGISTRY: LazyLock<PidRegistry> = LazyLock::new(|| {
    let mut by_pid = HashMap::with_capacity(PIDS.len());
    let mut by_name = HashMap::with_capacity(PIDS.len() * 3);
    for def in PIDS {
        by_pid.insert(def.pid, def);
        by_name.insert(def.name.to_ascii_uppercase(), def);
        for alias in def.aliases {
            by_name.insert(alias.to_ascii_uppercase(), def);
        }
    }
    PidRegistry { by_pid, by_name }
});

/// The process-wide PID registry
pub fn registry() -> &'static PidRegistry {
    &REGISTRY
}

impl PidRegistry {
    pub fn get_by_pid(&self, pid: u8) -> Option<&'static PidDefinition> {
        self.by_pid.get(&pid).copied()
    }

    /// Resolve a name or alias (case-insensitive), falling back to a hex
    /// literal such as `0C`, `0x0C` or `010C`.
    pub fn resolve(&self, name: &str) -> Option<&'static PidDefinition> {
        let key = name.trim().to_ascii_uppercase();
        if let Some(def) = self.by_name.get(&key) {
            return Some(*def);
        }

        let hex = key.strip_prefix("0X").unwrap_or(&key);
        let hex = if hex.len() == 4 { hex.strip_prefix("01")? } else { hex };
        if hex.is_empty() || hex.len() > 2 {
            return None;
        }
        u8::from_str_radix(hex, 16)
            .ok()
            .and_then(|pid| self.get_by_pid(pid))
    }

    /// All definitions in PID order
    pub fn all(&self) -> &'static [PidDefinition] {
        PIDS
    }

    pub fn len(&self) -> usize {
        PIDS.len()
    }

    pub fn is_empty(&self) -> bool {
        PIDS.is_empty()
    }
}
