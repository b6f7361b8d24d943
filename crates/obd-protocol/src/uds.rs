//! UDS (ISO 14229) helpers: negative response codes, DID labels and
//! `ReadDataByIdentifier` response parsing.

use serde::{Deserialize, Serialize};

use crate::hex::{response_bytes, to_hex};

/// Negative response service id
pub const NEGATIVE_RESPONSE: u8 = 0x7F;
/// ReadDataByIdentifier request / positive response
pub const READ_DATA_BY_ID: u8 = 0x22;
pub const READ_DATA_BY_ID_RESPONSE: u8 = 0x62;

/// DiagnosticSessionControl, extended session
pub const EXTENDED_SESSION: &str = "1003";
/// TesterPresent without suppressing the response
pub const TESTER_PRESENT: &str = "3E00";

/// Human-readable name for an NRC byte.
pub fn describe_nrc(nrc: u8) -> &'static str {
    match nrc {
        0x10 => "generalReject",
        0x11 => "serviceNotSupported",
        0x12 => "subFunctionNotSupported",
        0x13 => "incorrectMessageLengthOrInvalidFormat",
        0x14 => "responseTooLong",
        0x21 => "busyRepeatRequest",
        0x22 => "conditionsNotCorrect",
        0x24 => "requestSequenceError",
        0x25 => "noResponseFromSubnetComponent",
        0x26 => "failurePreventsExecutionOfRequestedAction",
        0x31 => "requestOutOfRange",
        0x33 => "securityAccessDenied",
        0x35 => "invalidKey",
        0x36 => "exceedNumberOfAttempts",
        0x37 => "requiredTimeDelayNotExpired",
        0x70 => "uploadDownloadNotAccepted",
        0x71 => "transferDataSuspended",
        0x72 => "generalProgrammingFailure",
        0x73 => "wrongBlockSequenceCounter",
        0x78 => "requestCorrectlyReceivedResponsePending",
        0x7E => "subFunctionNotSupportedInActiveSession",
        0x7F => "serviceNotSupportedInActiveSession",
        0x81 => "rpmTooHigh",
        0x82 => "rpmTooLow",
        0x83 => "engineIsRunning",
        0x84 => "engineIsNotRunning",
        0x85 => "engineRunTimeTooLow",
        0x86 => "temperatureTooHigh",
        0x87 => "temperatureTooLow",
        0x88 => "vehicleSpeedTooHigh",
        0x89 => "vehicleSpeedTooLow",
        0x8A => "throttlePedalTooHigh",
        0x8B => "throttlePedalTooLow",
        0x8C => "transmissionRangeNotInNeutral",
        0x8D => "transmissionRangeNotInGear",
        0x8F => "brakeSwitchNotClosed",
        0x90 => "shifterLeverNotInPark",
        0x91 => "torqueConverterClutchLocked",
        0x92 => "voltageTooHigh",
        0x93 => "voltageTooLow",
        _ => "unknown",
    }
}

/// Label for well-known DIDs, `DID 0x<hex>` otherwise.
pub fn did_description(did: u16) -> String {
    let label = match did {
        0xF186 => "Active Diagnostic Session",
        0xF187 => "Spare Part Number",
        0xF188 => "ECU Software Number",
        0xF18C => "ECU Serial Number",
        0xF190 => "VIN",
        0xF191 => "ECU Hardware Number",
        0xF194 => "Supplier Software Number",
        0xF195 => "Supplier Software Version",
        0xF197 => "System Name",
        0xF19E => "ODX File",
        0xDD01 => "Odometer",
        0xDD02 => "Battery Voltage",
        0xDD04 => "Cabin Temperature",
        0xDE00 => "Configuration Block 0",
        0xDE01 => "Configuration Block 1",
        0xDE02 => "Configuration Block 2",
        _ => return format!("DID 0x{did:04X}"),
    };
    label.to_string()
}

/// Parse a DID given as `F190`, `0xF190` or `f190`.
pub fn parse_did(text: &str) -> Option<u16> {
    let text = text.trim();
    let hex = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .unwrap_or(text);
    if hex.is_empty() || hex.len() > 4 {
        return None;
    }
    u16::from_str_radix(hex, 16).ok()
}

/// A successfully read DID
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DidResult {
    pub did: String,
    pub raw_hex: String,
    pub decoded: String,
    pub description: String,
}

impl DidResult {
    pub fn new(did: u16, data: &[u8]) -> Self {
        Self {
            did: format!("{did:04X}"),
            raw_hex: to_hex(data),
            decoded: decode_did_data(data),
            description: did_description(did),
        }
    }
}

/// Outcome of one `22 <did>` exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DidResponse {
    Value(DidResult),
    /// `7F 22 <nrc>`
    Negative(u8),
    /// Anything else: wrong service, truncated, garbage
    Malformed,
}

/// Classify and decode a ReadDataByIdentifier response.
///
/// A positive answer only counts when it echoes `did`; a late reply to an
/// earlier request is malformed, not a value.
pub fn parse_did_response(text: &str, did: u16) -> DidResponse {
    let bytes = response_bytes(text);
    let [high, low] = did.to_be_bytes();
    match bytes.as_slice() {
        [NEGATIVE_RESPONSE, _, nrc, ..] => DidResponse::Negative(*nrc),
        [NEGATIVE_RESPONSE, ..] => DidResponse::Negative(0),
        [READ_DATA_BY_ID_RESPONSE, h, l, data @ ..] if *h == high && *l == low => {
            DidResponse::Value(DidResult::new(did, data))
        }
        _ => DidResponse::Malformed,
    }
}

/// ASCII when every byte is printable and there is more than one, hex otherwise.
pub fn decode_did_data(data: &[u8]) -> String {
    if data.len() > 1 && data.iter().all(|b| (0x20..=0x7E).contains(b)) {
        data.iter().map(|b| *b as char).collect()
    } else {
        to_hex(data)
    }
}
