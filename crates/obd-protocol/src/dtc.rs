//! Diagnostic trouble code decoding (ISO 15031-6 layout).

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::hex::{is_length_header, strip_frame_index};
use crate::mode;

/// Which DTC memory a code came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DtcStatus {
    /// Mode 03
    Stored,
    /// Mode 07
    Pending,
    /// Mode 0A
    Permanent,
}

impl DtcStatus {
    /// Request mode byte
    pub fn mode(&self) -> u8 {
        match self {
            DtcStatus::Stored => mode::READ_DTC,
            DtcStatus::Pending => mode::PENDING_DTC,
            DtcStatus::Permanent => mode::PERMANENT_DTC,
        }
    }

    /// Positive-response echo (`mode + 0x40`)
    pub fn response_mode(&self) -> u8 {
        self.mode() + mode::POSITIVE_RESPONSE_OFFSET
    }

    pub fn all() -> [DtcStatus; 3] {
        [DtcStatus::Stored, DtcStatus::Pending, DtcStatus::Permanent]
    }
}

impl fmt::Display for DtcStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DtcStatus::Stored => write!(f, "stored"),
            DtcStatus::Pending => write!(f, "pending"),
            DtcStatus::Permanent => write!(f, "permanent"),
        }
    }
}

/// A decoded trouble code
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dtc {
    pub code: String,
    pub status: DtcStatus,
}

/// Decode two raw bytes into a code such as `P0123`.
///
/// `00 00` padding and the resulting `P0000` are discarded.
pub fn decode_dtc(high: u8, low: u8) -> Option<String> {
    if high == 0 && low == 0 {
        return None;
    }
    let letter = match high >> 6 {
        0 => 'P',
        1 => 'C',
        2 => 'B',
        _ => 'U',
    };
    let code = format!("{letter}{}{:X}{:02X}", (high >> 4) & 0x03, high & 0x0F, low);
    (code != "P0000").then_some(code)
}

/// Consume a leading count byte when it plausibly is one.
///
/// CAN responses prefix the code list with a count; older protocols do not.
/// A value outside 1..=20 is taken to be the first DTC byte instead.
pub fn strip_count_byte(hex: &str) -> &str {
    let Some(first) = hex.get(..2) else {
        return hex;
    };
    match u8::from_str_radix(first, 16) {
        Ok(count) if (1..=20).contains(&count) => &hex[2..],
        _ => hex,
    }
}

/// Parse a Mode 03/07/0A response into codes.
///
/// Each line beginning with the mode echo starts a new ECU segment;
/// unprefixed lines continue the current one (multi-frame).
pub fn parse_dtc_response(text: &str, status: DtcStatus) -> Vec<Dtc> {
    let echo = format!("{:02X}", status.response_mode());
    let mut segments: Vec<String> = Vec::new();

    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let payload = strip_frame_index(line).unwrap_or(line);
        let hex: String = payload
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect::<String>()
            .to_ascii_uppercase();
        if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            continue;
        }

        if let Some(rest) = hex.strip_prefix(&echo) {
            segments.push(strip_count_byte(rest).to_string());
        } else if let Some(current) = segments.last_mut() {
            current.push_str(&hex);
        } else if !is_length_header(&hex) {
            segments.push(hex);
        }
    }

    segments
        .iter()
        .flat_map(|segment| {
            segment
                .as_bytes()
                .chunks_exact(4)
                .filter_map(|chunk| {
                    let chunk = std::str::from_utf8(chunk).ok()?;
                    let high = u8::from_str_radix(&chunk[..2], 16).ok()?;
                    let low = u8::from_str_radix(&chunk[2..], 16).ok()?;
                    decode_dtc(high, low)
                })
                .collect::<Vec<_>>()
        })
        .map(|code| Dtc { code, status })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_letter_prefixes() {
        assert_eq!(decode_dtc(0x01, 0x23).as_deref(), Some("P0123"));
        assert_eq!(decode_dtc(0x41, 0x23).as_deref(), Some("C0123"));
        assert_eq!(decode_dtc(0x81, 0x23).as_deref(), Some("B0123"));
        assert_eq!(decode_dtc(0xC1, 0x23).as_deref(), Some("U0123"));
        assert_eq!(decode_dtc(0x31, 0xAB).as_deref(), Some("P31AB"));
    }

    #[test]
    fn test_padding_dropped() {
        assert_eq!(decode_dtc(0x00, 0x00), None);
        let dtcs = parse_dtc_response("4300000000", DtcStatus::Stored);
        assert!(dtcs.is_empty());
    }

    #[test]
    fn test_can_response_with_count() {
        let dtcs = parse_dtc_response("43 02 01 23 C1 00", DtcStatus::Stored);
        let codes: Vec<_> = dtcs.iter().map(|d| d.code.as_str()).collect();
        assert_eq!(codes, vec!["P0123", "U0100"]);
        assert!(dtcs.iter().all(|d| d.status == DtcStatus::Stored));
    }

    #[test]
    fn test_large_first_byte_is_not_a_count() {
        // 0x81 is outside 1..=20 so it is DTC data: B0123
        let dtcs = parse_dtc_response("47 81 23", DtcStatus::Pending);
        assert_eq!(dtcs[0].code, "B0123");
        assert_eq!(dtcs[0].status, DtcStatus::Pending);
    }

    #[test]
    fn test_multiple_ecus_and_frames() {
        let text = "00A\n0:4A0301230456\n1:0789\n4A0141230000";
        let codes: Vec<_> = parse_dtc_response(text, DtcStatus::Permanent)
            .into_iter()
            .map(|d| d.code)
            .collect();
        assert_eq!(codes, vec!["P0123", "P0456", "P0789", "C0123"]);
    }

    #[test]
    fn test_no_data_yields_nothing() {
        assert!(parse_dtc_response("NO DATA", DtcStatus::Stored).is_empty());
    }
}
