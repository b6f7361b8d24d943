//! VIN decoding: manufacturer from the WMI, model year from position 10,
//! and reassembly of the Mode 09 PID 02 response.

use serde::Serialize;

use crate::hex::{is_length_header, parse_hex, strip_frame_index};

pub const VIN_LENGTH: usize = 17;

/// World Manufacturer Identifiers (first three VIN characters)
const WMI_TABLE: &[(&str, &str)] = &[
    ("1FA", "Ford"),
    ("1FB", "Ford"),
    ("1FC", "Ford"),
    ("1FD", "Ford"),
    ("1FM", "Ford"),
    ("1FT", "Ford"),
    ("1FV", "Freightliner"),
    ("1ZV", "Ford"),
    ("2FA", "Ford"),
    ("2FM", "Ford"),
    ("2FT", "Ford"),
    ("3FA", "Ford"),
    ("3FE", "Ford"),
    ("3FM", "Ford"),
    ("3FT", "Ford"),
    ("MAJ", "Ford"),
    ("NM0", "Ford"),
    ("WF0", "Ford"),
    ("1LN", "Lincoln"),
    ("2LM", "Lincoln"),
    ("3LN", "Lincoln"),
    ("5LM", "Lincoln"),
    ("1G1", "Chevrolet"),
    ("1GC", "Chevrolet"),
    ("1GN", "Chevrolet"),
    ("2G1", "Chevrolet"),
    ("1GT", "GMC"),
    ("1GK", "GMC"),
    ("1G6", "Cadillac"),
    ("1GY", "Cadillac"),
    ("1C3", "Chrysler"),
    ("2C3", "Chrysler"),
    ("1C4", "Jeep"),
    ("1J4", "Jeep"),
    ("1C6", "Ram"),
    ("3C6", "Ram"),
    ("1B3", "Dodge"),
    ("2B3", "Dodge"),
    ("1HG", "Honda"),
    ("2HG", "Honda"),
    ("JHM", "Honda"),
    ("19X", "Honda"),
    ("JH4", "Acura"),
    ("19U", "Acura"),
    ("4T1", "Toyota"),
    ("5TD", "Toyota"),
    ("JTD", "Toyota"),
    ("JTE", "Toyota"),
    ("2T1", "Toyota"),
    ("JTH", "Lexus"),
    ("1N4", "Nissan"),
    ("JN1", "Nissan"),
    ("5N1", "Nissan"),
    ("JN8", "Nissan"),
    ("KMH", "Hyundai"),
    ("5NP", "Hyundai"),
    ("KNA", "Kia"),
    ("KND", "Kia"),
    ("JF1", "Subaru"),
    ("4S3", "Subaru"),
    ("JM1", "Mazda"),
    ("WBA", "BMW"),
    ("5UX", "BMW"),
    ("WDD", "Mercedes-Benz"),
    ("WDB", "Mercedes-Benz"),
    ("4JG", "Mercedes-Benz"),
    ("WVW", "Volkswagen"),
    ("3VW", "Volkswagen"),
    ("WAU", "Audi"),
    ("WP0", "Porsche"),
    ("YV1", "Volvo"),
    ("SAJ", "Jaguar"),
    ("SAL", "Land Rover"),
    ("5YJ", "Tesla"),
];

/// Two-character fallbacks when the full WMI is not listed
const MAKER_PREFIX_TABLE: &[(&str, &str)] = &[
    ("1F", "Ford"),
    ("1G", "General Motors"),
    ("1C", "Chrysler"),
    ("JT", "Toyota"),
    ("JN", "Nissan"),
    ("JH", "Honda"),
    ("KM", "Hyundai"),
    ("KN", "Kia"),
    ("WB", "BMW"),
    ("WD", "Mercedes-Benz"),
    ("WV", "Volkswagen"),
];

/// Ford/Lincoln WMIs whose vehicles carry a medium-speed CAN bus
const MS_CAN_WMIS: &[&str] = &[
    "1FA", "1FB", "1FC", "1FD", "1FM", "1FT", "1ZV", "2FA", "2FM", "2FT", "3FA", "3FE", "3FM", "3FT",
    "MAJ", "NM0", "WF0", "1LN", "2LM", "3LN", "5LM",
];

/// Model-year codes in cycle order, starting at 1980 (and 2010)
const YEAR_CODES: &str = "ABCDEFGHJKLMNPRSTVWXY123456789";

/// What the VIN says about the vehicle
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VinInfo {
    pub vin: String,
    pub wmi: String,
    pub manufacturer: String,
    pub model_year: Option<u16>,
    pub valid: bool,
}

/// Decode manufacturer and model year from a VIN.
pub fn decode_vin(vin: &str) -> VinInfo {
    let vin = vin.trim().to_ascii_uppercase();
    let wmi: String = vin.chars().take(3).collect();

    VinInfo {
        manufacturer: manufacturer(&wmi).to_string(),
        model_year: model_year(&vin),
        valid: is_well_formed(&vin),
        wmi,
        vin,
    }
}

/// 17 alphanumerics, none of I, O or Q.
pub fn is_well_formed(vin: &str) -> bool {
    vin.len() == VIN_LENGTH
        && vin
            .chars()
            .all(|c| c.is_ascii_alphanumeric() && !matches!(c.to_ascii_uppercase(), 'I' | 'O' | 'Q'))
}

pub fn manufacturer(wmi: &str) -> &'static str {
    let wmi = wmi.to_ascii_uppercase();
    if let Some((_, name)) = WMI_TABLE.iter().find(|(code, _)| *code == wmi) {
        return name;
    }
    MAKER_PREFIX_TABLE
        .iter()
        .find(|(prefix, _)| wmi.starts_with(prefix))
        .map(|(_, name)| *name)
        .unwrap_or("Unknown")
}

/// Model year from position 10.
///
/// Codes repeat every 30 years. For passenger vehicles position 7 is
/// alphabetic from 2010 onward, which picks the cycle.
pub fn model_year(vin: &str) -> Option<u16> {
    let bytes = vin.as_bytes();
    if bytes.len() != VIN_LENGTH {
        return None;
    }
    let code = bytes[9].to_ascii_uppercase() as char;
    let offset = YEAR_CODES.find(code)? as u16;
    let base = if bytes[6].is_ascii_alphabetic() { 2010 } else { 1980 };
    Some(base + offset)
}

/// North American check digit at position 9.
pub fn check_digit_valid(vin: &str) -> bool {
    const WEIGHTS: [u32; VIN_LENGTH] = [8, 7, 6, 5, 4, 3, 2, 10, 0, 9, 8, 7, 6, 5, 4, 3, 2];

    if !is_well_formed(vin) {
        return false;
    }
    let mut sum = 0;
    for (i, c) in vin.to_ascii_uppercase().chars().enumerate() {
        let value = match c {
            '0'..='9' => c as u32 - '0' as u32,
            'A'..='H' => c as u32 - 'A' as u32 + 1,
            'J'..='N' => c as u32 - 'J' as u32 + 1,
            'P' => 7,
            'R'..='Z' => c as u32 - 'R' as u32 + 9,
            _ => return false,
        };
        sum += value * WEIGHTS[i];
    }
    let expected = match sum % 11 {
        10 => 'X',
        n => char::from_digit(n, 10).unwrap_or('0'),
    };
    vin.as_bytes()[8].to_ascii_uppercase() as char == expected
}

/// True when the manufacturer routes modules onto a medium-speed CAN bus.
pub fn has_ms_can(vin: &str) -> bool {
    let wmi: String = vin.trim().to_ascii_uppercase().chars().take(3).collect();
    MS_CAN_WMIS.contains(&wmi.as_str())
}

/// Reassemble a VIN from a (possibly multi-frame) Mode 09 PID 02 response.
pub fn parse_vin_response(text: &str) -> Option<String> {
    let mut bytes = Vec::new();
    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if is_length_header(line) {
            continue;
        }
        let payload = match strip_frame_index(line) {
            Some(rest) => rest,
            // No frame index: skip what is probably a stale header fragment
            None => line.trim_start_matches(|c: char| !c.is_ascii_digit() || c == '0'),
        };
        bytes.extend(parse_hex(payload));
    }
    vin_from_bytes(&bytes)
}

/// Turn reassembled response bytes into a VIN.
///
/// More than 17 bytes means the `49` service byte leads; it is dropped and
/// the remaining non-printable PID/count bytes are filtered out.
pub fn vin_from_bytes(bytes: &[u8]) -> Option<String> {
    let bytes = if bytes.len() > VIN_LENGTH { &bytes[1..] } else { bytes };
    let text: String = bytes
        .iter()
        .filter(|b| (0x20..=0x7E).contains(*b))
        .map(|b| *b as char)
        .collect();
    let text = text.trim();
    if text.len() < VIN_LENGTH {
        return None;
    }
    Some(text.chars().take(VIN_LENGTH).collect())
}
