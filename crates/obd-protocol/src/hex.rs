//! Hex helpers shared by the response parsers.

/// Parse a run of hex text into bytes, ignoring whitespace.
///
/// Parsing stops at the first non-hex character; a dangling nibble is
/// dropped.
pub fn parse_hex(text: &str) -> Vec<u8> {
    let digits: Vec<u8> = text
        .bytes()
        .filter(|b| !b.is_ascii_whitespace())
        .take_while(|b| b.is_ascii_hexdigit())
        .collect();

    digits
        .chunks_exact(2)
        .filter_map(|pair| {
            let s = std::str::from_utf8(pair).ok()?;
            u8::from_str_radix(s, 16).ok()
        })
        .collect()
}

/// Uppercase hex rendering without separators.
pub fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02X}")).collect()
}

/// Strip an ISO-TP frame index prefix (`0:`, `1:`, ... `F:`).
pub fn strip_frame_index(line: &str) -> Option<&str> {
    let (index, rest) = line.split_once(':')?;
    let index = index.trim();
    if !index.is_empty() && index.len() <= 2 && index.chars().all(|c| c.is_ascii_hexdigit()) {
        Some(rest.trim_start())
    } else {
        None
    }
}

/// A bare ISO-TP length header such as `014` precedes indexed frames.
pub fn is_length_header(line: &str) -> bool {
    let line = line.trim();
    line.len() == 3 && line.chars().all(|c| c.is_ascii_hexdigit())
}

/// Concatenate the payload bytes of a (possibly multi-frame) response.
///
/// Frame indices are stripped and length headers skipped, so the result is
/// the reassembled message as the adapter delivered it.
pub fn response_bytes(text: &str) -> Vec<u8> {
    let mut bytes = Vec::new();
    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if is_length_header(line) {
            continue;
        }
        let payload = strip_frame_index(line).unwrap_or(line);
        bytes.extend(parse_hex(payload));
    }
    bytes
}
