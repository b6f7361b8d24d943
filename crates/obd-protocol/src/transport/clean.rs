//! Response cleaning heuristics.
//!
//! Adapters echo inconsistently depending on when `ATE0` took effect, and
//! some emit stray bytes ahead of the real answer. These functions decide
//! what to strip; each one is deliberately loose.

/// ELM327 command prompt
pub const PROMPT: char = '>';

/// Banners emitted by ELM327 clones and STN-based adapters.
pub const VENDOR_MARKERS: &[&str] = &["ELM327", "ELM", "STN", "OBDLINK", "VLINK", "VGATE", "OBDII"];

/// Strip prompt and NUL bytes, then drop an echoed command or a stray first
/// line. Remaining lines are trimmed and joined with `\n`.
pub fn clean_response(raw: &str, command: &str) -> String {
    let stripped: String = raw.chars().filter(|c| *c != PROMPT && *c != '\0').collect();

    let mut lines: Vec<&str> = stripped
        .split(['\r', '\n'])
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();

    if let Some(first) = lines.first() {
        if is_echo(first, command) {
            lines.remove(0);
        } else if lines.len() > 1 && !looks_like_response(first) {
            lines.remove(0);
        }
    }

    lines.join("\n")
}

/// True when `line` is the adapter echoing `command` back, either exactly or
/// by its first three characters (echo fragments are often truncated).
pub fn is_echo(line: &str, command: &str) -> bool {
    let line = line.trim();
    let command = command.trim();
    if command.is_empty() {
        return false;
    }
    if line.eq_ignore_ascii_case(command) {
        return true;
    }
    command.len() >= 3
        && line.len() >= 3
        && line.is_char_boundary(3)
        && command.is_char_boundary(3)
        && line[..3].eq_ignore_ascii_case(&command[..3])
}

/// True when `line` starts like something an adapter legitimately answers
/// with: an OBD/UDS data byte, `OK`, `NO DATA`, `SEARCHING`, a vendor
/// banner, or `?`.
pub fn looks_like_response(line: &str) -> bool {
    let line = line.trim();
    let line = crate::hex::strip_frame_index(line).unwrap_or(line);
    let upper = line.to_ascii_uppercase();

    if upper.starts_with("OK")
        || upper.starts_with("NO DATA")
        || upper.starts_with("SEARCHING")
        || upper.starts_with('?')
    {
        return true;
    }
    if VENDOR_MARKERS.iter().any(|m| upper.starts_with(m)) {
        return true;
    }

    let mut chars = upper.chars();
    match (chars.next(), chars.next()) {
        (Some('4'), Some(c)) => c.is_ascii_hexdigit(),
        (Some('7'), Some('E' | 'F')) => true,
        _ => false,
    }
}

/// Pull `(name, version)` out of a reset banner such as `ELM327 v1.5`.
pub fn parse_adapter_identity(reset_response: &str) -> (String, String) {
    for line in reset_response.lines().map(str::trim) {
        let upper = line.to_ascii_uppercase();
        if !VENDOR_MARKERS.iter().any(|m| upper.contains(m)) {
            continue;
        }
        let mut name = Vec::new();
        let mut version = String::new();
        for token in line.split_whitespace() {
            let is_version = token.len() > 1
                && token.starts_with(['v', 'V'])
                && token[1..].starts_with(|c: char| c.is_ascii_digit());
            if is_version && version.is_empty() {
                version = token.to_string();
            } else {
                name.push(token);
            }
        }
        return (name.join(" "), version);
    }
    ("Unknown ELM327".to_string(), String::new())
}
