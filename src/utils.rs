/// Formats bytes as uppercase hexadecimal pairs separated by spaces.
pub(crate) fn format_hex(bytes: &[u8]) -> String {
    if bytes.is_empty() {
        return "<empty>".to_string();
    }

    let mut rendered = String::with_capacity(bytes.len().saturating_mul(3));
    for (index, value) in bytes.iter().enumerate() {
        if index > 0 {
            rendered.push(' ');
        }
        rendered.push(nibble_to_hex(value >> 4));
        rendered.push(nibble_to_hex(value & 0x0F));
    }
    rendered
}

/// Formats bytes as uppercase hexadecimal pairs without separators.
pub(crate) fn format_hex_compact(bytes: &[u8]) -> String {
    let mut rendered = String::with_capacity(bytes.len().saturating_mul(2));
    for value in bytes {
        rendered.push(nibble_to_hex(value >> 4));
        rendered.push(nibble_to_hex(value & 0x0F));
    }
    rendered
}

/// Returns true when `pattern` occurs as a hex substring of `bytes`.
///
/// The pattern is compared case-insensitively against the compact hex
/// rendering, so `"a7b3"` matches a payload starting `0xA7 0xB3`.
pub(crate) fn matches_hex_pattern(bytes: &[u8], pattern: &str) -> bool {
    if pattern.is_empty() {
        return true;
    }
    let haystack = format_hex_compact(bytes);
    let needle = pattern.to_ascii_uppercase();
    haystack.contains(&needle)
}

fn nibble_to_hex(value: u8) -> char {
    const HEX: &[u8; 16] = b"0123456789ABCDEF";
    HEX[value as usize] as char
}

const BASE_UUID_TAIL: &str = "00001000800000805f9b34fb";

/// Normalizes a UUID for comparison: lower-case, dashes stripped, 16- and
/// 32-bit shorthands expanded over the Bluetooth base UUID.
///
/// Returns `None` when the input is not a UUID in any accepted shape.
pub(crate) fn normalize_uuid(raw: &str) -> Option<String> {
    let stripped: String = raw
        .chars()
        .filter(|c| *c != '-')
        .map(|c| c.to_ascii_lowercase())
        .collect();
    if stripped.is_empty() || !stripped.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }

    match stripped.len() {
        4 => Some(format!("0000{stripped}{BASE_UUID_TAIL}")),
        8 => Some(format!("{stripped}{BASE_UUID_TAIL}")),
        32 => Some(stripped),
        _ => None,
    }
}
