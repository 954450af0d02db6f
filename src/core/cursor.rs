// Pagination cursors of the form `{type}_{lastSeenId}`, parsed leniently.

/// Start-of-sequence offset; every malformed cursor collapses to it.
pub const START: u64 = 0;

/// Extract the id offset from a raw `after` value.
///
/// Absent or empty input starts from the beginning. The value is split on
/// `_`; only a two-part value yields an offset, and that part is read with
/// loose numeric semantics so `Page_12abc` is 12 and `Page_abc` is 0. A
/// cursor issued for another type is not rejected.
pub fn parse_offset(after: Option<&str>) -> u64 {
    let Some(after) = after else {
        return START;
    };
    if after.is_empty() {
        return START;
    }
    let parts: Vec<&str> = after.split('_').collect();
    if parts.len() != 2 {
        return START;
    }
    loose_u64(parts[1])
}

/// Format the cursor echoed back in the response envelope.
pub fn format_cursor(record_type: &str, offset: u64) -> String {
    format!("{record_type}_{offset}")
}

fn loose_u64(raw: &str) -> u64 {
    let trimmed = raw.trim_start_matches([' ', '\t', '\n', '\r', '\x0b', '\x0c']);
    let (negative, digits) = match trimmed.as_bytes().first() {
        Some(b'-') => (true, &trimmed[1..]),
        Some(b'+') => (false, &trimmed[1..]),
        _ => (false, trimmed),
    };
    let mut value: u64 = 0;
    let mut seen_digit = false;
    for byte in digits.bytes() {
        if !byte.is_ascii_digit() {
            break;
        }
        seen_digit = true;
        value = value
            .saturating_mul(10)
            .saturating_add(u64::from(byte - b'0'));
    }
    if !seen_digit || negative {
        return START;
    }
    value
}
