//! Lenient decoding of device JSON replies.
//!
//! Firmware likes to embed raw control bytes in reply payloads and to pad
//! the end with NUL. Both break strict JSON parsers, so replies are
//! sanitized before handing them to serde.

use serde_json::Value;

use crate::error::Result;

/// Parse a device reply, tolerating embedded control characters and
/// trailing NUL padding.
pub fn parse_lenient(bytes: &[u8]) -> Result<Value> {
    let end = bytes
        .iter()
        .rposition(|&b| b != 0)
        .map(|i| i + 1)
        .unwrap_or(0);
    let text = String::from_utf8_lossy(&bytes[..end]);
    let cleaned: String = text.chars().filter(|&c| !is_stripped_control(c)).collect();
    Ok(serde_json::from_str(&cleaned)?)
}

/// Control characters stripped before parsing: C0 (tab excluded), DEL and C1.
fn is_stripped_control(c: char) -> bool {
    (c < '\u{20}' && c != '\t') || ('\u{7f}'..='\u{9f}').contains(&c)
}
