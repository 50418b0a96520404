//! Locating the JSON evaluation inside free-form model output.

use crate::types::ErrorKind;
use serde_json::{Map, Value as JsonValue};

/// Responses shorter than this (after trimming) are treated as truncated.
pub const TRUNCATED_THRESHOLD: usize = 100;

/// Find the first top-level `{...}` block that parses as a JSON object.
///
/// Braces inside string literals are ignored. A balanced candidate that
/// does not parse is skipped as a whole, so prose like `{see below}` before
/// the real payload is tolerated but an object nested inside a malformed
/// one is never returned. An opening brace that never closes ends the scan.
pub fn find_json_object(text: &str) -> Option<Map<String, JsonValue>> {
    let bytes = text.as_bytes();
    let mut start = 0;

    while let Some(offset) = text[start..].find('{') {
        let open = start + offset;
        let close = balanced_end(bytes, open)?;
        if let Ok(JsonValue::Object(map)) = serde_json::from_str(&text[open..=close]) {
            return Some(map);
        }
        start = close + 1;
    }

    None
}

/// Index of the `}` closing the object opened at `open`.
fn balanced_end(bytes: &[u8], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (idx, &byte) in bytes.iter().enumerate().skip(open) {
        if in_string {
            match byte {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }

        match byte {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(idx);
                }
            }
            _ => {}
        }
    }

    None
}

/// Classify output that carried no usable JSON object.
pub fn classify_unparseable(text: &str) -> ErrorKind {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        ErrorKind::EmptyResponse
    } else if trimmed.chars().count() < TRUNCATED_THRESHOLD {
        ErrorKind::TruncatedResponse
    } else {
        ErrorKind::InvalidResponseFormat
    }
}

/// First `limit` characters of `text`, on a char boundary.
pub fn preview(text: &str, limit: usize) -> &str {
    match text.char_indices().nth(limit) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
