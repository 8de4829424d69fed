//! Lenient readers for loosely typed JSON values.
//!
//! Auth metadata and upstream payloads carry numbers as floats, ints, or
//! strings depending on which client wrote them; these helpers accept all
//! of those shapes.

use serde_json::Value;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

pub fn read_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => {
            let parsed = number.as_f64()?;
            if parsed.is_nan() || parsed.is_infinite() {
                return None;
            }
            Some(parsed)
        }
        Value::String(raw) => {
            let parsed = raw.trim().parse::<f64>().ok()?;
            if parsed.is_nan() || parsed.is_infinite() {
                return None;
            }
            Some(parsed)
        }
        _ => None,
    }
}

pub fn read_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().map(|parsed| parsed as i64)),
        Value::String(raw) => {
            let raw = raw.trim();
            if raw.is_empty() {
                return None;
            }
            raw.parse::<i64>().ok()
        }
        _ => None,
    }
}

/// Trimmed, non-empty string form of a scalar value.
pub fn value_string(value: &Value) -> Option<String> {
    let out = match value {
        Value::String(raw) => raw.trim().to_string(),
        Value::Number(number) => number.to_string(),
        _ => return None,
    };
    if out.is_empty() { None } else { Some(out) }
}

pub fn read_bool(value: &Value) -> bool {
    match value {
        Value::Bool(flag) => *flag,
        Value::String(raw) => {
            let trimmed = raw.trim();
            trimmed.eq_ignore_ascii_case("true") || trimmed == "1"
        }
        _ => false,
    }
}

/// Parses an RFC 3339 timestamp (nanosecond precision accepted) to UTC.
pub fn parse_rfc3339(value: &Value) -> Option<OffsetDateTime> {
    let raw = value_string(value)?;
    OffsetDateTime::parse(&raw, &Rfc3339)
        .ok()
        .map(|parsed| parsed.to_offset(time::UtcOffset::UTC))
}
