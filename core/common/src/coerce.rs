//! Lenient value coercion for payloads coming from the remote store.
//!
//! The remote API is loosely typed: numbers may arrive as numeric strings, ids
//! as numbers, timestamps as integers, floats or date strings. These helpers are
//! used as `deserialize_with` targets on the typed record structs.

use chrono::{DateTime, NaiveDate};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer};
use serde_json::Value;

/// Read a float from a number or a numeric string.
pub fn value_as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Read an integer from an integer, a float (truncated) or a numeric string.
pub fn value_as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().map(|f| f as i64))
        }
        _ => None,
    }
}

/// Read epoch milliseconds from an integer, float, numeric string,
/// RFC 3339 timestamp or `YYYY-MM-DD` date (midnight UTC).
pub fn value_as_millis(value: &Value) -> Option<i64> {
    if let Some(ms) = value_as_i64(value) {
        return Some(ms);
    }
    let s = value.as_str()?.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.timestamp_millis());
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc().timestamp_millis())
}

/// Read a non-empty identifier from a string or a number.
pub fn value_as_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Read a boolean from a bool, `0`/`1` or `"true"`/`"false"`.
pub fn value_as_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_i64().map(|i| i != 0),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Some(true),
            "false" | "0" | "no" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// Format epoch milliseconds as a UTC calendar date (`YYYY-MM-DD`).
pub fn millis_to_date(ms: i64) -> Option<String> {
    DateTime::from_timestamp_millis(ms).map(|dt| dt.date_naive().format("%Y-%m-%d").to_string())
}

fn invalid<E: serde::de::Error>(kind: &str, value: &Value) -> E {
    E::custom(format!("expected {}, got {}", kind, value))
}

/// `deserialize_with` target for required floats.
pub fn lenient_f64<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
    let value = Value::deserialize(d)?;
    if value.is_null() {
        return Ok(0.0);
    }
    value_as_f64(&value).ok_or_else(|| invalid("number", &value))
}

/// `deserialize_with` target for optional integers.
pub fn lenient_opt_i64<'de, D: Deserializer<'de>>(d: D) -> Result<Option<i64>, D::Error> {
    let value = Value::deserialize(d)?;
    if value.is_null() {
        return Ok(None);
    }
    value_as_i64(&value)
        .map(Some)
        .ok_or_else(|| invalid("integer", &value))
}

/// `deserialize_with` target for required timestamps.
pub fn lenient_millis<'de, D: Deserializer<'de>>(d: D) -> Result<i64, D::Error> {
    let value = Value::deserialize(d)?;
    if value.is_null() {
        return Ok(0);
    }
    value_as_millis(&value).ok_or_else(|| invalid("timestamp", &value))
}

/// `deserialize_with` target for optional timestamps.
pub fn lenient_opt_millis<'de, D: Deserializer<'de>>(d: D) -> Result<Option<i64>, D::Error> {
    let value = Value::deserialize(d)?;
    if value.is_null() {
        return Ok(None);
    }
    value_as_millis(&value)
        .map(Some)
        .ok_or_else(|| invalid("timestamp", &value))
}

/// `deserialize_with` target for optional foreign keys.
pub fn lenient_opt_id<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    let value = Value::deserialize(d)?;
    match value {
        Value::Null => Ok(None),
        Value::String(ref s) if s.trim().is_empty() => Ok(None),
        other => value_as_id(&other)
            .map(Some)
            .ok_or_else(|| invalid("identifier", &other)),
    }
}

/// `deserialize_with` target for booleans.
pub fn lenient_bool<'de, D: Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
    let value = Value::deserialize(d)?;
    if value.is_null() {
        return Ok(false);
    }
    value_as_bool(&value).ok_or_else(|| invalid("boolean", &value))
}
