//! Timestamp parsing and backfill

use chrono::{DateTime, NaiveDateTime};
use serde_json::Value;

use crate::model::DataEvent;
use crate::transform::error::TransformError;

const NAIVE_FORMATS: [&str; 3] = ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S%.f"];

/// Epoch milliseconds from a number, a numeric string or a date string.
/// Date strings without an offset are read as UTC.
pub fn parse_timestamp(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f.round() as i64)),
        Value::String(s) => parse_timestamp_str(s.trim()),
        _ => None,
    }
}

fn parse_timestamp_str(s: &str) -> Option<i64> {
    if s.is_empty() {
        return None;
    }
    if let Ok(ms) = s.parse::<i64>() {
        return Some(ms);
    }
    if let Ok(ms) = s.parse::<f64>() {
        return ms.is_finite().then(|| ms.round() as i64);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.timestamp_millis());
    }
    NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(|dt| dt.and_utc().timestamp_millis())
}

/// Sets `ts` of every event whose value is a JSON object (or a string holding
/// one) carrying `field`.
///
/// All-or-nothing: if any value cannot be read, no event is touched and the
/// error is returned so the caller can log it once for the whole batch.
pub fn backfill_timestamps(events: &mut [DataEvent], field: &str) -> Result<usize, TransformError> {
    let mut updates = Vec::new();

    for (idx, event) in events.iter().enumerate() {
        let parsed;
        let object = match &event.value {
            Value::Object(map) => map,
            Value::String(text) => {
                parsed = serde_json::from_str::<Value>(text)
                    .map_err(|e| TransformError::InvalidPayload(format!("{}: {}", text, e)))?;
                match &parsed {
                    Value::Object(map) => map,
                    _ => continue,
                }
            }
            _ => continue,
        };
        let Some(raw) = object.get(field) else {
            continue;
        };
        let ts = parse_timestamp(raw).ok_or_else(|| TransformError::InvalidTimestamp(raw.to_string()))?;
        updates.push((idx, ts));
    }

    let count = updates.len();
    for (idx, ts) in updates {
        events[idx].ts = Some(ts);
    }
    Ok(count)
}
