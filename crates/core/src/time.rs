//! Timestamp parsing and formatting for event time fields.

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde_json::Value;

/// Integer epochs at or above this magnitude are read as milliseconds.
const EPOCH_MILLIS_THRESHOLD: i64 = 100_000_000_000;

/// Parse a timestamp-shaped field value.
///
/// Accepts RFC 3339 / ISO-8601 strings (a missing offset means UTC) and
/// numeric epochs in seconds or milliseconds. Anything else yields `None`.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(text) => DateTime::parse_from_rfc3339(text)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
            .or_else(|| {
                NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f")
                    .ok()
                    .map(|naive| naive.and_utc())
            }),
        Value::Number(number) => {
            if let Some(epoch) = number.as_i64() {
                if epoch.abs() >= EPOCH_MILLIS_THRESHOLD {
                    DateTime::from_timestamp_millis(epoch)
                } else {
                    DateTime::from_timestamp(epoch, 0)
                }
            } else {
                let seconds = number.as_f64().filter(|s| s.is_finite())?;
                let whole = seconds.floor();
                let nanos = ((seconds - whole) * 1e9) as u32;
                DateTime::from_timestamp(whole as i64, nanos)
            }
        }
        _ => None,
    }
}

/// Format a timestamp as ISO-8601 in UTC with a `Z` suffix.
///
/// Sub-second digits are emitted only when non-zero.
pub fn format_timestamp(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}
