//! The brokers' packed timestamp format.
//!
//! Times are sent as a digit string `YYYYMMDDHHMMSS` with an optional
//! fractional-second tail (`fff`, sometimes longer). Some brokers send the
//! value as a JSON number instead of a string. The associated timezone name
//! travels separately, in the `units` field of verbose responses only.

use chrono::{Local, NaiveDate, NaiveDateTime, Timelike};
use serde_json::Value;

/// Parse a packed `YYYYMMDDHHMMSS[fff...]` digit string.
///
/// Returns `None` for anything that is not at least 14 digits or does not
/// name a real calendar time.
#[must_use]
pub fn parse_packed(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    if raw.len() < 14 || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    let field = |range: std::ops::Range<usize>| raw[range].parse::<u32>().ok();
    let year = raw[0..4].parse::<i32>().ok()?;
    let (month, day) = (field(4..6)?, field(6..8)?);
    let (hour, min, sec) = (field(8..10)?, field(10..12)?, field(12..14)?);

    // Fractional digits scale to nanoseconds; extra precision is dropped.
    let frac = &raw[14..];
    let nanos = if frac.is_empty() {
        0
    } else {
        let digits = &frac[..frac.len().min(9)];
        let scale = 10u32.pow(9 - u32::try_from(digits.len()).ok()?);
        digits.parse::<u32>().ok()? * scale
    };

    NaiveDate::from_ymd_opt(year, month, day)?.and_hms_nano_opt(hour, min, sec, nanos)
}

/// Extract a packed timestamp string from a JSON value; some brokers send
/// the digits as a bare number instead of a string.
#[must_use]
pub fn packed_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Format a time in the packed wire format with millisecond precision.
#[must_use]
pub fn format_packed(time: NaiveDateTime) -> String {
    format!(
        "{}{:03}",
        time.format("%Y%m%d%H%M%S"),
        time.nanosecond() / 1_000_000
    )
}

/// The current local time, packed. Used as a fallback when a notification
/// carries no `message_time`.
#[must_use]
pub fn now_packed() -> String {
    format_packed(Local::now().naive_local())
}
