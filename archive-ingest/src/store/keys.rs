use chrono::{DateTime, Datelike, Timelike, Utc};

use super::bundle::BUNDLE_EXTENSION;

/// Storage path for a message: `topic/year/month/day/hour/uuid.bundle`, UTC, unpadded.
///
/// Timestamps outside the calendar range are clamped to its nearest end for the path
/// only; the bundle keeps the broker's value.
pub fn key_for(topic: &str, timestamp_ms: i64, text_uuid: &str) -> String {
    let at = path_time(timestamp_ms);
    format!(
        "{topic}/{}/{}/{}/{}/{text_uuid}.{BUNDLE_EXTENSION}",
        at.year(),
        at.month(),
        at.day(),
        at.hour()
    )
}

/// Whether a broker timestamp maps onto a calendar date as is.
pub fn in_calendar_range(timestamp_ms: i64) -> bool {
    DateTime::from_timestamp_millis(timestamp_ms).is_some()
}

fn path_time(timestamp_ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(timestamp_ms).unwrap_or(if timestamp_ms < 0 {
        DateTime::<Utc>::MIN_UTC
    } else {
        DateTime::<Utc>::MAX_UTC
    })
}

/// Prefix covering every key for `topic`, optionally narrowed to one month.
pub fn topic_prefix(topic: &str, year_month: Option<(i32, u32)>) -> String {
    match year_month {
        Some((year, month)) => format!("{topic}/{year}/{month}/"),
        None => format!("{topic}/"),
    }
}

/// Parses `YYYY/M` (zero padding accepted).
pub fn parse_year_month(value: &str) -> Option<(i32, u32)> {
    let (year, month) = value.split_once('/')?;
    let year = year.parse().ok()?;
    let month: u32 = month.parse().ok()?;
    (1..=12).contains(&month).then_some((year, month))
}
