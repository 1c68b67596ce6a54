//! Date parsing for `once`, `when`, windows, `until` and `after`.
//!
//! Naive timestamps are read as UTC. Time-of-day forms ("1:00pm", "13:00")
//! are anchored to the UTC date of the tick being evaluated, so a window such
//! as `{start: "1:00pm", end: "2:00pm"}` recurs daily.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};

/// Human-readable description of what [`parse_flexible`] accepts.
pub const FLEXIBLE_FORMATS: &str = "ISO-8601 date/time or time of day such as 1:00pm";

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
    "%m/%d/%Y %I:%M%p",
    "%m/%d/%Y %I:%M:%S%p",
    "%m/%d/%Y %H:%M",
];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%m/%d/%Y"];

const TIME_FORMATS: &[&str] = &["%I:%M%p", "%I:%M:%S%p", "%I%p", "%H:%M:%S", "%H:%M"];

/// Parse `value` with one exact strftime-style format. A date-only format
/// yields midnight.
pub fn parse_with_format(value: &str, format: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    NaiveDateTime::parse_from_str(value, format)
        .ok()
        .or_else(|| {
            NaiveDate::parse_from_str(value, format)
                .ok()
                .and_then(|date| date.and_hms_opt(0, 0, 0))
        })
        .map(|naive| naive.and_utc())
}

/// Parse any of the supported date/time shapes.
pub fn parse_flexible(value: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(dt.with_timezone(&Utc));
    }

    let normalized = normalize_meridiem(trimmed);

    if let Some(dt) = DATETIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(&normalized, fmt).ok())
    {
        return Some(dt.and_utc());
    }

    if let Some(date) = DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(&normalized, fmt).ok())
    {
        return date.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc());
    }

    TIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveTime::parse_from_str(&normalized, fmt).ok())
        .map(|time| now.date_naive().and_time(time).and_utc())
}

/// Upper-case the am/pm marker and drop the space before it: "1:00 pm" → "1:00PM".
fn normalize_meridiem(value: &str) -> String {
    let upper = value.to_ascii_uppercase();
    for marker in ["AM", "PM"] {
        if let Some(head) = upper.strip_suffix(marker) {
            return format!("{}{}", head.trim_end(), marker);
        }
    }
    upper
}
