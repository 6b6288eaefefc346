//! Canonical timestamp encoding.
//!
//! Every timestamp the engine writes to SQLite uses the same fixed-width
//! RFC 3339 form (`2024-05-01T09:30:00.000Z`), so string comparison in SQL
//! matches chronological order. The pull checkpoint is the exception: it is
//! kept at microseconds, the precision the server compares at.

use chrono::{DateTime, SecondsFormat, Utc};

/// Formats a timestamp in the canonical storage form.
pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Formats a timestamp at microsecond precision (`...09:30:00.000000Z`).
pub fn format_ts_micros(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parses any RFC 3339 timestamp (and the `YYYY-MM-DD HH:MM:SS` form SQLite
/// produces for `datetime('now')`).
pub fn parse_ts(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Parses a timestamp held in a JSON value, if any.
pub fn parse_json_ts(value: Option<&serde_json::Value>) -> Option<DateTime<Utc>> {
    value.and_then(|v| v.as_str()).and_then(parse_ts)
}
