use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};

use crate::error::StoreError;

/// Format used for slot times (naive, conference-local).
pub const SLOT_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Fixed-width RFC 3339 timestamp so stored values sort lexically.
pub fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn now_timestamp() -> String {
    timestamp(Utc::now())
}

pub fn format_slot_time(at: NaiveDateTime) -> String {
    at.format(SLOT_TIME_FORMAT).to_string()
}

/// Parse a stored RFC 3339 timestamp, returning CorruptRow on failure.
pub fn parse_timestamp(
    raw: &str,
    table: &'static str,
    column: &'static str,
) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::CorruptRow {
            table,
            column,
            detail: format!("invalid timestamp {raw:?}: {e}"),
        })
}

pub fn parse_slot_time(
    raw: &str,
    table: &'static str,
    column: &'static str,
) -> Result<NaiveDateTime, StoreError> {
    NaiveDateTime::parse_from_str(raw, SLOT_TIME_FORMAT).map_err(|e| StoreError::CorruptRow {
        table,
        column,
        detail: format!("invalid slot time {raw:?}: {e}"),
    })
}

pub fn parse_date(
    raw: &str,
    table: &'static str,
    column: &'static str,
) -> Result<NaiveDate, StoreError> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|e| StoreError::CorruptRow {
        table,
        column,
        detail: format!("invalid date {raw:?}: {e}"),
    })
}

/// Parse a string into an enum, returning CorruptRow on failure.
pub fn parse_enum<T: std::str::FromStr>(
    raw: &str,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError> {
    raw.parse().map_err(|_| StoreError::CorruptRow {
        table,
        column,
        detail: format!("unknown variant: {raw}"),
    })
}
