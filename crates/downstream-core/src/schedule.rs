//! In-memory representation of one parsed frab schedule.
//!
//! Produced fresh on every parse; nothing here has an identity beyond the
//! parse call. Persisted counterparts live in `downstream-store`.

use chrono::{NaiveDate, NaiveDateTime, TimeDelta};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScheduleDocument {
    pub version: String,
    pub conference: Conference,
    pub days: Vec<Day>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Conference {
    pub title: String,
    pub start: NaiveDate,
    pub end: NaiveDate,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Day {
    pub index: u32,
    pub date: NaiveDate,
    pub rooms: Vec<Room>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Room {
    pub name: String,
    pub guid: Option<String>,
    pub sessions: Vec<Session>,
}

/// A talk/session. Called `<event>` in frab, which is not the host event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub code: String,
    pub guid: Option<String>,
    pub start: NaiveDateTime,
    pub duration_minutes: i64,
    /// `start + duration`, computed once at parse time.
    pub end: NaiveDateTime,
    pub title: String,
    /// Description with a non-empty subtitle folded in front.
    pub description: String,
    pub abstract_text: String,
    pub track: Option<String>,
    pub session_type: String,
    pub language: String,
    pub do_not_record: bool,
    pub persons: Vec<String>,
}

/// End of a session by plain addition, so late sessions cross midnight.
/// `None` when the result leaves chrono's representable range.
pub fn session_end(start: NaiveDateTime, duration_minutes: i64) -> Option<NaiveDateTime> {
    start.checked_add_signed(TimeDelta::try_minutes(duration_minutes)?)
}

impl ScheduleDocument {
    pub fn rooms(&self) -> impl Iterator<Item = &Room> {
        self.days.iter().flat_map(|d| d.rooms.iter())
    }

    pub fn sessions(&self) -> impl Iterator<Item = (&Room, &Session)> {
        self.rooms()
            .flat_map(|room| room.sessions.iter().map(move |s| (room, s)))
    }

    /// Version label with everything from the first `marker` on removed.
    /// An empty marker leaves the label untouched.
    pub fn version_label(&self, discard_after: Option<&str>) -> String {
        match discard_after {
            Some(marker) if !marker.is_empty() => self
                .version
                .split_once(marker)
                .map_or(self.version.as_str(), |(head, _)| head)
                .to_string(),
            _ => self.version.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(version: &str) -> ScheduleDocument {
        ScheduleDocument {
            version: version.into(),
            conference: Conference {
                title: "Test Conference".into(),
                start: NaiveDate::from_ymd_opt(2024, 1, 15).unwrap(),
                end: NaiveDate::from_ymd_opt(2024, 1, 17).unwrap(),
            },
            days: Vec::new(),
        }
    }

    #[test]
    fn version_label_truncates_at_first_marker() {
        assert_eq!(doc("1.0-beta1").version_label(Some("-")), "1.0");
        assert_eq!(doc("1.0-beta-2").version_label(Some("-")), "1.0");
        assert_eq!(doc("2.1 (draft)").version_label(Some(" (")), "2.1");
    }

    #[test]
    fn version_label_without_marker() {
        assert_eq!(doc("1.0-beta1").version_label(None), "1.0-beta1");
        assert_eq!(doc("1.0-beta1").version_label(Some("")), "1.0-beta1");
        assert_eq!(doc("1.0").version_label(Some("-")), "1.0");
    }

    #[test]
    fn end_crosses_midnight_by_addition() {
        let start = NaiveDate::from_ymd_opt(2024, 1, 15)
            .unwrap()
            .and_hms_opt(23, 30, 0)
            .unwrap();
        assert_eq!(
            session_end(start, 60),
            NaiveDate::from_ymd_opt(2024, 1, 16).unwrap().and_hms_opt(0, 30, 0)
        );
    }

    #[test]
    fn end_out_of_range_is_none() {
        let start = NaiveDate::from_ymd_opt(2024, 1, 15)
            .unwrap()
            .and_hms_opt(10, 0, 0)
            .unwrap();
        assert_eq!(session_end(start, 3_000_000_000 * 60), None);
        assert_eq!(session_end(start, i64::MAX), None);
    }
}
