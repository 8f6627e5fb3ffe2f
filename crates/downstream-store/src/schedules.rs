//! Released schedule versions.
//!
//! Releasing copies the current slot placement into `schedule_slots`, so a
//! published version keeps its content when later imports move talks around.

use chrono::NaiveDateTime;
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use downstream_core::ids::{EventId, ScheduleId};

use crate::error::StoreError;
use crate::row_helpers;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleSlot {
    pub submission_code: String,
    pub title: String,
    pub room: String,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedSchedule {
    pub id: ScheduleId,
    pub event_id: EventId,
    pub version: String,
    pub created_at: String,
    pub slots: Vec<ScheduleSlot>,
}

pub struct ScheduleRepo;

impl ScheduleRepo {
    /// Release the current slot placement of the event as `version`.
    ///
    /// Returns `None` and leaves everything untouched when the event already
    /// has a schedule with that label.
    pub fn freeze(
        conn: &Connection,
        event_id: &EventId,
        version: &str,
    ) -> Result<Option<PublishedSchedule>, StoreError> {
        if Self::find_by_version(conn, event_id, version)?.is_some() {
            warn!(event_id = %event_id, version, "schedule version already released, not publishing");
            return Ok(None);
        }

        let id = ScheduleId::new();
        let now = row_helpers::now_timestamp();
        conn.execute(
            "INSERT INTO schedules (id, event_id, version, created_at) VALUES (?1, ?2, ?3, ?4)",
            [id.as_str(), event_id.as_str(), version, now.as_str()],
        )?;
        let copied = conn.execute(
            "INSERT INTO schedule_slots (schedule_id, submission_code, title, room, start_at, end_at)
             SELECT ?1, s.code, s.title, r.name, sl.start_at, sl.end_at
             FROM slots sl
             JOIN submissions s ON s.id = sl.submission_id
             JOIN rooms r ON r.id = sl.room_id
             WHERE s.event_id = ?2",
            [id.as_str(), event_id.as_str()],
        )?;
        info!(event_id = %event_id, version, slots = copied, "schedule released");

        Ok(Some(PublishedSchedule {
            slots: load_slots(conn, &id)?,
            id,
            event_id: event_id.clone(),
            version: version.to_string(),
            created_at: now,
        }))
    }

    pub fn find_by_version(
        conn: &Connection,
        event_id: &EventId,
        version: &str,
    ) -> Result<Option<ScheduleId>, StoreError> {
        Ok(conn
            .query_row(
                "SELECT id FROM schedules WHERE event_id = ?1 AND version = ?2",
                [event_id.as_str(), version],
                |row| row.get::<_, String>(0),
            )
            .optional()?
            .map(ScheduleId::from_raw))
    }

    pub fn get(conn: &Connection, id: &ScheduleId) -> Result<PublishedSchedule, StoreError> {
        let header = conn
            .query_row(
                "SELECT event_id, version, created_at FROM schedules WHERE id = ?1",
                [id.as_str()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("schedule {id}")))?;
        let (event_id, version, created_at) = header;

        Ok(PublishedSchedule {
            id: id.clone(),
            event_id: EventId::from_raw(event_id),
            version,
            created_at,
            slots: load_slots(conn, id)?,
        })
    }

    /// Released versions of the event, newest first, without slots.
    pub fn list(conn: &Connection, event_id: &EventId) -> Result<Vec<PublishedSchedule>, StoreError> {
        let mut stmt = conn.prepare(
            "SELECT id, version, created_at FROM schedules WHERE event_id = ?1
             ORDER BY created_at DESC, id DESC",
        )?;
        let rows = stmt
            .query_map([event_id.as_str()], |row| {
                Ok(PublishedSchedule {
                    id: ScheduleId::from_raw(row.get::<_, String>(0)?),
                    event_id: event_id.clone(),
                    version: row.get(1)?,
                    created_at: row.get(2)?,
                    slots: Vec::new(),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn latest(conn: &Connection, event_id: &EventId) -> Result<Option<PublishedSchedule>, StoreError> {
        let id = conn
            .query_row(
                "SELECT id FROM schedules WHERE event_id = ?1 ORDER BY created_at DESC, id DESC LIMIT 1",
                [event_id.as_str()],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        id.map(|id| Self::get(conn, &ScheduleId::from_raw(id))).transpose()
    }
}

fn load_slots(conn: &Connection, id: &ScheduleId) -> Result<Vec<ScheduleSlot>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT submission_code, title, room, start_at, end_at FROM schedule_slots
         WHERE schedule_id = ?1 ORDER BY start_at, room, submission_code",
    )?;
    let mut rows = stmt.query([id.as_str()])?;
    let mut slots = Vec::new();
    while let Some(row) = rows.next()? {
        let start: String = row.get(3)?;
        let end: String = row.get(4)?;
        slots.push(ScheduleSlot {
            submission_code: row.get(0)?,
            title: row.get(1)?,
            room: row.get(2)?,
            start: row_helpers::parse_slot_time(&start, "schedule_slots", "start_at")?,
            end: row_helpers::parse_slot_time(&end, "schedule_slots", "end_at")?,
        });
    }
    Ok(slots)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use crate::events::EventRepo;
    use crate::rooms::RoomRepo;
    use crate::session_types::SessionTypeRepo;
    use crate::submissions::{SubmissionFields, SubmissionRepo};
    use chrono::NaiveDate;

    fn at(h: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 15).unwrap().and_hms_opt(h, 0, 0).unwrap()
    }

    fn seeded() -> (Database, EventId) {
        let db = Database::in_memory().unwrap();
        let event = EventRepo::new(db.clone()).create("democon", "DemoCon", None, None).unwrap();
        db.with_conn(|conn| {
            let room = RoomRepo::upsert(conn, &event.id, "Main Hall", None)?;
            let talk = SessionTypeRepo::get_or_create(conn, &event.id, "Talk", 30)?;
            let fields = SubmissionFields {
                guid: None,
                title: "Opening Talk".into(),
                description: String::new(),
                abstract_text: String::new(),
                track_id: None,
                session_type_id: talk.id,
                language: "en".into(),
                do_not_record: false,
            };
            let id = SubmissionRepo::insert(conn, &event.id, "AAAAAA", &fields)?;
            SubmissionRepo::upsert_slot(conn, &id, &room.id, at(10), at(11))?;
            Ok(())
        })
        .unwrap();
        (db, event.id)
    }

    #[test]
    fn freeze_copies_current_slots() {
        let (db, event_id) = seeded();
        let schedule = db
            .with_conn(|conn| ScheduleRepo::freeze(conn, &event_id, "1.0"))
            .unwrap()
            .unwrap();
        assert_eq!(schedule.version, "1.0");
        assert_eq!(schedule.slots.len(), 1);
        assert_eq!(schedule.slots[0].room, "Main Hall");
        assert_eq!(schedule.slots[0].start, at(10));

        let latest = db
            .with_conn(|conn| ScheduleRepo::latest(conn, &event_id))
            .unwrap()
            .unwrap();
        assert_eq!(latest, schedule);
    }

    #[test]
    fn duplicate_version_is_not_released() {
        let (db, event_id) = seeded();
        db.with_conn(|conn| {
            assert!(ScheduleRepo::freeze(conn, &event_id, "1.0")?.is_some());
            assert!(ScheduleRepo::freeze(conn, &event_id, "1.0")?.is_none());
            assert!(ScheduleRepo::freeze(conn, &event_id, "1.1")?.is_some());
            let versions: Vec<_> = ScheduleRepo::list(conn, &event_id)?
                .into_iter()
                .map(|s| s.version)
                .collect();
            assert_eq!(versions, vec!["1.1", "1.0"]);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn released_slots_survive_later_moves() {
        let (db, event_id) = seeded();
        db.with_conn(|conn| {
            let released = ScheduleRepo::freeze(conn, &event_id, "1.0")?.unwrap();
            let sub = SubmissionRepo::find_by_code(conn, &event_id, "AAAAAA")?.unwrap();
            let room = RoomRepo::upsert(conn, &event_id, "Side Room", None)?;
            SubmissionRepo::upsert_slot(conn, &sub.id, &room.id, at(14), at(15))?;

            let reloaded = ScheduleRepo::get(conn, &released.id)?;
            assert_eq!(reloaded.slots[0].room, "Main Hall");
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn unknown_schedule_is_not_found() {
        let db = Database::in_memory().unwrap();
        let err = db
            .with_conn(|conn| ScheduleRepo::get(conn, &ScheduleId::from_raw("sched_missing")))
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }
}
