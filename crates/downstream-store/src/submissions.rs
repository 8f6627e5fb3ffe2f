use chrono::NaiveDateTime;
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use downstream_core::ids::{EventId, RoomId, SessionTypeId, SubmissionId, TrackId};

use crate::error::StoreError;
use crate::row_helpers;

/// Writable columns of a submission.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubmissionFields {
    pub guid: Option<String>,
    pub title: String,
    pub description: String,
    pub abstract_text: String,
    pub track_id: Option<TrackId>,
    pub session_type_id: SessionTypeId,
    pub language: String,
    pub do_not_record: bool,
}

/// Scheduled position of a submission in the work-in-progress schedule.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotRow {
    pub room_id: RoomId,
    pub room: String,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

/// A submission with its track, type and slot resolved to names.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionRow {
    pub id: SubmissionId,
    pub event_id: EventId,
    pub code: String,
    pub guid: Option<String>,
    pub title: String,
    pub description: String,
    pub abstract_text: String,
    pub track_id: Option<TrackId>,
    pub track: Option<String>,
    pub session_type_id: SessionTypeId,
    pub session_type: String,
    pub language: String,
    pub do_not_record: bool,
    pub slot: Option<SlotRow>,
}

const SUBMISSION_SELECT: &str = "SELECT s.id, s.event_id, s.code, s.guid, s.title, s.description, s.abstract,
        s.track_id, t.name, s.session_type_id, st.name, s.language, s.do_not_record,
        sl.room_id, r.name, sl.start_at, sl.end_at
     FROM submissions s
     LEFT JOIN tracks t ON t.id = s.track_id
     JOIN session_types st ON st.id = s.session_type_id
     LEFT JOIN slots sl ON sl.submission_id = s.id
     LEFT JOIN rooms r ON r.id = sl.room_id";

/// Submission repository, keyed by the upstream code within an event.
pub struct SubmissionRepo;

impl SubmissionRepo {
    pub fn find_by_code(
        conn: &Connection,
        event_id: &EventId,
        code: &str,
    ) -> Result<Option<SubmissionRow>, StoreError> {
        conn.query_row(
            &format!("{SUBMISSION_SELECT} WHERE s.event_id = ?1 AND s.code = ?2"),
            [event_id.as_str(), code],
            |row| Ok(row_to_submission(row)),
        )
        .optional()?
        .transpose()
    }

    pub fn insert(
        conn: &Connection,
        event_id: &EventId,
        code: &str,
        fields: &SubmissionFields,
    ) -> Result<SubmissionId, StoreError> {
        let id = SubmissionId::new();
        let now = row_helpers::now_timestamp();
        conn.execute(
            "INSERT INTO submissions (id, event_id, code, guid, title, description, abstract, track_id,
                                      session_type_id, language, do_not_record, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?12)",
            rusqlite::params![
                id.as_str(),
                event_id.as_str(),
                code,
                fields.guid,
                fields.title,
                fields.description,
                fields.abstract_text,
                fields.track_id.as_ref().map(TrackId::as_str),
                fields.session_type_id.as_str(),
                fields.language,
                fields.do_not_record,
                now,
            ],
        )?;
        Ok(id)
    }

    pub fn update(
        conn: &Connection,
        id: &SubmissionId,
        fields: &SubmissionFields,
    ) -> Result<(), StoreError> {
        let updated = conn.execute(
            "UPDATE submissions SET guid = ?1, title = ?2, description = ?3, abstract = ?4, track_id = ?5,
                    session_type_id = ?6, language = ?7, do_not_record = ?8, updated_at = ?9
             WHERE id = ?10",
            rusqlite::params![
                fields.guid,
                fields.title,
                fields.description,
                fields.abstract_text,
                fields.track_id.as_ref().map(TrackId::as_str),
                fields.session_type_id.as_str(),
                fields.language,
                fields.do_not_record,
                row_helpers::now_timestamp(),
                id.as_str(),
            ],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound(format!("submission {id}")));
        }
        Ok(())
    }

    /// Place a submission in the work-in-progress schedule.
    pub fn upsert_slot(
        conn: &Connection,
        id: &SubmissionId,
        room_id: &RoomId,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> Result<(), StoreError> {
        conn.execute(
            "INSERT INTO slots (submission_id, room_id, start_at, end_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(submission_id) DO UPDATE SET
                 room_id = excluded.room_id, start_at = excluded.start_at, end_at = excluded.end_at",
            rusqlite::params![
                id.as_str(),
                room_id.as_str(),
                row_helpers::format_slot_time(start),
                row_helpers::format_slot_time(end),
            ],
        )?;
        Ok(())
    }

    /// All submissions of the event, ordered by code.
    pub fn list(conn: &Connection, event_id: &EventId) -> Result<Vec<SubmissionRow>, StoreError> {
        let mut stmt =
            conn.prepare(&format!("{SUBMISSION_SELECT} WHERE s.event_id = ?1 ORDER BY s.code"))?;
        let mut rows = stmt.query([event_id.as_str()])?;
        let mut submissions = Vec::new();
        while let Some(row) = rows.next()? {
            submissions.push(row_to_submission(row)?);
        }
        Ok(submissions)
    }
}

fn row_to_submission(row: &rusqlite::Row<'_>) -> Result<SubmissionRow, StoreError> {
    let room_id: Option<String> = row.get(13)?;
    let slot = match room_id {
        Some(room_id) => {
            let start: String = row.get(15)?;
            let end: String = row.get(16)?;
            Some(SlotRow {
                room_id: RoomId::from_raw(room_id),
                room: row.get(14)?,
                start: row_helpers::parse_slot_time(&start, "slots", "start_at")?,
                end: row_helpers::parse_slot_time(&end, "slots", "end_at")?,
            })
        }
        None => None,
    };

    Ok(SubmissionRow {
        id: SubmissionId::from_raw(row.get::<_, String>(0)?),
        event_id: EventId::from_raw(row.get::<_, String>(1)?),
        code: row.get(2)?,
        guid: row.get(3)?,
        title: row.get(4)?,
        description: row.get(5)?,
        abstract_text: row.get(6)?,
        track_id: row.get::<_, Option<String>>(7)?.map(TrackId::from_raw),
        track: row.get(8)?,
        session_type_id: SessionTypeId::from_raw(row.get::<_, String>(9)?),
        session_type: row.get(10)?,
        language: row.get(11)?,
        do_not_record: row.get(12)?,
        slot,
    })
}
