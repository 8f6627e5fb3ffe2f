use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use downstream_core::ids::{EventId, SpeakerId, SubmissionId, UserId};

use crate::error::StoreError;
use crate::row_helpers;

/// A speaker profile: a local user account taking part in one event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpeakerRow {
    pub id: SpeakerId,
    pub event_id: EventId,
    pub user_id: UserId,
    /// Synthetic local handle the account is keyed by.
    pub handle: String,
    pub name: String,
}

pub struct SpeakerRepo;

impl SpeakerRepo {
    /// Return the profile of the account with `handle` in this event,
    /// creating the account and/or profile when missing. Existing rows are
    /// returned unchanged, including the name they were created with.
    pub fn get_or_create(
        conn: &Connection,
        event_id: &EventId,
        handle: &str,
        name: &str,
    ) -> Result<SpeakerRow, StoreError> {
        let now = row_helpers::now_timestamp();

        let user = conn
            .query_row(
                "SELECT id, name FROM users WHERE handle = ?1",
                [handle],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?;
        let (user_id, user_name) = match user {
            Some((id, existing_name)) => (UserId::from_raw(id), existing_name),
            None => {
                let id = UserId::new();
                conn.execute(
                    "INSERT INTO users (id, handle, name, created_at) VALUES (?1, ?2, ?3, ?4)",
                    [id.as_str(), handle, name, now.as_str()],
                )?;
                (id, name.to_string())
            }
        };

        let profile = conn
            .query_row(
                "SELECT id FROM speaker_profiles WHERE event_id = ?1 AND user_id = ?2",
                [event_id.as_str(), user_id.as_str()],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        let id = match profile {
            Some(id) => SpeakerId::from_raw(id),
            None => {
                let id = SpeakerId::new();
                conn.execute(
                    "INSERT INTO speaker_profiles (id, event_id, user_id, created_at) VALUES (?1, ?2, ?3, ?4)",
                    [id.as_str(), event_id.as_str(), user_id.as_str(), now.as_str()],
                )?;
                id
            }
        };

        Ok(SpeakerRow {
            id,
            event_id: event_id.clone(),
            user_id,
            handle: handle.to_string(),
            name: user_name,
        })
    }

    /// Link a speaker to a submission. Already linked pairs are left alone.
    pub fn attach(
        conn: &Connection,
        submission_id: &SubmissionId,
        speaker_id: &SpeakerId,
    ) -> Result<bool, StoreError> {
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO submission_speakers (submission_id, speaker_id) VALUES (?1, ?2)",
            [submission_id.as_str(), speaker_id.as_str()],
        )?;
        Ok(inserted > 0)
    }

    pub fn for_submission(
        conn: &Connection,
        submission_id: &SubmissionId,
    ) -> Result<Vec<SpeakerRow>, StoreError> {
        let mut stmt = conn.prepare(
            "SELECT p.id, p.event_id, u.id, u.handle, u.name
             FROM submission_speakers ss
             JOIN speaker_profiles p ON p.id = ss.speaker_id
             JOIN users u ON u.id = p.user_id
             WHERE ss.submission_id = ?1
             ORDER BY u.name",
        )?;
        let rows = stmt
            .query_map([submission_id.as_str()], row_to_speaker)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn list(conn: &Connection, event_id: &EventId) -> Result<Vec<SpeakerRow>, StoreError> {
        let mut stmt = conn.prepare(
            "SELECT p.id, p.event_id, u.id, u.handle, u.name
             FROM speaker_profiles p JOIN users u ON u.id = p.user_id
             WHERE p.event_id = ?1
             ORDER BY u.name",
        )?;
        let rows = stmt
            .query_map([event_id.as_str()], row_to_speaker)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

fn row_to_speaker(row: &rusqlite::Row<'_>) -> rusqlite::Result<SpeakerRow> {
    Ok(SpeakerRow {
        id: SpeakerId::from_raw(row.get::<_, String>(0)?),
        event_id: EventId::from_raw(row.get::<_, String>(1)?),
        user_id: UserId::from_raw(row.get::<_, String>(2)?),
        handle: row.get(3)?,
        name: row.get(4)?,
    })
}
