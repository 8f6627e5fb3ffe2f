use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use downstream_core::ids::{EventId, TrackId};

use crate::error::StoreError;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackRow {
    pub id: TrackId,
    pub event_id: EventId,
    pub name: String,
}

/// Track repository. Tracks are never renamed, only created on first sighting.
pub struct TrackRepo;

impl TrackRepo {
    pub fn get_or_create(
        conn: &Connection,
        event_id: &EventId,
        name: &str,
    ) -> Result<TrackRow, StoreError> {
        let existing = conn
            .query_row(
                "SELECT id FROM tracks WHERE event_id = ?1 AND name = ?2",
                [event_id.as_str(), name],
                |row| row.get::<_, String>(0),
            )
            .optional()?;

        let id = match existing {
            Some(id) => TrackId::from_raw(id),
            None => {
                let id = TrackId::new();
                conn.execute(
                    "INSERT INTO tracks (id, event_id, name) VALUES (?1, ?2, ?3)",
                    [id.as_str(), event_id.as_str(), name],
                )?;
                id
            }
        };

        Ok(TrackRow {
            id,
            event_id: event_id.clone(),
            name: name.to_string(),
        })
    }

    pub fn list(conn: &Connection, event_id: &EventId) -> Result<Vec<TrackRow>, StoreError> {
        let mut stmt =
            conn.prepare("SELECT id, name FROM tracks WHERE event_id = ?1 ORDER BY name")?;
        let rows = stmt
            .query_map([event_id.as_str()], |row| {
                Ok(TrackRow {
                    id: TrackId::from_raw(row.get::<_, String>(0)?),
                    event_id: event_id.clone(),
                    name: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}
