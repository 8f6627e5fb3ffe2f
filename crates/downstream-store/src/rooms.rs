use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::warn;

use downstream_core::ids::{EventId, RoomId};

use crate::error::StoreError;
use crate::row_helpers;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomRow {
    pub id: RoomId,
    pub event_id: EventId,
    pub name: String,
    pub guid: Option<String>,
}

/// Room repository. Stateless, every method takes `&Connection` so it can
/// run inside the reconciliation transaction.
pub struct RoomRepo;

impl RoomRepo {
    pub fn find_by_guid(
        conn: &Connection,
        event_id: &EventId,
        guid: &str,
    ) -> Result<Option<RoomRow>, StoreError> {
        Ok(conn
            .query_row(
                "SELECT id, event_id, name, guid FROM rooms WHERE event_id = ?1 AND guid = ?2",
                [event_id.as_str(), guid],
                row_to_room,
            )
            .optional()?)
    }

    pub fn find_by_name(
        conn: &Connection,
        event_id: &EventId,
        name: &str,
    ) -> Result<Option<RoomRow>, StoreError> {
        Ok(conn
            .query_row(
                "SELECT id, event_id, name, guid FROM rooms WHERE event_id = ?1 AND name = ?2",
                [event_id.as_str(), name],
                row_to_room,
            )
            .optional()?)
    }

    /// Upsert a room keyed by GUID when given, by name otherwise.
    ///
    /// A room known by GUID takes the new name. A GUID unknown to the event
    /// is attached to the room of the same name, or a new room is created.
    pub fn upsert(
        conn: &Connection,
        event_id: &EventId,
        name: &str,
        guid: Option<&str>,
    ) -> Result<RoomRow, StoreError> {
        if let Some(guid) = guid {
            if let Some(mut room) = Self::find_by_guid(conn, event_id, guid)? {
                if room.name != name {
                    Self::park_name(conn, event_id, name, &room.id)?;
                    conn.execute(
                        "UPDATE rooms SET name = ?1 WHERE id = ?2",
                        [name, room.id.as_str()],
                    )?;
                    room.name = name.to_string();
                }
                return Ok(room);
            }
        }

        if let Some(mut room) = Self::find_by_name(conn, event_id, name)? {
            if let Some(guid) = guid {
                if let Some(previous) = room.guid.as_deref() {
                    warn!(room = name, previous, guid, "room name reused with a new guid");
                }
                conn.execute("UPDATE rooms SET guid = ?1 WHERE id = ?2", [guid, room.id.as_str()])?;
                room.guid = Some(guid.to_string());
            }
            return Ok(room);
        }

        let id = RoomId::new();
        conn.execute(
            "INSERT INTO rooms (id, event_id, name, guid, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                id.as_str(),
                event_id.as_str(),
                name,
                guid,
                row_helpers::now_timestamp()
            ],
        )?;
        Ok(RoomRow {
            id,
            event_id: event_id.clone(),
            name: name.to_string(),
            guid: guid.map(str::to_string),
        })
    }

    /// Free `name` for `taker` by renaming whichever other room holds it.
    ///
    /// The holder keeps its id and slots under `<name> (<id>)`. When two
    /// rooms swap names the holder gets its new name later in the same pass.
    fn park_name(
        conn: &Connection,
        event_id: &EventId,
        name: &str,
        taker: &RoomId,
    ) -> Result<(), StoreError> {
        let Some(holder) = Self::find_by_name(conn, event_id, name)? else {
            return Ok(());
        };
        if &holder.id == taker {
            return Ok(());
        }
        let parked = format!("{name} ({})", holder.id);
        warn!(room = name, holder = %holder.id, parked = %parked, "room name taken over by guid");
        conn.execute(
            "UPDATE rooms SET name = ?1 WHERE id = ?2",
            [parked.as_str(), holder.id.as_str()],
        )?;
        Ok(())
    }

    pub fn list(conn: &Connection, event_id: &EventId) -> Result<Vec<RoomRow>, StoreError> {
        let mut stmt = conn.prepare(
            "SELECT id, event_id, name, guid FROM rooms WHERE event_id = ?1 ORDER BY name",
        )?;
        let rows = stmt
            .query_map([event_id.as_str()], row_to_room)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

fn row_to_room(row: &rusqlite::Row<'_>) -> rusqlite::Result<RoomRow> {
    Ok(RoomRow {
        id: RoomId::from_raw(row.get::<_, String>(0)?),
        event_id: EventId::from_raw(row.get::<_, String>(1)?),
        name: row.get(2)?,
        guid: row.get(3)?,
    })
}
