use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use downstream_core::ids::{EventId, SessionTypeId};

use crate::error::StoreError;

/// A kind of session ("Talk", "Workshop") with its default length.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionTypeRow {
    pub id: SessionTypeId,
    pub event_id: EventId,
    pub name: String,
    pub default_duration: i64,
}

pub struct SessionTypeRepo;

impl SessionTypeRepo {
    /// Session types are keyed by name and default duration in minutes, so a
    /// 30 minute talk and a 60 minute talk become two types.
    pub fn get_or_create(
        conn: &Connection,
        event_id: &EventId,
        name: &str,
        default_duration: i64,
    ) -> Result<SessionTypeRow, StoreError> {
        let existing = conn
            .query_row(
                "SELECT id FROM session_types WHERE event_id = ?1 AND name = ?2 AND default_duration = ?3",
                rusqlite::params![event_id.as_str(), name, default_duration],
                |row| row.get::<_, String>(0),
            )
            .optional()?;

        let id = match existing {
            Some(id) => SessionTypeId::from_raw(id),
            None => {
                let id = SessionTypeId::new();
                conn.execute(
                    "INSERT INTO session_types (id, event_id, name, default_duration) VALUES (?1, ?2, ?3, ?4)",
                    rusqlite::params![id.as_str(), event_id.as_str(), name, default_duration],
                )?;
                id
            }
        };

        Ok(SessionTypeRow {
            id,
            event_id: event_id.clone(),
            name: name.to_string(),
            default_duration,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use crate::events::EventRepo;

    #[test]
    fn keyed_by_name_and_duration() {
        let db = Database::in_memory().unwrap();
        let event = EventRepo::new(db.clone()).create("democon", "DemoCon", None, None).unwrap();
        db.with_conn(|conn| {
            let short = SessionTypeRepo::get_or_create(conn, &event.id, "Talk", 30)?;
            let again = SessionTypeRepo::get_or_create(conn, &event.id, "Talk", 30)?;
            let long = SessionTypeRepo::get_or_create(conn, &event.id, "Talk", 60)?;
            assert_eq!(short.id, again.id);
            assert_ne!(short.id, long.id);
            Ok(())
        })
        .unwrap();
    }
}
