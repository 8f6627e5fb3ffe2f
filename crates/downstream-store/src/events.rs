use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::OptionalExtension;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use downstream_core::config::{CheckingTime, EventConfig};
use downstream_core::ids::EventId;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// A host event schedules are imported into, with its downstream settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventRow {
    pub id: EventId,
    pub slug: String,
    pub name: String,
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
    pub config: EventConfig,
    pub created_at: String,
}

impl EventRow {
    pub fn dates(&self) -> Option<(NaiveDate, NaiveDate)> {
        self.date_from.zip(self.date_to)
    }
}

const EVENT_COLUMNS: &str = "id, slug, name, date_from, date_to, upstream_url, interval_minutes,
     checking_time, discard_after, last_sync, created_at";

pub struct EventRepo {
    db: Database,
}

impl EventRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Register an event with default downstream settings.
    #[instrument(skip(self, name))]
    pub fn create(
        &self,
        slug: &str,
        name: &str,
        date_from: Option<NaiveDate>,
        date_to: Option<NaiveDate>,
    ) -> Result<EventRow, StoreError> {
        let id = EventId::new();
        let now = row_helpers::now_timestamp();
        let config = EventConfig::default();

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO events (id, slug, name, date_from, date_to, interval_minutes, checking_time, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                rusqlite::params![
                    id.as_str(),
                    slug,
                    name,
                    date_from.map(|d| d.to_string()),
                    date_to.map(|d| d.to_string()),
                    config.interval_minutes,
                    config.checking_time.to_string(),
                    now,
                ],
            )
            .map_err(|e| match StoreError::from(e) {
                StoreError::Conflict(_) => StoreError::Conflict(format!("event {slug} already exists")),
                other => other,
            })?;

            Ok(EventRow {
                id,
                slug: slug.to_string(),
                name: name.to_string(),
                date_from,
                date_to,
                config,
                created_at: now,
            })
        })
    }

    #[instrument(skip(self))]
    pub fn get_by_slug(&self, slug: &str) -> Result<EventRow, StoreError> {
        self.db.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {EVENT_COLUMNS} FROM events WHERE slug = ?1"),
                [slug],
                |row| Ok(row_to_event(row)),
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("event {slug}")))?
        })
    }

    /// List all events, oldest first.
    #[instrument(skip(self))]
    pub fn list(&self) -> Result<Vec<EventRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt =
                conn.prepare(&format!("SELECT {EVENT_COLUMNS} FROM events ORDER BY created_at, id"))?;
            let mut rows = stmt.query([])?;
            let mut events = Vec::new();
            while let Some(row) = rows.next()? {
                events.push(row_to_event(row)?);
            }
            Ok(events)
        })
    }

    /// Persist the operator-editable settings. `last_sync` is left alone;
    /// only [`EventRepo::set_last_sync`] writes it.
    #[instrument(skip(self, config), fields(event_id = %id))]
    pub fn save_config(&self, id: &EventId, config: &EventConfig) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE events SET upstream_url = ?1, interval_minutes = ?2, checking_time = ?3, discard_after = ?4
                 WHERE id = ?5",
                rusqlite::params![
                    config.upstream_url,
                    config.interval_minutes,
                    config.checking_time.to_string(),
                    config.discard_after,
                    id.as_str(),
                ],
            )?;
            if updated == 0 {
                return Err(StoreError::NotFound(format!("event {id}")));
            }
            Ok(())
        })
    }

    #[instrument(skip(self), fields(event_id = %id))]
    pub fn set_last_sync(&self, id: &EventId, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE events SET last_sync = ?1 WHERE id = ?2",
                rusqlite::params![row_helpers::timestamp(at), id.as_str()],
            )?;
            Ok(())
        })
    }
}

fn row_to_event(row: &rusqlite::Row<'_>) -> Result<EventRow, StoreError> {
    let date_from: Option<String> = row.get(3)?;
    let date_to: Option<String> = row.get(4)?;
    let checking_time: String = row.get(7)?;
    let last_sync: Option<String> = row.get(9)?;

    Ok(EventRow {
        id: EventId::from_raw(row.get::<_, String>(0)?),
        slug: row.get(1)?,
        name: row.get(2)?,
        date_from: date_from
            .map(|d| row_helpers::parse_date(&d, "events", "date_from"))
            .transpose()?,
        date_to: date_to
            .map(|d| row_helpers::parse_date(&d, "events", "date_to"))
            .transpose()?,
        config: EventConfig {
            upstream_url: row.get(5)?,
            interval_minutes: row.get(6)?,
            checking_time: row_helpers::parse_enum::<CheckingTime>(
                &checking_time,
                "events",
                "checking_time",
            )?,
            discard_after: row.get(8)?,
            last_sync: last_sync
                .map(|t| row_helpers::parse_timestamp(&t, "events", "last_sync"))
                .transpose()?,
        },
        created_at: row.get(10)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn repo() -> EventRepo {
        EventRepo::new(Database::in_memory().unwrap())
    }

    #[test]
    fn create_and_fetch_by_slug() {
        let repo = repo();
        let created = repo
            .create("democon", "DemoCon", NaiveDate::from_ymd_opt(2024, 1, 15), NaiveDate::from_ymd_opt(2024, 1, 17))
            .unwrap();
        let fetched = repo.get_by_slug("democon").unwrap();
        assert_eq!(fetched.id, created.id);
        assert_eq!(fetched.config, EventConfig::default());
        assert!(fetched.dates().is_some());
    }

    #[test]
    fn duplicate_slug_conflicts() {
        let repo = repo();
        repo.create("democon", "DemoCon", None, None).unwrap();
        let err = repo.create("democon", "Again", None, None).unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)), "got {err:?}");
    }

    #[test]
    fn unknown_slug_is_not_found() {
        assert!(matches!(repo().get_by_slug("nope"), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn save_config_keeps_last_sync() {
        let repo = repo();
        let event = repo.create("democon", "DemoCon", None, None).unwrap();
        let synced = Utc.with_ymd_and_hms(2024, 1, 15, 10, 0, 0).unwrap();
        repo.set_last_sync(&event.id, synced).unwrap();

        let config = EventConfig {
            upstream_url: Some("https://example.com/schedule.xml".into()),
            interval_minutes: 10,
            checking_time: CheckingTime::Always,
            discard_after: Some("-".into()),
            last_sync: None,
        };
        repo.save_config(&event.id, &config).unwrap();

        let stored = repo.get_by_slug("democon").unwrap().config;
        assert_eq!(stored.upstream_url.as_deref(), Some("https://example.com/schedule.xml"));
        assert_eq!(stored.interval_minutes, 10);
        assert_eq!(stored.checking_time, CheckingTime::Always);
        assert_eq!(stored.discard_after.as_deref(), Some("-"));
        assert_eq!(stored.last_sync, Some(synced));
    }

    #[test]
    fn list_returns_all_events() {
        let repo = repo();
        repo.create("a", "A", None, None).unwrap();
        repo.create("b", "B", None, None).unwrap();
        let slugs: Vec<_> = repo.list().unwrap().into_iter().map(|e| e.slug).collect();
        assert_eq!(slugs, vec!["a", "b"]);
    }
}
