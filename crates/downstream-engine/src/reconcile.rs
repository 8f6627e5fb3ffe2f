//! Upsert a parsed schedule into an event's persistent store.
//!
//! Entities are keyed by their stable upstream identifiers: rooms by GUID or
//! name, submissions by code, speakers by a handle derived from their name.
//! Only submissions that existed before the pass are diffed.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;
use rusqlite::Connection;
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument};
use unicode_normalization::UnicodeNormalization;

use downstream_core::changes::{ChangeReport, TrackedField};
use downstream_core::ids::{EventId, TrackId};
use downstream_core::schedule::{ScheduleDocument, Session};
use downstream_store::events::EventRow;
use downstream_store::rooms::{RoomRepo, RoomRow};
use downstream_store::row_helpers;
use downstream_store::schedules::{PublishedSchedule, ScheduleRepo};
use downstream_store::session_types::{SessionTypeRepo, SessionTypeRow};
use downstream_store::speakers::{SpeakerRepo, SpeakerRow};
use downstream_store::submissions::{SubmissionFields, SubmissionRepo, SubmissionRow};
use downstream_store::tracks::TrackRepo;
use downstream_store::{Database, StoreError};

const LOCAL_DOMAIN: &str = "localhost";

/// Import `doc` into `event` in one transaction.
///
/// With `release_new_version`, the current slots are frozen afterwards as a
/// published schedule labelled with the document version, cut at the event's
/// `discard_after` marker. No schedule is returned when that label was
/// released before.
#[instrument(skip_all, fields(event = %event.slug, version = %doc.version))]
pub fn reconcile(
    db: &Database,
    event: &EventRow,
    doc: &ScheduleDocument,
    release_new_version: bool,
) -> Result<(ChangeReport, Option<PublishedSchedule>), StoreError> {
    db.with_transaction(|conn| {
        let mut pass = Pass::new(conn, &event.id);
        let mut changes = ChangeReport::new();

        for room in doc.rooms() {
            pass.room(&room.name, room.guid.as_deref())?;
        }
        for (room, session) in doc.sessions() {
            let room = pass.room(&room.name, room.guid.as_deref())?;
            pass.session(session, &room, &mut changes)?;
        }

        let schedule = if release_new_version {
            let label = doc.version_label(event.config.discard_after());
            ScheduleRepo::freeze(conn, &event.id, &label)?
        } else {
            None
        };

        info!(
            sessions = doc.sessions().count(),
            changed = changes.changed().count(),
            released = schedule.is_some(),
            "schedule reconciled"
        );
        Ok((changes, schedule))
    })
}

/// Lookup caches for one reconciliation pass.
struct Pass<'a> {
    conn: &'a Connection,
    event_id: &'a EventId,
    rooms: HashMap<String, RoomRow>,
    tracks: HashMap<String, TrackId>,
    session_types: HashMap<(String, i64), SessionTypeRow>,
}

impl<'a> Pass<'a> {
    fn new(conn: &'a Connection, event_id: &'a EventId) -> Self {
        Self {
            conn,
            event_id,
            rooms: HashMap::new(),
            tracks: HashMap::new(),
            session_types: HashMap::new(),
        }
    }

    fn room(&mut self, name: &str, guid: Option<&str>) -> Result<RoomRow, StoreError> {
        if let Some(room) = self.rooms.get(name) {
            return Ok(room.clone());
        }
        let room = RoomRepo::upsert(self.conn, self.event_id, name, guid)?;
        self.rooms.insert(name.to_string(), room.clone());
        Ok(room)
    }

    fn track(&mut self, name: &str) -> Result<TrackId, StoreError> {
        if let Some(id) = self.tracks.get(name) {
            return Ok(id.clone());
        }
        let track = TrackRepo::get_or_create(self.conn, self.event_id, name)?;
        self.tracks.insert(name.to_string(), track.id.clone());
        Ok(track.id)
    }

    fn session_type(&mut self, name: &str, duration: i64) -> Result<SessionTypeRow, StoreError> {
        let key = (name.to_string(), duration);
        if let Some(row) = self.session_types.get(&key) {
            return Ok(row.clone());
        }
        let row = SessionTypeRepo::get_or_create(self.conn, self.event_id, name, duration)?;
        self.session_types.insert(key, row.clone());
        Ok(row)
    }

    #[instrument(level = "debug", skip_all, fields(code = %session.code))]
    fn session(
        &mut self,
        session: &Session,
        room: &RoomRow,
        changes: &mut ChangeReport,
    ) -> Result<(), StoreError> {
        let speakers = session
            .persons
            .iter()
            .map(|name| create_speaker(self.conn, self.event_id, name))
            .collect::<Result<Vec<_>, _>>()?;

        let track_id = session.track.as_deref().map(|t| self.track(t)).transpose()?;
        let session_type = self.session_type(&session.session_type, session.duration_minutes)?;
        let fields = SubmissionFields {
            guid: session.guid.clone(),
            title: session.title.clone(),
            description: session.description.clone(),
            abstract_text: session.abstract_text.clone(),
            track_id,
            session_type_id: session_type.id,
            language: session.language.clone(),
            do_not_record: session.do_not_record,
        };

        let id = match SubmissionRepo::find_by_code(self.conn, self.event_id, &session.code)? {
            Some(existing) => {
                diff(&existing, session, &room.name, changes);
                SubmissionRepo::update(self.conn, &existing.id, &fields)?;
                existing.id
            }
            None => {
                debug!(code = %session.code, "new submission");
                SubmissionRepo::insert(self.conn, self.event_id, &session.code, &fields)?
            }
        };

        for speaker in &speakers {
            SpeakerRepo::attach(self.conn, &id, &speaker.id)?;
        }
        SubmissionRepo::upsert_slot(self.conn, &id, &room.id, session.start, session.end)
    }
}

/// Record every tracked field of `existing` that `session` changes.
fn diff(existing: &SubmissionRow, session: &Session, room: &str, changes: &mut ChangeReport) {
    let code = session.code.as_str();
    changes.touch(code);

    let slot = existing.slot.as_ref();
    let old_start = slot.map(|s| row_helpers::format_slot_time(s.start));
    let old_end = slot.map(|s| row_helpers::format_slot_time(s.end));

    let pairs = [
        (TrackedField::Title, Some(existing.title.clone()), Some(session.title.clone())),
        (
            TrackedField::Description,
            Some(existing.description.clone()),
            Some(session.description.clone()),
        ),
        (
            TrackedField::Abstract,
            Some(existing.abstract_text.clone()),
            Some(session.abstract_text.clone()),
        ),
        (TrackedField::Track, existing.track.clone(), session.track.clone()),
        (
            TrackedField::SessionType,
            Some(existing.session_type.clone()),
            Some(session.session_type.clone()),
        ),
        (
            TrackedField::Language,
            Some(existing.language.clone()),
            Some(session.language.clone()),
        ),
        (
            TrackedField::DoNotRecord,
            Some(existing.do_not_record.to_string()),
            Some(session.do_not_record.to_string()),
        ),
        (TrackedField::Room, slot.map(|s| s.room.clone()), Some(room.to_string())),
        (
            TrackedField::Start,
            old_start,
            Some(row_helpers::format_slot_time(session.start)),
        ),
        (
            TrackedField::End,
            old_end,
            Some(row_helpers::format_slot_time(session.end)),
        ),
    ];

    for (field, old, new) in pairs {
        if old != new {
            debug!(code, field = %field, "field changed");
            changes.record(code, field, old, new);
        }
    }
}

/// Get or create the local account and event profile for a speaker name.
pub fn create_speaker(
    conn: &Connection,
    event_id: &EventId,
    name: &str,
) -> Result<SpeakerRow, StoreError> {
    SpeakerRepo::get_or_create(conn, event_id, &speaker_handle(name), name.trim())
}

/// Synthetic local handle for a speaker name, `<slug>@localhost`.
///
/// Case, whitespace and accent variants of one name map to the same handle.
pub fn speaker_handle(name: &str) -> String {
    let slug = slugify(name);
    if slug.is_empty() {
        let digest = format!("{:x}", Sha256::digest(name.trim().to_lowercase().as_bytes()));
        format!("speaker-{}@{LOCAL_DOMAIN}", &digest[..12])
    } else {
        format!("{slug}@{LOCAL_DOMAIN}")
    }
}

fn re_non_word() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^\w\s-]").unwrap())
}

fn re_separators() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[-\s]+").unwrap())
}

fn slugify(value: &str) -> String {
    let ascii: String = value.nfkd().filter(char::is_ascii).collect();
    let cleaned = re_non_word().replace_all(&ascii, "").to_lowercase();
    re_separators()
        .replace_all(cleaned.trim(), "-")
        .trim_matches(|c| c == '-' || c == '_')
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frab::{self, tests::SAMPLE_XML};
    use downstream_store::events::EventRepo;

    fn setup() -> (Database, EventRow) {
        let db = Database::in_memory().unwrap();
        let event = EventRepo::new(db.clone()).create("democon", "DemoCon", None, None).unwrap();
        (db, event)
    }

    fn sample() -> ScheduleDocument {
        frab::parse_bytes(SAMPLE_XML.as_bytes()).unwrap()
    }

    #[test]
    fn slugs() {
        assert_eq!(slugify("Alice Speaker"), "alice-speaker");
        assert_eq!(slugify("  ALICE   speaker "), "alice-speaker");
        assert_eq!(slugify("Zoë Ñandú"), "zoe-nandu");
        assert_eq!(slugify("O'Brien, Pat"), "obrien-pat");
        assert_eq!(slugify("李"), "");
    }

    #[test]
    fn handles_fall_back_for_unsluggable_names() {
        assert_eq!(speaker_handle("Alice Speaker"), "alice-speaker@localhost");
        let fallback = speaker_handle("李");
        assert!(fallback.starts_with("speaker-") && fallback.ends_with("@localhost"));
        assert_eq!(fallback, speaker_handle(" 李 "));
        assert_ne!(fallback, speaker_handle("王"));
    }

    #[test]
    fn speaker_variants_collide() {
        let (db, event) = setup();
        db.with_conn(|conn| {
            let a = create_speaker(conn, &event.id, "Alice Speaker")?;
            let b = create_speaker(conn, &event.id, "alice speaker")?;
            let c = create_speaker(conn, &event.id, "  Alice   Speaker ")?;
            assert_eq!(a.id, b.id);
            assert_eq!(a.id, c.id);
            assert_eq!(c.name, "Alice Speaker");
            assert_eq!(SpeakerRepo::list(conn, &event.id)?.len(), 1);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn first_import_creates_everything() {
        let (db, event) = setup();
        let (changes, schedule) = reconcile(&db, &event, &sample(), true).unwrap();

        assert!(changes.is_empty());
        let schedule = schedule.unwrap();
        assert_eq!(schedule.version, "1.0");
        assert_eq!(schedule.slots.len(), 1);

        db.with_conn(|conn| {
            let sub = SubmissionRepo::find_by_code(conn, &event.id, "AAAAAA")?.unwrap();
            assert_eq!(sub.title, "Opening Talk");
            assert_eq!(sub.track.as_deref(), Some("General"));
            assert_eq!(sub.slot.unwrap().room, "Main Hall");
            let speakers = SpeakerRepo::for_submission(conn, &sub.id)?;
            assert_eq!(speakers.len(), 1);
            assert_eq!(speakers[0].name, "Alice Speaker");
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn reimport_reports_field_changes() {
        let (db, event) = setup();
        reconcile(&db, &event, &sample(), false).unwrap();

        let mut updated = sample();
        updated.days[0].rooms[0].sessions[0].title = "Updated Talk".into();
        let (changes, schedule) = reconcile(&db, &event, &updated, false).unwrap();

        assert!(schedule.is_none());
        assert_eq!(changes.len(), 1);
        let fields = changes.get("AAAAAA").unwrap();
        assert_eq!(fields.len(), 1);
        let title = &fields[&TrackedField::Title];
        assert_eq!(title.old.as_deref(), Some("Opening Talk"));
        assert_eq!(title.new.as_deref(), Some("Updated Talk"));
    }

    #[test]
    fn unchanged_reimport_has_empty_entry() {
        let (db, event) = setup();
        reconcile(&db, &event, &sample(), false).unwrap();
        let (changes, _) = reconcile(&db, &event, &sample(), false).unwrap();
        assert!(changes.contains("AAAAAA"));
        assert_eq!(changes.total_changes(), 0);
    }

    #[test]
    fn moved_session_reports_room_and_times() {
        let (db, event) = setup();
        reconcile(&db, &event, &sample(), false).unwrap();

        let mut moved = sample();
        moved.days[0].rooms[0].name = "Side Room".into();
        moved.days[0].rooms[0].sessions[0].start += chrono::Duration::hours(1);
        let (changes, _) = reconcile(&db, &event, &moved, false).unwrap();

        let fields = changes.get("AAAAAA").unwrap();
        assert_eq!(fields[&TrackedField::Room].new.as_deref(), Some("Side Room"));
        assert_eq!(fields[&TrackedField::Start].old.as_deref(), Some("2024-01-15T10:00:00"));
        assert_eq!(fields[&TrackedField::End].new.as_deref(), Some("2024-01-15T11:30:00"));
        assert!(!fields.contains_key(&TrackedField::Title));
    }

    #[test]
    fn dropped_track_is_a_change_to_none() {
        let (db, event) = setup();
        reconcile(&db, &event, &sample(), false).unwrap();
        let mut untracked = sample();
        untracked.days[0].rooms[0].sessions[0].track = None;
        let (changes, _) = reconcile(&db, &event, &untracked, false).unwrap();
        let track = &changes.get("AAAAAA").unwrap()[&TrackedField::Track];
        assert_eq!(track.old.as_deref(), Some("General"));
        assert!(track.new.is_none());
    }

    #[test]
    fn discard_after_truncates_version() {
        let (db, mut event) = setup();
        event.config.discard_after = Some("-".into());
        let mut doc = sample();
        doc.version = "1.0-beta1".into();
        let (_, schedule) = reconcile(&db, &event, &doc, true).unwrap();
        assert_eq!(schedule.unwrap().version, "1.0");
    }

    #[test]
    fn repeated_version_is_not_released_twice() {
        let (db, event) = setup();
        assert!(reconcile(&db, &event, &sample(), true).unwrap().1.is_some());
        let mut updated = sample();
        updated.days[0].rooms[0].sessions[0].title = "Updated Talk".into();
        let (changes, schedule) = reconcile(&db, &event, &updated, true).unwrap();
        assert!(schedule.is_none());
        assert_eq!(changes.total_changes(), 1);
    }

    #[test]
    fn room_guid_survives_rename() {
        let (db, event) = setup();
        let mut doc = sample();
        doc.days[0].rooms[0].guid = Some("12345678-abcd-1234-abcd-123456789012".into());
        reconcile(&db, &event, &doc, false).unwrap();

        doc.days[0].rooms[0].name = "Great Hall".into();
        reconcile(&db, &event, &doc, false).unwrap();

        let rooms = db.with_conn(|conn| RoomRepo::list(conn, &event.id)).unwrap();
        assert_eq!(rooms.len(), 1);
        assert_eq!(rooms[0].name, "Great Hall");
    }

    #[test]
    fn guid_rooms_swapping_names_import_cleanly() {
        let (db, event) = setup();
        let mut doc = sample();
        let mut second = doc.days[0].rooms[0].clone();
        second.sessions[0].code = "BBBBBB".into();
        doc.days[0].rooms.push(second);
        for (room, (name, guid)) in doc.days[0].rooms.iter_mut().zip([("Hall A", "g-a"), ("Hall B", "g-b")]) {
            room.name = name.into();
            room.guid = Some(guid.into());
        }
        reconcile(&db, &event, &doc, false).unwrap();

        doc.days[0].rooms[0].name = "Hall B".into();
        doc.days[0].rooms[1].name = "Hall A".into();
        let (changes, _) = reconcile(&db, &event, &doc, false).unwrap();

        // Both sessions stayed in their rooms; only the rooms were renamed.
        assert!(changes.get("AAAAAA").unwrap().is_empty());
        assert!(changes.get("BBBBBB").unwrap().is_empty());

        let rooms = db.with_conn(|conn| RoomRepo::list(conn, &event.id)).unwrap();
        let names: Vec<_> = rooms.iter().map(|r| (r.name.as_str(), r.guid.as_deref())).collect();
        assert_eq!(names, vec![("Hall A", Some("g-b")), ("Hall B", Some("g-a"))]);
    }

    #[test]
    fn speakers_are_additive() {
        let (db, event) = setup();
        reconcile(&db, &event, &sample(), false).unwrap();
        let mut doc = sample();
        doc.days[0].rooms[0].sessions[0].persons = vec!["Bob Speaker".into()];
        reconcile(&db, &event, &doc, false).unwrap();

        let names: Vec<_> = db
            .with_conn(|conn| {
                let sub = SubmissionRepo::find_by_code(conn, &event.id, "AAAAAA")?.unwrap();
                SpeakerRepo::for_submission(conn, &sub.id)
            })
            .unwrap()
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(names, vec!["Alice Speaker", "Bob Speaker"]);
    }
}
