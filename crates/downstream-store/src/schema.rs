/// SQL DDL for the downstream database.
/// WAL mode + foreign keys enabled at connection time.
pub const SCHEMA_VERSION: u32 = 1;

pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS events (
    id TEXT PRIMARY KEY,
    slug TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL,
    date_from TEXT,
    date_to TEXT,
    upstream_url TEXT,
    interval_minutes INTEGER NOT NULL DEFAULT 15,
    checking_time TEXT NOT NULL DEFAULT 'event',
    discard_after TEXT,
    last_sync TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS schedules (
    id TEXT PRIMARY KEY,
    event_id TEXT NOT NULL REFERENCES events(id) ON DELETE CASCADE,
    version TEXT NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE (event_id, version)
);

CREATE TABLE IF NOT EXISTS upstream_snapshots (
    id TEXT PRIMARY KEY,
    event_id TEXT NOT NULL REFERENCES events(id) ON DELETE CASCADE,
    content TEXT,
    checksum TEXT,
    changes TEXT,
    schedule_id TEXT REFERENCES schedules(id) ON DELETE SET NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS rooms (
    id TEXT PRIMARY KEY,
    event_id TEXT NOT NULL REFERENCES events(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    guid TEXT,
    created_at TEXT NOT NULL,
    UNIQUE (event_id, name)
);

CREATE TABLE IF NOT EXISTS tracks (
    id TEXT PRIMARY KEY,
    event_id TEXT NOT NULL REFERENCES events(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    UNIQUE (event_id, name)
);

CREATE TABLE IF NOT EXISTS session_types (
    id TEXT PRIMARY KEY,
    event_id TEXT NOT NULL REFERENCES events(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    default_duration INTEGER NOT NULL,
    UNIQUE (event_id, name, default_duration)
);

CREATE TABLE IF NOT EXISTS users (
    id TEXT PRIMARY KEY,
    handle TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS speaker_profiles (
    id TEXT PRIMARY KEY,
    event_id TEXT NOT NULL REFERENCES events(id) ON DELETE CASCADE,
    user_id TEXT NOT NULL REFERENCES users(id),
    created_at TEXT NOT NULL,
    UNIQUE (event_id, user_id)
);

CREATE TABLE IF NOT EXISTS submissions (
    id TEXT PRIMARY KEY,
    event_id TEXT NOT NULL REFERENCES events(id) ON DELETE CASCADE,
    code TEXT NOT NULL,
    guid TEXT,
    title TEXT NOT NULL,
    description TEXT NOT NULL,
    abstract TEXT NOT NULL,
    track_id TEXT REFERENCES tracks(id),
    session_type_id TEXT NOT NULL REFERENCES session_types(id),
    language TEXT NOT NULL,
    do_not_record INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE (event_id, code)
);

CREATE TABLE IF NOT EXISTS submission_speakers (
    submission_id TEXT NOT NULL REFERENCES submissions(id) ON DELETE CASCADE,
    speaker_id TEXT NOT NULL REFERENCES speaker_profiles(id) ON DELETE CASCADE,
    PRIMARY KEY (submission_id, speaker_id)
);

CREATE TABLE IF NOT EXISTS slots (
    submission_id TEXT PRIMARY KEY REFERENCES submissions(id) ON DELETE CASCADE,
    room_id TEXT NOT NULL REFERENCES rooms(id),
    start_at TEXT NOT NULL,
    end_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS schedule_slots (
    schedule_id TEXT NOT NULL REFERENCES schedules(id) ON DELETE CASCADE,
    submission_code TEXT NOT NULL,
    title TEXT NOT NULL,
    room TEXT NOT NULL,
    start_at TEXT NOT NULL,
    end_at TEXT NOT NULL,
    PRIMARY KEY (schedule_id, submission_code)
);

CREATE TABLE IF NOT EXISTS refresh_jobs (
    id TEXT PRIMARY KEY,
    event_slug TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    error TEXT,
    enqueued_at TEXT NOT NULL,
    started_at TEXT,
    finished_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_snapshots_event_created ON upstream_snapshots(event_id, created_at);
CREATE UNIQUE INDEX IF NOT EXISTS idx_rooms_event_guid ON rooms(event_id, guid) WHERE guid IS NOT NULL;
CREATE INDEX IF NOT EXISTS idx_submissions_event ON submissions(event_id);
CREATE INDEX IF NOT EXISTS idx_schedules_event ON schedules(event_id);
CREATE INDEX IF NOT EXISTS idx_jobs_status ON refresh_jobs(status, enqueued_at);

CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);
"#;

pub const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;
PRAGMA busy_timeout = 5000;
PRAGMA synchronous = NORMAL;
"#;
