use std::path::Path;
use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::field::{Field, Visit};
use tracing::span;
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

/// A persisted warning or error of the import pipeline.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogRecord {
    pub id: i64,
    pub timestamp: String,
    pub level: String,
    pub target: String,
    pub message: String,
    /// Remaining structured fields as a JSON object.
    pub fields: Option<String>,
    /// Slug of the event the record belongs to.
    pub event: Option<String>,
    /// External code of the session being reconciled.
    pub code: Option<String>,
    pub snapshot_id: Option<String>,
}

/// Query parameters for searching persisted logs. Unset filters match all.
#[derive(Clone, Debug, Default)]
pub struct LogQuery {
    pub level: Option<String>,
    /// Substring of the target module path.
    pub target: Option<String>,
    pub event: Option<String>,
    pub code: Option<String>,
    pub snapshot_id: Option<String>,
    /// RFC 3339 lower bound, inclusive.
    pub since: Option<String>,
    pub limit: Option<u32>,
}

/// Pipeline fields pulled out of a record into their own columns. A record
/// inherits each one it lacks from the closest span that has it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
struct PipelineContext {
    event: Option<String>,
    code: Option<String>,
    snapshot_id: Option<String>,
}

impl PipelineContext {
    fn set(&mut self, name: &str, value: String) -> bool {
        let slot = match name {
            "event" => &mut self.event,
            "code" => &mut self.code,
            "snapshot_id" => &mut self.snapshot_id,
            _ => return false,
        };
        *slot = Some(value);
        true
    }

    fn fill_from(&mut self, outer: &PipelineContext) {
        for (mine, theirs) in [
            (&mut self.event, &outer.event),
            (&mut self.code, &outer.code),
            (&mut self.snapshot_id, &outer.snapshot_id),
        ] {
            if mine.is_none() {
                mine.clone_from(theirs);
            }
        }
    }

    fn is_empty(&self) -> bool {
        self.event.is_none() && self.code.is_none() && self.snapshot_id.is_none()
    }
}

/// SQLite sink for warn+ records.
pub struct SqliteLogSink {
    conn: Mutex<Connection>,
}

impl SqliteLogSink {
    pub fn new(db_path: &Path) -> Result<Self, rusqlite::Error> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             CREATE TABLE IF NOT EXISTS pipeline_logs (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 timestamp TEXT NOT NULL,
                 level TEXT NOT NULL,
                 target TEXT NOT NULL,
                 message TEXT NOT NULL,
                 fields TEXT,
                 event TEXT,
                 code TEXT,
                 snapshot_id TEXT
             );
             CREATE INDEX IF NOT EXISTS idx_pipeline_logs_event ON pipeline_logs(event, timestamp);
             CREATE INDEX IF NOT EXISTS idx_pipeline_logs_code ON pipeline_logs(code);
             CREATE INDEX IF NOT EXISTS idx_pipeline_logs_snapshot ON pipeline_logs(snapshot_id);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn insert(&self, record: &PendingRecord) {
        let conn = self.conn.lock();
        // A failed log write has nowhere to be reported.
        let _ = conn.execute(
            "INSERT INTO pipeline_logs
                 (timestamp, level, target, message, fields, event, code, snapshot_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            rusqlite::params![
                record.timestamp,
                record.level,
                record.target,
                record.message,
                record.fields,
                record.context.event,
                record.context.code,
                record.context.snapshot_id,
            ],
        );
    }

    /// Newest records first.
    pub fn query(&self, q: &LogQuery) -> Result<Vec<LogRecord>, rusqlite::Error> {
        let mut filters: Vec<(&str, String)> = Vec::new();
        if let Some(level) = &q.level {
            filters.push(("level = ?", level.to_uppercase()));
        }
        if let Some(target) = &q.target {
            filters.push(("target LIKE ?", format!("%{target}%")));
        }
        for (column, value) in [
            ("event = ?", &q.event),
            ("code = ?", &q.code),
            ("snapshot_id = ?", &q.snapshot_id),
            ("timestamp >= ?", &q.since),
        ] {
            if let Some(value) = value {
                filters.push((column, value.clone()));
            }
        }

        let mut sql = String::from(
            "SELECT id, timestamp, level, target, message, fields, event, code, snapshot_id
             FROM pipeline_logs",
        );
        for (i, (clause, _)) in filters.iter().enumerate() {
            sql.push_str(if i == 0 { " WHERE " } else { " AND " });
            sql.push_str(clause);
        }
        sql.push_str(&format!(" ORDER BY id DESC LIMIT {}", q.limit.unwrap_or(100)));

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let params = rusqlite::params_from_iter(filters.iter().map(|(_, value)| value));
        let rows = stmt.query_map(params, |row| {
            Ok(LogRecord {
                id: row.get(0)?,
                timestamp: row.get(1)?,
                level: row.get(2)?,
                target: row.get(3)?,
                message: row.get(4)?,
                fields: row.get(5)?,
                event: row.get(6)?,
                code: row.get(7)?,
                snapshot_id: row.get(8)?,
            })
        })?;
        rows.collect()
    }

    pub fn count(&self) -> Result<i64, rusqlite::Error> {
        let conn = self.conn.lock();
        conn.query_row("SELECT COUNT(*) FROM pipeline_logs", [], |row| row.get(0))
    }
}

struct PendingRecord {
    timestamp: String,
    level: String,
    target: String,
    message: String,
    fields: Option<String>,
    context: PipelineContext,
}

/// tracing layer that writes warn+ records to a [`SqliteLogSink`].
pub struct SqliteLogLayer {
    sink: Arc<SqliteLogSink>,
}

impl SqliteLogLayer {
    pub fn new(sink: Arc<SqliteLogSink>) -> Self {
        Self { sink }
    }
}

#[derive(Default)]
struct FieldVisitor {
    message: Option<String>,
    fields: serde_json::Map<String, serde_json::Value>,
    context: PipelineContext,
}

impl FieldVisitor {
    fn text(&mut self, field: &Field, value: String) {
        let name = field.name();
        if name == "message" {
            self.message = Some(value);
        } else if !self.context.set(name, value.clone()) {
            self.fields.insert(name.to_string(), serde_json::Value::String(value));
        }
    }
}

impl Visit for FieldVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        // `%value` fields arrive here already formatted; `?value` strings keep quotes.
        self.text(field, format!("{value:?}").trim_matches('"').to_string());
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.text(field, value.to_string());
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.fields
            .insert(field.name().to_string(), serde_json::Value::Number(value.into()));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.fields
            .insert(field.name().to_string(), serde_json::Value::Number(value.into()));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.fields
            .insert(field.name().to_string(), serde_json::Value::Bool(value));
    }
}

impl<S> Layer<S> for SqliteLogLayer
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    fn on_event(&self, event: &tracing::Event<'_>, ctx: Context<'_, S>) {
        let level = *event.metadata().level();
        if level > tracing::Level::WARN {
            return;
        }

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        if let Some(scope) = ctx.event_scope(event) {
            for span in scope {
                if let Some(outer) = span.extensions().get::<PipelineContext>() {
                    visitor.context.fill_from(outer);
                }
            }
        }

        let fields = if visitor.fields.is_empty() {
            None
        } else {
            serde_json::to_string(&visitor.fields).ok()
        };

        self.sink.insert(&PendingRecord {
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
            level: level.to_string(),
            target: event.metadata().target().to_string(),
            message: visitor.message.unwrap_or_default(),
            fields,
            context: visitor.context,
        });
    }

    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let mut visitor = FieldVisitor::default();
        attrs.record(&mut visitor);
        if visitor.context.is_empty() {
            return;
        }
        if let Some(span) = ctx.span(id) {
            span.extensions_mut().insert(visitor.context);
        }
    }

    fn on_record(&self, id: &span::Id, values: &span::Record<'_>, ctx: Context<'_, S>) {
        let mut visitor = FieldVisitor::default();
        values.record(&mut visitor);
        if visitor.context.is_empty() {
            return;
        }
        let Some(span) = ctx.span(id) else { return };
        let mut extensions = span.extensions_mut();
        match extensions.get_mut::<PipelineContext>() {
            Some(existing) => {
                let mut merged = visitor.context;
                merged.fill_from(existing);
                *existing = merged;
            }
            None => extensions.insert(visitor.context),
        }
    }
}
