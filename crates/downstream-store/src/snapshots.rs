//! Content store for fetched upstream documents.
//!
//! Every fetch whose content differs from the previous one is kept verbatim
//! with its SHA-256 checksum. History is append-only per event; only
//! [`SnapshotRepo::prune`] removes rows, and it does so for good.

use rusqlite::OptionalExtension;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, instrument};

use downstream_core::changes::ChangeReport;
use downstream_core::ids::{EventId, ScheduleId, SnapshotId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: SnapshotId,
    pub event_id: EventId,
    pub content: Option<String>,
    pub checksum: Option<String>,
    pub changes: Option<ChangeReport>,
    pub schedule_id: Option<ScheduleId>,
    pub created_at: String,
}

/// Lowercase hex SHA-256 of `content`. No content, no checksum.
pub fn checksum(content: Option<&str>) -> Option<String> {
    content.map(|c| {
        let mut hasher = Sha256::new();
        hasher.update(c.as_bytes());
        format!("{:x}", hasher.finalize())
    })
}

const SNAPSHOT_COLUMNS: &str = "id, event_id, content, checksum, changes, schedule_id, created_at";

pub struct SnapshotRepo {
    db: Database,
}

impl SnapshotRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Append a snapshot for `event_id`.
    #[instrument(skip(self, content), fields(event_id = %event_id))]
    pub fn store(&self, event_id: &EventId, content: Option<&str>) -> Result<Snapshot, StoreError> {
        let id = SnapshotId::new();
        let checksum = checksum(content);
        let now = row_helpers::now_timestamp();

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO upstream_snapshots (id, event_id, content, checksum, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![id.as_str(), event_id.as_str(), content, checksum, now],
            )?;
            debug!(snapshot_id = %id, checksum = ?checksum, "snapshot stored");

            Ok(Snapshot {
                id,
                event_id: event_id.clone(),
                content: content.map(str::to_string),
                checksum,
                changes: None,
                schedule_id: None,
                created_at: now,
            })
        })
    }

    /// Most recent snapshot of the event, if any.
    #[instrument(skip(self), fields(event_id = %event_id))]
    pub fn latest(&self, event_id: &EventId) -> Result<Option<Snapshot>, StoreError> {
        self.db.with_conn(|conn| {
            conn.query_row(
                &format!(
                    "SELECT {SNAPSHOT_COLUMNS} FROM upstream_snapshots WHERE event_id = ?1
                     ORDER BY created_at DESC, id DESC LIMIT 1"
                ),
                [event_id.as_str()],
                |row| Ok(row_to_snapshot(row)),
            )
            .optional()?
            .transpose()
        })
    }

    /// All snapshots of the event, newest first.
    #[instrument(skip(self), fields(event_id = %event_id))]
    pub fn list(&self, event_id: &EventId) -> Result<Vec<Snapshot>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SNAPSHOT_COLUMNS} FROM upstream_snapshots WHERE event_id = ?1
                 ORDER BY created_at DESC, id DESC"
            ))?;
            let mut rows = stmt.query([event_id.as_str()])?;
            let mut snapshots = Vec::new();
            while let Some(row) = rows.next()? {
                snapshots.push(row_to_snapshot(row)?);
            }
            Ok(snapshots)
        })
    }

    /// Record what importing this snapshot produced.
    #[instrument(skip(self, changes), fields(snapshot_id = %id))]
    pub fn attach_result(
        &self,
        id: &SnapshotId,
        changes: &ChangeReport,
        schedule_id: Option<&ScheduleId>,
    ) -> Result<(), StoreError> {
        let changes = serde_json::to_string(changes)?;
        self.db.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE upstream_snapshots SET changes = ?1, schedule_id = ?2 WHERE id = ?3",
                rusqlite::params![changes, schedule_id.map(ScheduleId::as_str), id.as_str()],
            )?;
            if updated == 0 {
                return Err(StoreError::NotFound(format!("snapshot {id}")));
            }
            Ok(())
        })
    }

    /// Remove one snapshot whose import did not complete.
    #[instrument(skip(self), fields(snapshot_id = %id))]
    pub fn discard(&self, id: &SnapshotId) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let deleted = conn.execute("DELETE FROM upstream_snapshots WHERE id = ?1", [id.as_str()])?;
            if deleted == 0 {
                return Err(StoreError::NotFound(format!("snapshot {id}")));
            }
            Ok(())
        })
    }

    /// Delete all but the `keep` most recent snapshots. Returns the number deleted.
    #[instrument(skip(self), fields(event_id = %event_id))]
    pub fn prune(&self, event_id: &EventId, keep: usize) -> Result<usize, StoreError> {
        let keep = i64::try_from(keep).unwrap_or(i64::MAX);
        self.db.with_conn(|conn| {
            let deleted = conn.execute(
                "DELETE FROM upstream_snapshots
                 WHERE event_id = ?1 AND id NOT IN (
                     SELECT id FROM upstream_snapshots WHERE event_id = ?1
                     ORDER BY created_at DESC, id DESC LIMIT ?2
                 )",
                rusqlite::params![event_id.as_str(), keep],
            )?;
            if deleted > 0 {
                debug!(deleted, keep, "pruned snapshots");
            }
            Ok(deleted)
        })
    }
}

fn row_to_snapshot(row: &rusqlite::Row<'_>) -> Result<Snapshot, StoreError> {
    let changes: Option<String> = row.get(4)?;
    let changes = changes
        .map(|raw| {
            serde_json::from_str(&raw).map_err(|e| StoreError::CorruptRow {
                table: "upstream_snapshots",
                column: "changes",
                detail: format!("invalid JSON: {e}"),
            })
        })
        .transpose()?;

    Ok(Snapshot {
        id: SnapshotId::from_raw(row.get::<_, String>(0)?),
        event_id: EventId::from_raw(row.get::<_, String>(1)?),
        content: row.get(2)?,
        checksum: row.get(3)?,
        changes,
        schedule_id: row.get::<_, Option<String>>(5)?.map(ScheduleId::from_raw),
        created_at: row.get(6)?,
    })
}
