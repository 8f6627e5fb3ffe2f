//! Queue of refresh requests made in asynchronous mode.
//!
//! The CLI enqueues, the periodic trigger claims and runs them.

use serde::{Deserialize, Serialize};
use tracing::instrument;

use downstream_core::ids::JobId;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Done,
    Failed,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Done => write!(f, "done"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRow {
    pub id: JobId,
    pub event_slug: String,
    pub status: JobStatus,
    pub error: Option<String>,
    pub enqueued_at: String,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
}

const JOB_COLUMNS: &str = "id, event_slug, status, error, enqueued_at, started_at, finished_at";

pub struct JobRepo {
    db: Database,
}

impl JobRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self))]
    pub fn enqueue(&self, event_slug: &str) -> Result<JobRow, StoreError> {
        let id = JobId::new();
        let now = row_helpers::now_timestamp();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO refresh_jobs (id, event_slug, status, enqueued_at) VALUES (?1, ?2, 'pending', ?3)",
                [id.as_str(), event_slug, now.as_str()],
            )?;
            Ok(JobRow {
                id,
                event_slug: event_slug.to_string(),
                status: JobStatus::Pending,
                error: None,
                enqueued_at: now,
                started_at: None,
                finished_at: None,
            })
        })
    }

    /// Mark the oldest pending job running and return it.
    #[instrument(skip(self))]
    pub fn claim_next(&self) -> Result<Option<JobRow>, StoreError> {
        let now = row_helpers::now_timestamp();
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "UPDATE refresh_jobs SET status = 'running', started_at = ?1
                 WHERE id = (
                     SELECT id FROM refresh_jobs WHERE status = 'pending'
                     ORDER BY enqueued_at, id LIMIT 1
                 )
                 RETURNING {JOB_COLUMNS}"
            ))?;
            let mut rows = stmt.query([now.as_str()])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_job(row)?)),
                None => Ok(None),
            }
        })
    }

    /// Record the outcome of a claimed job.
    #[instrument(skip(self, outcome), fields(job_id = %id))]
    pub fn finish(&self, id: &JobId, outcome: Result<(), String>) -> Result<(), StoreError> {
        let (status, error) = match outcome {
            Ok(()) => (JobStatus::Done, None),
            Err(e) => (JobStatus::Failed, Some(e)),
        };
        self.db.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE refresh_jobs SET status = ?1, error = ?2, finished_at = ?3 WHERE id = ?4",
                rusqlite::params![
                    status.to_string(),
                    error,
                    row_helpers::now_timestamp(),
                    id.as_str()
                ],
            )?;
            if updated == 0 {
                return Err(StoreError::NotFound(format!("job {id}")));
            }
            Ok(())
        })
    }

    #[instrument(skip(self), fields(job_id = %id))]
    pub fn get(&self, id: &JobId) -> Result<JobRow, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt =
                conn.prepare(&format!("SELECT {JOB_COLUMNS} FROM refresh_jobs WHERE id = ?1"))?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_job(row),
                None => Err(StoreError::NotFound(format!("job {id}"))),
            }
        })
    }

    pub fn list_pending(&self) -> Result<Vec<JobRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {JOB_COLUMNS} FROM refresh_jobs WHERE status = 'pending' ORDER BY enqueued_at, id"
            ))?;
            let mut rows = stmt.query([])?;
            let mut jobs = Vec::new();
            while let Some(row) = rows.next()? {
                jobs.push(row_to_job(row)?);
            }
            Ok(jobs)
        })
    }
}

fn row_to_job(row: &rusqlite::Row<'_>) -> Result<JobRow, StoreError> {
    let status: String = row.get(2)?;
    Ok(JobRow {
        id: JobId::from_raw(row.get::<_, String>(0)?),
        event_slug: row.get(1)?,
        status: row_helpers::parse_enum(&status, "refresh_jobs", "status")?,
        error: row.get(3)?,
        enqueued_at: row.get(4)?,
        started_at: row.get(5)?,
        finished_at: row.get(6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo() -> JobRepo {
        JobRepo::new(Database::in_memory().unwrap())
    }

    #[test]
    fn claim_in_enqueue_order() {
        let repo = repo();
        let first = repo.enqueue("a").unwrap();
        let second = repo.enqueue("b").unwrap();
        assert_eq!(repo.list_pending().unwrap().len(), 2);

        let claimed = repo.claim_next().unwrap().unwrap();
        assert_eq!(claimed.id, first.id);
        assert_eq!(claimed.status, JobStatus::Running);
        assert!(claimed.started_at.is_some());

        assert_eq!(repo.claim_next().unwrap().unwrap().id, second.id);
        assert!(repo.claim_next().unwrap().is_none());
    }

    #[test]
    fn finish_records_outcome() {
        let repo = repo();
        let ok = repo.enqueue("a").unwrap();
        let bad = repo.enqueue("b").unwrap();
        repo.claim_next().unwrap();
        repo.claim_next().unwrap();

        repo.finish(&ok.id, Ok(())).unwrap();
        repo.finish(&bad.id, Err("could not retrieve schedule: HTTP 500".into())).unwrap();

        let ok = repo.get(&ok.id).unwrap();
        assert_eq!(ok.status, JobStatus::Done);
        assert!(ok.error.is_none());
        assert!(ok.finished_at.is_some());

        let bad = repo.get(&bad.id).unwrap();
        assert_eq!(bad.status, JobStatus::Failed);
        assert_eq!(bad.error.as_deref(), Some("could not retrieve schedule: HTTP 500"));
    }

    #[test]
    fn finish_unknown_job_is_not_found() {
        let err = repo().finish(&JobId::new(), Ok(())).unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn status_roundtrip() {
        for status in [JobStatus::Pending, JobStatus::Running, JobStatus::Done, JobStatus::Failed] {
            assert_eq!(status.to_string().parse::<JobStatus>().unwrap(), status);
        }
        assert!("stuck".parse::<JobStatus>().is_err());
    }
}
