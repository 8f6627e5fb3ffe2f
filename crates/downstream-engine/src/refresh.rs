use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn, Span};

use downstream_core::changes::ChangeReport;
use downstream_core::config::PipelineConfig;
use downstream_core::errors::PipelineError;
use downstream_core::ids::SnapshotId;
use downstream_core::schedule::ScheduleDocument;
use downstream_store::events::{EventRepo, EventRow};
use downstream_store::schedules::PublishedSchedule;
use downstream_store::snapshots::{self, SnapshotRepo};
use downstream_store::{Database, StoreError};

use crate::error::EngineError;
use crate::fetch::ScheduleFetcher;
use crate::frab;
use crate::reconcile::reconcile;

/// Result of one refresh.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RefreshOutcome {
    /// Upstream content matches the latest snapshot; nothing was touched.
    Unchanged,
    Imported {
        snapshot_id: SnapshotId,
        changes: ChangeReport,
        schedule: Option<PublishedSchedule>,
    },
}

/// Runs the fetch-diff-import pipeline for one event at a time per event.
pub struct RefreshOrchestrator {
    db: Database,
    fetcher: Arc<dyn ScheduleFetcher>,
    config: PipelineConfig,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl RefreshOrchestrator {
    pub fn new(db: Database, fetcher: Arc<dyn ScheduleFetcher>, config: PipelineConfig) -> Self {
        Self {
            db,
            fetcher,
            config,
            locks: DashMap::new(),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Refresh the event with `slug` from its upstream URL.
    ///
    /// Concurrent calls for one event run one after the other. Failures are
    /// returned as-is. A malformed document stays stored as the latest
    /// snapshot and is not re-parsed until upstream changes; a snapshot whose
    /// import failed is discarded so the next refresh tries again.
    #[instrument(skip(self), fields(event = %slug, snapshot_id = tracing::field::Empty))]
    pub async fn refresh(&self, slug: &str) -> Result<RefreshOutcome, EngineError> {
        let lock = self
            .locks
            .entry(slug.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        let event = self.resolve(slug)?;
        let url = event
            .config
            .upstream_url()
            .ok_or_else(PipelineError::missing_upstream_url)?;

        let document = self.fetcher.fetch(url).await?;
        let checksum = snapshots::checksum(Some(&document.text));

        let snapshot_repo = SnapshotRepo::new(self.db.clone());
        let previous = snapshot_repo.latest(&event.id)?;
        if previous.is_some_and(|p| p.checksum == checksum) {
            debug!("upstream unchanged");
            return Ok(RefreshOutcome::Unchanged);
        }

        let snapshot = snapshot_repo.store(&event.id, Some(&document.text))?;
        Span::current().record("snapshot_id", tracing::field::display(&snapshot.id));
        let parsed = frab::parse_bytes(&document.bytes).inspect_err(|e| {
            warn!(snapshot_id = %snapshot.id, error = %e, "stored snapshot is not a valid schedule");
        })?;

        let (changes, schedule) = match self.import(&event, parsed, &snapshot.id).await {
            Ok(imported) => imported,
            Err(e) => {
                // Unlike a malformed document, a failed import must not make
                // the next fetch look unchanged.
                warn!(snapshot_id = %snapshot.id, error = %e, "import failed, discarding snapshot");
                if let Err(discard) = snapshot_repo.discard(&snapshot.id) {
                    error!(snapshot_id = %snapshot.id, error = %discard, "failed to discard snapshot");
                }
                return Err(e);
            }
        };

        let events = EventRepo::new(self.db.clone());
        events.set_last_sync(&event.id, Utc::now())?;
        snapshot_repo.prune(&event.id, self.config.snapshot_retention)?;

        info!(
            snapshot_id = %snapshot.id,
            changed = changes.changed().count(),
            version = schedule.as_ref().map(|s| s.version.as_str()),
            "upstream schedule imported"
        );
        Ok(RefreshOutcome::Imported {
            snapshot_id: snapshot.id,
            changes,
            schedule,
        })
    }

    /// Reconcile on the blocking pool; the pass holds the connection lock
    /// for the whole transaction.
    async fn import(
        &self,
        event: &EventRow,
        parsed: ScheduleDocument,
        snapshot_id: &SnapshotId,
    ) -> Result<(ChangeReport, Option<PublishedSchedule>), EngineError> {
        let db = self.db.clone();
        let event = event.clone();
        let snapshot_id = snapshot_id.clone();
        let span = Span::current();
        let imported = tokio::task::spawn_blocking(move || {
            span.in_scope(|| -> Result<_, StoreError> {
                let (changes, schedule) = reconcile(&db, &event, &parsed, true)?;
                SnapshotRepo::new(db.clone()).attach_result(
                    &snapshot_id,
                    &changes,
                    schedule.as_ref().map(|s| &s.id),
                )?;
                Ok((changes, schedule))
            })
        })
        .await??;
        Ok(imported)
    }

    fn resolve(&self, slug: &str) -> Result<EventRow, EngineError> {
        EventRepo::new(self.db.clone())
            .get_by_slug(slug)
            .map_err(|e| match e {
                StoreError::NotFound(_) => EngineError::UnknownEvent(slug.to_string()),
                other => EngineError::Store(other),
            })
    }
}
