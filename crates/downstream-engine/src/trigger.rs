//! In-process periodic trigger.
//!
//! Every tick prunes snapshots of all events, refreshes the events that are
//! due and runs the refresh jobs enqueued since the last tick.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use downstream_store::events::{EventRepo, EventRow};
use downstream_store::jobs::{JobRepo, JobRow};
use downstream_store::snapshots::SnapshotRepo;

use crate::error::EngineError;
use crate::refresh::{RefreshOrchestrator, RefreshOutcome};

/// What one tick did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub pruned: usize,
    pub refreshed: Vec<String>,
    pub jobs: usize,
    pub failures: usize,
}

pub struct PeriodicTrigger {
    orchestrator: Arc<RefreshOrchestrator>,
    /// Last dispatch per event slug. `last_sync` only moves on imports, so
    /// this keeps unchanged feeds to one fetch per interval.
    attempts: DashMap<String, DateTime<Utc>>,
}

impl PeriodicTrigger {
    pub fn new(orchestrator: Arc<RefreshOrchestrator>) -> Self {
        Self {
            orchestrator,
            attempts: DashMap::new(),
        }
    }

    /// Run ticks every `period` until `cancel` fires.
    pub async fn run(&self, period: Duration, cancel: CancellationToken) {
        info!(period_secs = period.as_secs(), "periodic trigger started");
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    match self.tick(Utc::now()).await {
                        Ok(summary) => debug!(?summary, "tick finished"),
                        Err(e) => error!(error = %e, "tick failed"),
                    }
                }
            }
        }
        info!("periodic trigger stopped");
    }

    /// One cycle. Refresh failures are logged and counted, never returned.
    #[instrument(skip(self))]
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickSummary, EngineError> {
        let db = self.orchestrator.database().clone();
        let events = EventRepo::new(db.clone()).list()?;
        let snapshots = SnapshotRepo::new(db.clone());
        let keep = self.orchestrator.config().snapshot_retention;

        let mut summary = TickSummary::default();
        let mut due = Vec::new();
        for event in events {
            summary.pruned += snapshots.prune(&event.id, keep)?;
            if self.is_due(&event, now) {
                self.attempts.insert(event.slug.clone(), now);
                due.push(event.slug);
            }
        }

        let mut tasks = JoinSet::new();
        for slug in &due {
            let orchestrator = self.orchestrator.clone();
            let slug = slug.clone();
            tasks.spawn(async move {
                let result = orchestrator.refresh(&slug).await;
                log_outcome(&slug, &result);
                result.is_ok()
            });
        }

        let jobs = JobRepo::new(db);
        while let Some(job) = jobs.claim_next()? {
            summary.jobs += 1;
            let orchestrator = self.orchestrator.clone();
            let jobs = JobRepo::new(orchestrator.database().clone());
            tasks.spawn(async move { run_job(&orchestrator, &jobs, job).await });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(true) => {}
                Ok(false) => summary.failures += 1,
                Err(e) => {
                    error!(error = %e, "refresh task panicked");
                    summary.failures += 1;
                }
            }
        }

        summary.refreshed = due;
        Ok(summary)
    }

    fn is_due(&self, event: &EventRow, now: DateTime<Utc>) -> bool {
        if !event.config.is_due(event.dates(), now) {
            return false;
        }
        self.attempts
            .get(&event.slug)
            .map_or(true, |last| now - *last >= event.config.interval())
    }
}

async fn run_job(orchestrator: &RefreshOrchestrator, jobs: &JobRepo, job: JobRow) -> bool {
    let result = orchestrator.refresh(&job.event_slug).await;
    log_outcome(&job.event_slug, &result);
    let ok = result.is_ok();
    let outcome = result.map(|_| ()).map_err(|e| e.to_string());
    if let Err(e) = jobs.finish(&job.id, outcome) {
        error!(job_id = %job.id, error = %e, "failed to record job outcome");
    }
    ok
}

fn log_outcome(slug: &str, result: &Result<RefreshOutcome, EngineError>) {
    match result {
        Ok(RefreshOutcome::Unchanged) => debug!(event = %slug, "upstream unchanged"),
        Ok(RefreshOutcome::Imported { changes, .. }) => {
            info!(event = %slug, changed = changes.changed().count(), "refresh imported")
        }
        Err(e) => warn!(event = %slug, kind = e.error_kind(), error = %e, "refresh failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::HttpFetcher;
    use crate::frab::tests::SAMPLE_XML;
    use chrono::{NaiveDate, TimeZone};
    use downstream_core::config::{CheckingTime, EventConfig, PipelineConfig};
    use downstream_store::jobs::JobStatus;
    use downstream_store::Database;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn trigger(db: &Database) -> PeriodicTrigger {
        let config = PipelineConfig::default();
        let fetcher = HttpFetcher::new(config.clone()).unwrap();
        PeriodicTrigger::new(Arc::new(RefreshOrchestrator::new(
            db.clone(),
            Arc::new(fetcher),
            config,
        )))
    }

    fn add_event(db: &Database, slug: &str, config: EventConfig) -> EventRow {
        let repo = EventRepo::new(db.clone());
        let event = repo
            .create(
                slug,
                slug,
                NaiveDate::from_ymd_opt(2024, 1, 15),
                NaiveDate::from_ymd_opt(2024, 1, 17),
            )
            .unwrap();
        repo.save_config(&event.id, &config).unwrap();
        event
    }

    async fn upstream() -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(SAMPLE_XML))
            .mount(&server)
            .await;
        server
    }

    fn during_event() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 16, 9, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn skips_events_without_url() {
        let db = Database::in_memory().unwrap();
        add_event(&db, "quiet", EventConfig::default());
        let summary = trigger(&db).tick(during_event()).await.unwrap();
        assert!(summary.refreshed.is_empty());
        assert_eq!(summary.failures, 0);
    }

    #[tokio::test]
    async fn checking_time_event_only_runs_during_event() {
        let server = upstream().await;
        let db = Database::in_memory().unwrap();
        let config = EventConfig {
            upstream_url: Some(server.uri()),
            checking_time: CheckingTime::Event,
            ..Default::default()
        };
        add_event(&db, "democon", config);
        let trigger = trigger(&db);

        let before = Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap();
        assert!(trigger.tick(before).await.unwrap().refreshed.is_empty());
        assert_eq!(trigger.tick(during_event()).await.unwrap().refreshed, vec!["democon"]);
    }

    #[tokio::test]
    async fn interval_is_honored() {
        // A failing upstream never writes last_sync, so only dispatches gate the interval.
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        let db = Database::in_memory().unwrap();
        let config = EventConfig {
            upstream_url: Some(server.uri()),
            checking_time: CheckingTime::Always,
            interval_minutes: 10,
            ..Default::default()
        };
        add_event(&db, "democon", config);
        let trigger = trigger(&db);
        let now = during_event();

        assert_eq!(trigger.tick(now).await.unwrap().refreshed.len(), 1);
        let soon = now + chrono::Duration::minutes(5);
        assert!(trigger.tick(soon).await.unwrap().refreshed.is_empty());
        let later = now + chrono::Duration::minutes(10);
        assert_eq!(trigger.tick(later).await.unwrap().refreshed.len(), 1);
    }

    #[tokio::test]
    async fn recent_sync_is_not_due() {
        let server = upstream().await;
        let db = Database::in_memory().unwrap();
        let now = during_event();
        let events = EventRepo::new(db.clone());
        for (slug, minutes_ago) in [("recent", 5), ("stale", 20)] {
            let event = add_event(
                &db,
                slug,
                EventConfig {
                    upstream_url: Some(server.uri()),
                    checking_time: CheckingTime::Always,
                    ..Default::default()
                },
            );
            events
                .set_last_sync(&event.id, now - chrono::Duration::minutes(minutes_ago))
                .unwrap();
        }

        let summary = trigger(&db).tick(now).await.unwrap();
        assert_eq!(summary.refreshed, vec!["stale"]);
    }

    #[tokio::test]
    async fn failures_do_not_stop_the_tick() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        let good = upstream().await;
        let db = Database::in_memory().unwrap();
        for (slug, uri) in [("broken", server.uri()), ("fine", good.uri())] {
            add_event(
                &db,
                slug,
                EventConfig {
                    upstream_url: Some(uri),
                    checking_time: CheckingTime::Always,
                    ..Default::default()
                },
            );
        }

        let summary = trigger(&db).tick(during_event()).await.unwrap();
        assert_eq!(summary.refreshed.len(), 2);
        assert_eq!(summary.failures, 1);
    }

    #[tokio::test]
    async fn drains_enqueued_jobs() {
        let server = upstream().await;
        let db = Database::in_memory().unwrap();
        // checking_time "event" outside the event: only the job refreshes it.
        add_event(
            &db,
            "democon",
            EventConfig {
                upstream_url: Some(server.uri()),
                ..Default::default()
            },
        );
        let jobs = JobRepo::new(db.clone());
        let ok = jobs.enqueue("democon").unwrap();
        let missing = jobs.enqueue("nope").unwrap();

        let outside = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();
        let summary = trigger(&db).tick(outside).await.unwrap();
        assert!(summary.refreshed.is_empty());
        assert_eq!(summary.jobs, 2);
        assert_eq!(summary.failures, 1);

        assert_eq!(jobs.get(&ok.id).unwrap().status, JobStatus::Done);
        let failed = jobs.get(&missing.id).unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("unknown event: nope"));
        assert!(jobs.list_pending().unwrap().is_empty());
    }

    #[tokio::test]
    async fn prunes_every_event() {
        let db = Database::in_memory().unwrap();
        let event = add_event(&db, "quiet", EventConfig::default());
        let snapshots = SnapshotRepo::new(db.clone());
        for i in 0..5 {
            snapshots.store(&event.id, Some(&format!("v{i}"))).unwrap();
        }
        let summary = trigger(&db).tick(during_event()).await.unwrap();
        assert_eq!(summary.pruned, 2);
        assert_eq!(snapshots.list(&event.id).unwrap().len(), 3);
    }

    #[tokio::test]
    async fn run_stops_on_cancel() {
        let db = Database::in_memory().unwrap();
        let trigger = trigger(&db);
        let cancel = CancellationToken::new();
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), trigger.run(Duration::from_secs(60), cancel))
            .await
            .unwrap();
    }
}
