//! # downstream
//!
//! Command-line entry point: registers events, edits their downstream
//! settings, pulls upstream schedules and runs the periodic trigger.

#![deny(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::Level;

use downstream_core::config::{CheckingTime, PipelineConfig};
use downstream_engine::{HttpFetcher, PeriodicTrigger, RefreshOrchestrator, RefreshOutcome};
use downstream_store::events::EventRepo;
use downstream_store::jobs::{JobRepo, JobRow};
use downstream_store::schedules::ScheduleRepo;
use downstream_store::snapshots::SnapshotRepo;
use downstream_store::Database;
use downstream_telemetry::{LogQuery, TelemetryConfig};

/// Import a frab schedule from an upstream URL into local events.
#[derive(Parser, Debug)]
#[command(name = "downstream", version, about)]
struct Cli {
    /// Path to the `SQLite` state database.
    #[arg(long, global = true)]
    db_path: Option<PathBuf>,

    /// Default log level (RUST_LOG overrides).
    #[arg(long, global = true, default_value = "info")]
    log_level: Level,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Manage events and their downstream settings.
    #[command(subcommand)]
    Event(EventCommand),

    /// Refresh one event from upstream.
    Pull {
        #[arg(long)]
        event: String,
        /// Run inline instead of enqueueing for the trigger.
        #[arg(long)]
        sync: bool,
    },

    /// Run the periodic trigger until interrupted.
    Serve {
        /// Seconds between ticks.
        #[arg(long, default_value = "60")]
        tick_secs: u64,
    },

    /// Show snapshots and released versions of an event.
    History {
        #[arg(long)]
        event: String,
    },

    /// Show persisted warnings and errors.
    Logs {
        #[arg(long)]
        event: Option<String>,
        /// Session code.
        #[arg(long)]
        code: Option<String>,
        #[arg(long)]
        level: Option<String>,
        #[arg(long, default_value = "50")]
        limit: u32,
    },
}

#[derive(Subcommand, Debug)]
enum EventCommand {
    Add {
        slug: String,
        #[arg(long)]
        name: Option<String>,
        /// First day (YYYY-MM-DD).
        #[arg(long)]
        from: Option<NaiveDate>,
        /// Last day (YYYY-MM-DD).
        #[arg(long)]
        to: Option<NaiveDate>,
    },
    /// Change downstream settings. Unset flags keep their value.
    Configure {
        slug: String,
        #[arg(long)]
        url: Option<String>,
        /// Minutes between scheduled refreshes.
        #[arg(long)]
        interval: Option<u32>,
        /// `always` or `event`.
        #[arg(long)]
        checking_time: Option<CheckingTime>,
        /// Cut released version labels at this marker. Empty to clear.
        #[arg(long)]
        discard_after: Option<String>,
    },
    Show {
        slug: String,
    },
    List,
}

fn default_db_path() -> PathBuf {
    downstream_telemetry::data_dir().join("downstream.db")
}

fn log_db_path(db_path: &Path) -> PathBuf {
    db_path.with_file_name("logs.db")
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let db_path = cli.db_path.clone().unwrap_or_else(default_db_path);

    let telemetry = downstream_telemetry::init_telemetry(TelemetryConfig {
        log_level: cli.log_level,
        log_db_path: log_db_path(&db_path),
        ..Default::default()
    });

    let db = Database::open(&db_path)
        .with_context(|| format!("Failed to open database: {}", db_path.display()))?;

    match cli.command {
        Command::Event(cmd) => event_command(&db, cmd),
        Command::Pull { event, sync } => {
            match pull(&db, &event, sync, PipelineConfig::from_env()).await? {
                Pulled::Queued(job) => println!("queued refresh {} for {}", job.id, job.event_slug),
                Pulled::Done(outcome) => println!("{}", serde_json::to_string_pretty(&outcome)?),
            }
            Ok(())
        }
        Command::Serve { tick_secs } => serve(db, Duration::from_secs(tick_secs.max(1))).await,
        Command::History { event } => history(&db, &event),
        Command::Logs { event, code, level, limit } => {
            let Some(sink) = telemetry.logs() else {
                bail!("log database is not available");
            };
            let records = sink
                .query(&LogQuery {
                    level,
                    event,
                    code,
                    limit: Some(limit),
                    ..Default::default()
                })
                .context("Failed to query logs")?;
            for r in records {
                println!(
                    "{} {:5} {} [{} {}] {}",
                    r.timestamp,
                    r.level,
                    r.target,
                    r.event.as_deref().unwrap_or("-"),
                    r.code.as_deref().unwrap_or("-"),
                    r.message
                );
            }
            Ok(())
        }
    }
}

fn orchestrator(db: &Database, config: PipelineConfig) -> Result<RefreshOrchestrator> {
    let fetcher = HttpFetcher::new(config.clone()).context("Failed to build HTTP client")?;
    Ok(RefreshOrchestrator::new(db.clone(), Arc::new(fetcher), config))
}

fn event_command(db: &Database, cmd: EventCommand) -> Result<()> {
    let events = EventRepo::new(db.clone());
    match cmd {
        EventCommand::Add { slug, name, from, to } => {
            if let (Some(from), Some(to)) = (from, to) {
                if from > to {
                    bail!("--from {from} is after --to {to}");
                }
            }
            let name = name.unwrap_or_else(|| slug.clone());
            let event = events.create(&slug, &name, from, to)?;
            println!("created event {} ({})", event.slug, event.id);
        }
        EventCommand::Configure {
            slug,
            url,
            interval,
            checking_time,
            discard_after,
        } => {
            let event = events.get_by_slug(&slug)?;
            let mut config = event.config;
            if let Some(url) = url {
                config.upstream_url = Some(url).filter(|u| !u.trim().is_empty());
            }
            if let Some(interval) = interval {
                if interval == 0 {
                    bail!("--interval must be at least one minute");
                }
                config.interval_minutes = interval;
            }
            if let Some(checking_time) = checking_time {
                config.checking_time = checking_time;
            }
            if let Some(marker) = discard_after {
                config.discard_after = Some(marker).filter(|m| !m.is_empty());
            }
            events.save_config(&event.id, &config)?;
            println!("updated {slug}");
        }
        EventCommand::Show { slug } => {
            let event = events.get_by_slug(&slug)?;
            println!("{}", serde_json::to_string_pretty(&event)?);
        }
        EventCommand::List => {
            for event in events.list()? {
                println!(
                    "{}\t{}\t{}",
                    event.slug,
                    event.name,
                    event.config.upstream_url().unwrap_or("-")
                );
            }
        }
    }
    Ok(())
}

enum Pulled {
    Queued(JobRow),
    Done(RefreshOutcome),
}

/// Refresh inline, or leave a job for the periodic trigger.
async fn pull(db: &Database, slug: &str, sync: bool, config: PipelineConfig) -> Result<Pulled> {
    // Fail early on typos in either mode.
    EventRepo::new(db.clone())
        .get_by_slug(slug)
        .with_context(|| format!("Unknown event {slug}"))?;

    if !sync {
        let job = JobRepo::new(db.clone()).enqueue(slug)?;
        return Ok(Pulled::Queued(job));
    }
    let outcome = orchestrator(db, config)?
        .refresh(slug)
        .await
        .with_context(|| format!("Refresh of {slug} failed"))?;
    Ok(Pulled::Done(outcome))
}

async fn serve(db: Database, period: Duration) -> Result<()> {
    let trigger = PeriodicTrigger::new(Arc::new(orchestrator(&db, PipelineConfig::from_env())?));
    let cancel = CancellationToken::new();

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for ctrl+c");
        }
        tracing::info!("Shutting down");
        shutdown.cancel();
    });

    trigger.run(period, cancel).await;
    Ok(())
}

fn history(db: &Database, slug: &str) -> Result<()> {
    for line in history_lines(db, slug)? {
        println!("{line}");
    }
    Ok(())
}

/// Snapshots with the version each one released, then the slots of the
/// latest released schedule.
fn history_lines(db: &Database, slug: &str) -> Result<Vec<String>> {
    let event = EventRepo::new(db.clone()).get_by_slug(slug)?;
    let mut lines = vec!["snapshots:".to_string()];

    for snapshot in SnapshotRepo::new(db.clone()).list(&event.id)? {
        let changed = snapshot
            .changes
            .as_ref()
            .map_or_else(|| "-".to_string(), |c| c.changed().count().to_string());
        let released = match &snapshot.schedule_id {
            Some(id) => db.with_conn(|conn| ScheduleRepo::get(conn, id))?.version,
            None => "-".to_string(),
        };
        lines.push(format!(
            "  {}  {}  checksum={}  changed={}  released={}",
            snapshot.created_at,
            snapshot.id,
            snapshot.checksum.as_deref().map_or("-", |c| &c[..c.len().min(12)]),
            changed,
            released
        ));
    }

    match db.with_conn(|conn| ScheduleRepo::latest(conn, &event.id))? {
        Some(schedule) => {
            lines.push(format!("latest version {} ({}):", schedule.version, schedule.created_at));
            for slot in schedule.slots {
                lines.push(format!(
                    "  {}  {}-{}  {}  {}",
                    slot.submission_code,
                    slot.start.format("%Y-%m-%d %H:%M"),
                    slot.end.format("%H:%M"),
                    slot.room,
                    slot.title
                ));
            }
        }
        None => lines.push("no released versions".to_string()),
    }
    Ok(lines)
}
