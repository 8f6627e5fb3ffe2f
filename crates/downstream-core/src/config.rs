//! Configuration consumed by the pipeline.
//!
//! [`EventConfig`] holds one event's downstream settings and is passed
//! explicitly into the refresh path. [`PipelineConfig`] holds process-wide
//! knobs, read from `DOWNSTREAM_*` environment variables over defaults.

use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_INTERVAL_MINUTES: u32 = 15;
pub const DEFAULT_SNAPSHOT_RETENTION: usize = 3;
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

/// When the periodic trigger may refresh an event.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckingTime {
    /// Refresh continuously.
    Always,
    /// Refresh only while the event is running.
    #[default]
    Event,
}

impl std::fmt::Display for CheckingTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Always => write!(f, "always"),
            Self::Event => write!(f, "event"),
        }
    }
}

impl std::str::FromStr for CheckingTime {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "always" => Ok(Self::Always),
            "event" => Ok(Self::Event),
            other => Err(format!("unknown checking time: {other}")),
        }
    }
}

/// Downstream settings of one event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventConfig {
    pub upstream_url: Option<String>,
    pub interval_minutes: u32,
    pub checking_time: CheckingTime,
    pub discard_after: Option<String>,
    pub last_sync: Option<DateTime<Utc>>,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            upstream_url: None,
            interval_minutes: DEFAULT_INTERVAL_MINUTES,
            checking_time: CheckingTime::default(),
            discard_after: None,
            last_sync: None,
        }
    }
}

impl EventConfig {
    /// Configured URL, treating a blank value as unset.
    pub fn upstream_url(&self) -> Option<&str> {
        self.upstream_url
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
    }

    /// Configured discard marker, treating an empty value as unset.
    pub fn discard_after(&self) -> Option<&str> {
        self.discard_after.as_deref().filter(|m| !m.is_empty())
    }

    pub fn interval(&self) -> chrono::Duration {
        chrono::Duration::minutes(i64::from(self.interval_minutes))
    }

    /// Whether the periodic trigger should refresh now.
    ///
    /// `dates` is the event's (from, to) range; with `CheckingTime::Event`
    /// an event without dates is never due.
    pub fn is_due(&self, dates: Option<(NaiveDate, NaiveDate)>, now: DateTime<Utc>) -> bool {
        if self.upstream_url().is_none() {
            return false;
        }
        if self.checking_time == CheckingTime::Event {
            let today = now.date_naive();
            match dates {
                Some((from, to)) if from <= today && today <= to => {}
                _ => return false,
            }
        }
        match self.last_sync {
            None => true,
            Some(last) => now - last >= self.interval(),
        }
    }
}

/// Process-wide pipeline knobs.
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub http_timeout: Duration,
    pub snapshot_retention: usize,
    pub user_agent: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            http_timeout: Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS),
            snapshot_retention: DEFAULT_SNAPSHOT_RETENTION,
            user_agent: format!("frab-downstream/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl PipelineConfig {
    /// Defaults overridden by `DOWNSTREAM_HTTP_TIMEOUT_SECS`,
    /// `DOWNSTREAM_SNAPSHOT_RETENTION` and `DOWNSTREAM_USER_AGENT`.
    /// Unparsable values are ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(secs) = lookup("DOWNSTREAM_HTTP_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            config.http_timeout = Duration::from_secs(secs);
        }
        if let Some(keep) = lookup("DOWNSTREAM_SNAPSHOT_RETENTION").and_then(|v| v.parse().ok()) {
            config.snapshot_retention = keep;
        }
        if let Some(agent) = lookup("DOWNSTREAM_USER_AGENT").filter(|v| !v.is_empty()) {
            config.user_agent = agent;
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn configured(checking_time: CheckingTime) -> EventConfig {
        EventConfig {
            upstream_url: Some("https://example.com/schedule.xml".into()),
            checking_time,
            ..Default::default()
        }
    }

    fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
    }

    fn jan(from: u32, to: u32) -> Option<(NaiveDate, NaiveDate)> {
        Some((
            NaiveDate::from_ymd_opt(2024, 1, from).unwrap(),
            NaiveDate::from_ymd_opt(2024, 1, to).unwrap(),
        ))
    }

    #[test]
    fn never_due_without_url() {
        let config = EventConfig {
            upstream_url: Some("   ".into()),
            checking_time: CheckingTime::Always,
            ..Default::default()
        };
        assert!(!config.is_due(None, at(2024, 1, 15, 10)));
    }

    #[test]
    fn always_is_due_when_never_synced() {
        assert!(configured(CheckingTime::Always).is_due(None, at(2030, 6, 1, 0)));
    }

    #[test]
    fn event_checking_time_respects_dates() {
        let config = configured(CheckingTime::Event);
        assert!(config.is_due(jan(15, 17), at(2024, 1, 16, 12)));
        assert!(!config.is_due(jan(15, 17), at(2024, 1, 18, 0)));
        assert!(!config.is_due(None, at(2024, 1, 16, 12)));
    }

    #[test]
    fn interval_gates_repeat_refreshes() {
        let mut config = configured(CheckingTime::Always);
        config.interval_minutes = 10;
        config.last_sync = Some(Utc.with_ymd_and_hms(2024, 1, 15, 10, 0, 0).unwrap());
        assert!(!config.is_due(None, Utc.with_ymd_and_hms(2024, 1, 15, 10, 5, 0).unwrap()));
        assert!(config.is_due(None, Utc.with_ymd_and_hms(2024, 1, 15, 10, 10, 0).unwrap()));
    }

    #[test]
    fn checking_time_roundtrip() {
        assert_eq!("always".parse::<CheckingTime>().unwrap(), CheckingTime::Always);
        assert_eq!(CheckingTime::Event.to_string(), "event");
        assert!("sometimes".parse::<CheckingTime>().is_err());
    }

    #[test]
    fn pipeline_config_overrides() {
        let config = PipelineConfig::from_lookup(|key| match key {
            "DOWNSTREAM_HTTP_TIMEOUT_SECS" => Some("5".into()),
            "DOWNSTREAM_SNAPSHOT_RETENTION" => Some("not-a-number".into()),
            _ => None,
        });
        assert_eq!(config.http_timeout, Duration::from_secs(5));
        assert_eq!(config.snapshot_retention, DEFAULT_SNAPSHOT_RETENTION);
        assert!(config.user_agent.starts_with("frab-downstream/"));
    }
}
