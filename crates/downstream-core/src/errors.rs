use std::time::Duration;

/// Failures of the fetch-parse-import pipeline.
/// Only fetch failures are transient; the others need an operator or a fixed feed.
#[derive(Clone, Debug, thiserror::Error)]
pub enum PipelineError {
    // Needs operator action
    #[error("configuration error: {0}")]
    Configuration(String),

    // Retryable on the next cycle
    #[error("could not retrieve schedule: {0}")]
    Fetch(String),
    #[error("could not retrieve schedule: timed out after {0:?}")]
    FetchTimeout(Duration),

    // Needs a fixed upstream feed
    #[error("malformed schedule document: {0}")]
    MalformedDocument(String),
}

impl PipelineError {
    pub fn missing_upstream_url() -> Self {
        Self::Configuration("no upstream URL configured".into())
    }

    pub fn malformed(detail: impl Into<String>) -> Self {
        Self::MalformedDocument(detail.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Fetch(_) | Self::FetchTimeout(_))
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration",
            Self::Fetch(_) => "fetch",
            Self::FetchTimeout(_) => "fetch_timeout",
            Self::MalformedDocument(_) => "malformed_document",
        }
    }

    /// Classify a non-success HTTP status.
    pub fn from_status(status: u16, url: &str) -> Self {
        Self::Fetch(format!("HTTP {status} from {url}"))
    }
}
