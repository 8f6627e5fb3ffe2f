use downstream_core::errors::PipelineError;
use downstream_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("unknown event: {0}")]
    UnknownEvent(String),

    #[error("import task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl EngineError {
    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Pipeline(e) => e.error_kind(),
            Self::Store(_) => "store",
            Self::UnknownEvent(_) => "unknown_event",
            Self::Task(_) => "task",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Pipeline(e) if e.is_retryable())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_errors_keep_their_message() {
        let err = EngineError::from(PipelineError::missing_upstream_url());
        assert_eq!(err.to_string(), "configuration error: no upstream URL configured");
        assert_eq!(err.error_kind(), "configuration");
        assert!(!err.is_retryable());
    }

    #[test]
    fn fetch_errors_are_retryable() {
        let err = EngineError::from(PipelineError::from_status(500, "https://example.com"));
        assert!(err.is_retryable());
        assert_eq!(err.error_kind(), "fetch");
    }
}
