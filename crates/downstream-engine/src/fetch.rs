use async_trait::async_trait;
use tracing::debug;

use downstream_core::config::PipelineConfig;
use downstream_core::errors::PipelineError;

/// A retrieved upstream document.
#[derive(Clone, Debug)]
pub struct FetchedDocument {
    /// Body decoded as UTF-8, invalid sequences replaced.
    pub text: String,
    pub bytes: Vec<u8>,
}

/// Retrieves the upstream schedule document.
#[async_trait]
pub trait ScheduleFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchedDocument, PipelineError>;
}

/// Plain HTTP GET with a bounded timeout. Anything but 2xx is a failure.
pub struct HttpFetcher {
    client: reqwest::Client,
    config: PipelineConfig,
}

impl HttpFetcher {
    pub fn new(config: PipelineConfig) -> Result<Self, PipelineError> {
        let client = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| PipelineError::Configuration(format!("http client: {e}")))?;
        Ok(Self { client, config })
    }

    fn transport_error(&self, e: reqwest::Error) -> PipelineError {
        if e.is_timeout() {
            PipelineError::FetchTimeout(self.config.http_timeout)
        } else {
            PipelineError::Fetch(e.to_string())
        }
    }
}

#[async_trait]
impl ScheduleFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedDocument, PipelineError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::from_status(status.as_u16(), url));
        }

        let bytes = response.bytes().await.map_err(|e| self.transport_error(e))?.to_vec();
        let text = String::from_utf8_lossy(&bytes).into_owned();
        debug!(url, bytes = bytes.len(), "schedule fetched");
        Ok(FetchedDocument { text, bytes })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fetcher() -> HttpFetcher {
        HttpFetcher::new(PipelineConfig {
            http_timeout: Duration::from_millis(500),
            snapshot_retention: 3,
            user_agent: "downstream-test".into(),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn fetch_returns_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/schedule.xml"))
            .and(header("user-agent", "downstream-test"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<schedule/>"))
            .mount(&server)
            .await;

        let doc = fetcher()
            .fetch(&format!("{}/schedule.xml", server.uri()))
            .await
            .unwrap();
        assert_eq!(doc.text, "<schedule/>");
        assert_eq!(doc.bytes, b"<schedule/>");
    }

    #[tokio::test]
    async fn non_success_status_is_fetch_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = fetcher().fetch(&server.uri()).await.unwrap_err();
        assert!(matches!(err, PipelineError::Fetch(_)), "got {err:?}");
        assert!(err.to_string().starts_with("could not retrieve schedule"));
    }

    #[tokio::test]
    async fn slow_upstream_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("<schedule/>")
                    .set_delay(Duration::from_secs(3)),
            )
            .mount(&server)
            .await;

        let err = fetcher().fetch(&server.uri()).await.unwrap_err();
        assert!(matches!(err, PipelineError::FetchTimeout(_)), "got {err:?}");
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn invalid_utf8_is_replaced() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![b'a', 0xff, b'b']))
            .mount(&server)
            .await;

        let doc = fetcher().fetch(&server.uri()).await.unwrap();
        assert_eq!(doc.text, "a\u{fffd}b");
        assert_eq!(doc.bytes.len(), 3);
    }
}
