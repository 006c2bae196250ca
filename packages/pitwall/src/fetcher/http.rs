//! reqwest-backed fetcher.
//!
//! Every attempt, retries included, waits on the per-host limiter first.
//! Transient failures (timeouts, connection resets, 429, 5xx) are retried
//! with backoff; everything else fails on the first attempt.

use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::{CONTENT_TYPE, RETRY_AFTER};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Fetcher, HostRateLimiter, RetryPolicy};
use crate::config::FetchConfig;
use crate::error::{ConfigError, FetchError, FetchErrorKind, FetchResult};
use crate::types::endpoint::{RawContent, SourceEndpoint};

/// One failed attempt, plus the server's `Retry-After` hint if any.
struct AttemptFailure {
    error: FetchError,
    retry_after: Option<Duration>,
}

impl From<FetchError> for AttemptFailure {
    fn from(error: FetchError) -> Self {
        Self {
            error,
            retry_after: None,
        }
    }
}

/// HTTP fetcher with retries, backoff and per-host rate limiting.
pub struct HttpFetcher {
    client: reqwest::Client,
    limiter: HostRateLimiter,
    policy: RetryPolicy,
}

impl HttpFetcher {
    pub fn new(config: &FetchConfig) -> Result<Self, ConfigError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| ConfigError::invalid("http client", &config.user_agent, e.to_string()))?;

        Ok(Self {
            client,
            limiter: HostRateLimiter::new(config.min_host_interval),
            policy: RetryPolicy::from_config(config),
        })
    }

    async fn attempt(&self, endpoint: &SourceEndpoint) -> Result<RawContent, AttemptFailure> {
        let url = endpoint.url.as_str();
        debug!(url = %url, "HTTP fetch starting");

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| classify_transport(url, &e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AttemptFailure {
                error: FetchError::status(url, status.as_u16()),
                retry_after: response
                    .headers()
                    .get(RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(parse_retry_after),
            });
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        if let Some(expected) = &endpoint.expected_content_type {
            if !content_type_matches(expected, content_type.as_deref()) {
                return Err(FetchError::new(
                    FetchErrorKind::ContentType,
                    false,
                    url,
                    format!(
                        "expected {}, got {}",
                        expected,
                        content_type.as_deref().unwrap_or("none")
                    ),
                )
                .into());
            }
        }

        let body = response
            .text()
            .await
            .map_err(|e| classify_transport(url, &e))?;

        let mut raw = RawContent::new(endpoint.clone(), body).with_status(status.as_u16());
        raw.fetched_at = Utc::now();
        if let Some(ct) = content_type {
            raw = raw.with_content_type(ct);
        }
        Ok(raw)
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(
        &self,
        endpoint: &SourceEndpoint,
        cancel: &CancellationToken,
    ) -> FetchResult<RawContent> {
        let url = endpoint.url.as_str();
        let host = endpoint.host().ok_or_else(|| {
            FetchError::new(FetchErrorKind::Network, false, url, "URL has no host")
        })?;

        let mut attempt = 0u32;
        loop {
            if !self.limiter.until_ready_or_cancelled(&host, cancel).await {
                return Err(FetchError::cancelled(url));
            }

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(FetchError::cancelled(url)),
                result = self.attempt(endpoint) => result,
            };

            let failure = match result {
                Ok(raw) => {
                    if attempt > 0 {
                        info!(url = %url, attempts = attempt + 1, "Fetch succeeded after retry");
                    }
                    return Ok(raw);
                }
                Err(failure) => failure,
            };

            if !failure.error.retriable || !self.policy.should_retry(attempt) {
                warn!(url = %url, error = %failure.error, attempts = attempt + 1, "Fetch failed");
                return Err(failure.error);
            }

            let delay = self
                .policy
                .delay_with_hint(attempt, fastrand::f64(), failure.retry_after);
            warn!(
                url = %url,
                error = %failure.error,
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                "Transient fetch failure, retrying"
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(FetchError::cancelled(url)),
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }

    fn name(&self) -> &str {
        "http"
    }
}

fn classify_transport(url: &str, err: &reqwest::Error) -> AttemptFailure {
    if err.is_timeout() {
        return FetchError::timeout(url).into();
    }

    let chain = error_chain_text(err);
    let retriable = !is_dns_failure(&chain);
    FetchError::new(FetchErrorKind::Network, retriable, url, chain).into()
}

/// Join an error and all of its sources into one message.
fn error_chain_text(err: &(dyn std::error::Error + 'static)) -> String {
    let mut parts = vec![err.to_string()];
    let mut current = err.source();
    while let Some(source) = current {
        parts.push(source.to_string());
        current = source.source();
    }
    parts.join(": ")
}

/// Name resolution failures will not fix themselves within a run.
fn is_dns_failure(message: &str) -> bool {
    let lower = message.to_lowercase();
    [
        "dns error",
        "failed to lookup address",
        "name or service not known",
        "no such host",
        "nodename nor servname",
    ]
    .iter()
    .any(|needle| lower.contains(needle))
}

/// Media-type comparison ignoring case and parameters.
///
/// A response without a content type is accepted.
fn content_type_matches(expected: &str, actual: Option<&str>) -> bool {
    let Some(actual) = actual else {
        return true;
    };
    let media = actual.split(';').next().unwrap_or("").trim();
    media.eq_ignore_ascii_case(expected.trim())
}

/// `Retry-After` in delta-seconds form. HTTP-date form is ignored.
fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::family::{EntityFamily, SourceId};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    const OK_HTML: &str = "HTTP/1.1 200 OK\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello";
    const UNAVAILABLE: &str =
        "HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
    const NOT_FOUND: &str =
        "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
    const OK_JSON: &str = "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 2\r\nConnection: close\r\n\r\n{}";

    /// Serve canned responses in order, one per connection.
    async fn stub_server(responses: Vec<&'static str>) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();

        tokio::spawn(async move {
            for response in responses {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                counter.fetch_add(1, Ordering::SeqCst);
                let mut buf = vec![0u8; 8192];
                let _ = socket.read(&mut buf).await;
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });

        (format!("http://{}", addr), hits)
    }

    fn fast_config() -> FetchConfig {
        FetchConfig {
            timeout: Duration::from_secs(5),
            max_retries: 3,
            backoff_base: Duration::from_millis(1),
            backoff_max: Duration::from_millis(5),
            min_host_interval: Duration::from_millis(1),
            workers: 1,
            user_agent: "pitwall-test".to_string(),
        }
    }

    fn endpoint(url: String) -> SourceEndpoint {
        SourceEndpoint::new(SourceId::formula1(), EntityFamily::Competitors, url)
    }

    #[tokio::test]
    async fn test_retries_transient_status_then_succeeds() {
        let (base, hits) = stub_server(vec![UNAVAILABLE, OK_HTML]).await;
        let fetcher = HttpFetcher::new(&fast_config()).unwrap();

        let raw = fetcher
            .fetch(&endpoint(format!("{}/drivers", base)), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(raw.body, "hello");
        assert_eq!(raw.status, 200);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_permanent_status_is_not_retried() {
        let (base, hits) = stub_server(vec![NOT_FOUND, OK_HTML]).await;
        let fetcher = HttpFetcher::new(&fast_config()).unwrap();

        let err = fetcher
            .fetch(&endpoint(format!("{}/missing", base)), &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.kind, FetchErrorKind::HttpStatus(404));
        assert!(!err.retriable);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let (base, hits) = stub_server(vec![UNAVAILABLE, UNAVAILABLE, UNAVAILABLE]).await;
        let config = FetchConfig {
            max_retries: 2,
            ..fast_config()
        };
        let fetcher = HttpFetcher::new(&config).unwrap();

        let err = fetcher
            .fetch(&endpoint(format!("{}/flaky", base)), &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.kind, FetchErrorKind::HttpStatus(503));
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_content_type_mismatch_is_permanent() {
        let (base, hits) = stub_server(vec![OK_JSON, OK_JSON]).await;
        let fetcher = HttpFetcher::new(&fast_config()).unwrap();

        let err = fetcher
            .fetch(
                &endpoint(format!("{}/drivers", base)).html(),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert_eq!(err.kind, FetchErrorKind::ContentType);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let (base, hits) = stub_server(vec![OK_HTML]).await;
        let fetcher = HttpFetcher::new(&fast_config()).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = fetcher
            .fetch(&endpoint(format!("{}/drivers", base)), &cancel)
            .await
            .unwrap_err();

        assert!(err.is_cancelled());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_dns_failures_are_permanent() {
        assert!(is_dns_failure("error sending request: dns error: failed to lookup address information"));
        assert!(!is_dns_failure("connection reset by peer"));
    }

    #[test]
    fn test_content_type_matching() {
        assert!(content_type_matches("text/html", Some("text/html; charset=utf-8")));
        assert!(content_type_matches("text/html", Some("TEXT/HTML")));
        assert!(content_type_matches("text/html", None));
        assert!(!content_type_matches("text/html", Some("application/json")));
    }

    #[test]
    fn test_retry_after_parsing() {
        assert_eq!(parse_retry_after(" 7 "), Some(Duration::from_secs(7)));
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"), None);
    }
}
