//! Fetching raw content from source endpoints.
//!
//! - `Fetcher` - the contract the orchestrator depends on
//! - `HttpFetcher` - reqwest-backed implementation with retries
//! - `HostRateLimiter` - per-host minimum request interval
//! - `RetryPolicy` - exponential backoff with jitter

mod http;
mod rate_limited;
mod retry;

pub use http::HttpFetcher;
pub use rate_limited::HostRateLimiter;
pub use retry::RetryPolicy;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::FetchResult;
use crate::types::endpoint::{RawContent, SourceEndpoint};

/// Retrieves the raw content behind one endpoint.
///
/// Implementations retry transient failures themselves; an `Err` is final
/// for this run. Cancelling `cancel` must abort in-flight work promptly and
/// surface `FetchErrorKind::Cancelled`.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(
        &self,
        endpoint: &SourceEndpoint,
        cancel: &CancellationToken,
    ) -> FetchResult<RawContent>;

    /// Short name for logs.
    fn name(&self) -> &str {
        "fetcher"
    }
}
