//! Testing utilities: a scriptable fetcher and HTML page builders.
//!
//! Lets pipeline tests run end to end against canned pages and an in-memory
//! database, without network access.

pub mod fixtures;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::{FetchError, FetchResult};
use crate::fetcher::Fetcher;
use crate::types::endpoint::{RawContent, SourceEndpoint};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A fetcher serving canned pages by URL.
///
/// Unknown URLs answer 404. Clones share pages and the call log, so a test
/// can keep a handle after moving the fetcher into an orchestrator.
#[derive(Clone, Default)]
pub struct MockFetcher {
    pages: Arc<Mutex<HashMap<String, String>>>,
    failures: Arc<Mutex<HashMap<String, FetchError>>>,
    delay: Arc<Mutex<Option<Duration>>>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `body` as `text/html` for `url`.
    pub fn with_page(self, url: impl Into<String>, body: impl Into<String>) -> Self {
        self.set_page(url, body);
        self
    }

    /// Fail every fetch of `url` with `error`.
    pub fn with_failure(self, url: impl Into<String>, error: FetchError) -> Self {
        lock(&self.failures).insert(url.into(), error);
        self
    }

    /// Sleep before answering (cancellable).
    pub fn with_delay(self, delay: Duration) -> Self {
        *lock(&self.delay) = Some(delay);
        self
    }

    /// Replace a page after construction, e.g. between two runs.
    pub fn set_page(&self, url: impl Into<String>, body: impl Into<String>) {
        lock(&self.pages).insert(url.into(), body.into());
    }

    /// URLs fetched so far, in call order.
    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    pub fn call_count(&self) -> usize {
        lock(&self.calls).len()
    }
}

#[async_trait]
impl Fetcher for MockFetcher {
    async fn fetch(
        &self,
        endpoint: &SourceEndpoint,
        cancel: &CancellationToken,
    ) -> FetchResult<RawContent> {
        let url = endpoint.url.clone();
        lock(&self.calls).push(url.clone());

        let delay = *lock(&self.delay);
        if let Some(delay) = delay {
            tokio::select! {
                _ = cancel.cancelled() => return Err(FetchError::cancelled(url)),
                _ = tokio::time::sleep(delay) => {}
            }
        }
        if cancel.is_cancelled() {
            return Err(FetchError::cancelled(url));
        }

        if let Some(error) = lock(&self.failures).get(&url) {
            return Err(error.clone());
        }

        let body = lock(&self.pages).get(&url).cloned();
        match body {
            Some(body) => Ok(RawContent::new(endpoint.clone(), body).with_content_type("text/html")),
            None => Err(FetchError::status(url, 404)),
        }
    }

    fn name(&self) -> &str {
        "mock"
    }
}
