//! Per-host rate limiting.
//!
//! Uses a keyed governor limiter with a one-cell quota, which makes the
//! quota period the minimum gap between two requests to the same host.

use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Enforces a minimum interval between requests to the same host.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct HostRateLimiter {
    limiter: Arc<DefaultKeyedRateLimiter<String>>,
    interval: Duration,
}

impl HostRateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        let quota = Quota::with_period(min_interval)
            .unwrap_or_else(|| Quota::per_second(NonZeroU32::MIN))
            .allow_burst(NonZeroU32::MIN);
        Self {
            limiter: Arc::new(RateLimiter::keyed(quota)),
            interval: min_interval,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Wait until a request to `host` is allowed.
    pub async fn until_ready(&self, host: &str) {
        self.limiter.until_key_ready(&host.to_string()).await;
    }

    /// Like `until_ready`, but gives up when `cancel` fires.
    ///
    /// Returns `false` if cancelled.
    pub async fn until_ready_or_cancelled(&self, host: &str, cancel: &CancellationToken) -> bool {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            _ = self.until_ready(host) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn test_same_host_is_spaced() {
        let limiter = HostRateLimiter::new(Duration::from_millis(200));
        let start = Instant::now();

        limiter.until_ready("www.formula1.com").await;
        limiter.until_ready("www.formula1.com").await;
        limiter.until_ready("www.formula1.com").await;

        // first is immediate, the next two wait one interval each
        assert!(
            start.elapsed() >= Duration::from_millis(380),
            "rate limiting not applied: {:?}",
            start.elapsed()
        );
    }

    #[tokio::test]
    async fn test_hosts_are_independent() {
        let limiter = HostRateLimiter::new(Duration::from_secs(5));
        let start = Instant::now();

        limiter.until_ready("www.formula1.com").await;
        limiter.until_ready("en.wikipedia.org").await;

        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_cancelled_wait_returns_false() {
        let limiter = HostRateLimiter::new(Duration::from_secs(60));
        let cancel = CancellationToken::new();

        limiter.until_ready("example.test").await;
        cancel.cancel();
        assert!(!limiter.until_ready_or_cancelled("example.test", &cancel).await);
    }
}
