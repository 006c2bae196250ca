use std::time::Duration;

use crate::config::FetchConfig;

/// Exponential backoff with jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base: Duration,
    pub max: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &FetchConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base: config.backoff_base,
            max: config.backoff_max,
        }
    }

    /// Delay before retry number `attempt` (0-based).
    ///
    /// `min(base * 2^attempt, max)` plus up to half of that again, scaled by
    /// `jitter` in `[0, 1)`.
    pub fn delay(&self, attempt: u32, jitter: f64) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        let exp = self.base.saturating_mul(factor).min(self.max);
        exp + exp.mul_f64(jitter.clamp(0.0, 1.0) * 0.5)
    }

    /// Delay honouring a server-provided `Retry-After`, never above `max`.
    pub fn delay_with_hint(&self, attempt: u32, jitter: f64, retry_after: Option<Duration>) -> Duration {
        let backoff = self.delay(attempt, jitter);
        match retry_after {
            Some(hint) => backoff.max(hint.min(self.max)),
            None => backoff,
        }
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            base: Duration::from_millis(100),
            max: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_backoff_doubles_until_cap() {
        let p = policy();
        assert_eq!(p.delay(0, 0.0), Duration::from_millis(100));
        assert_eq!(p.delay(1, 0.0), Duration::from_millis(200));
        assert_eq!(p.delay(2, 0.0), Duration::from_millis(400));
        assert_eq!(p.delay(5, 0.0), Duration::from_secs(1));
        assert_eq!(p.delay(40, 0.0), Duration::from_secs(1));
    }

    #[test]
    fn test_jitter_adds_at_most_half() {
        let p = policy();
        let d = p.delay(1, 0.999);
        assert!(d > Duration::from_millis(200));
        assert!(d < Duration::from_millis(300));
    }

    #[test]
    fn test_retry_after_is_capped() {
        let p = policy();
        assert_eq!(
            p.delay_with_hint(0, 0.0, Some(Duration::from_secs(120))),
            Duration::from_secs(1)
        );
        assert_eq!(
            p.delay_with_hint(0, 0.0, Some(Duration::from_millis(10))),
            Duration::from_millis(100)
        );
    }

    #[test]
    fn test_should_retry_respects_limit() {
        let p = policy();
        assert!(p.should_retry(0));
        assert!(p.should_retry(2));
        assert!(!p.should_retry(3));
    }
}
