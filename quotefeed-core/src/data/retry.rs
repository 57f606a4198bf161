//! Retry pacing for provider requests: exponential backoff with jitter,
//! clipped to the request's deadline.

use super::provider::FetchRequest;
use rand::Rng;
use std::time::Duration;

/// How often, and how far apart, a failed request is tried again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Wait before the first retry; doubles for each one after.
    pub base_delay: Duration,
    /// Upper bound of the random delay added to every wait.
    pub max_jitter: Duration,
}

/// Two retries, 500 ms base delay, up to 250 ms jitter.
impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_jitter: Duration::from_millis(250),
        }
    }
}

impl RetryPolicy {
    /// Same pacing, different retry count.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// No waiting between attempts. Handy in tests.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay: Duration::ZERO,
            max_jitter: Duration::ZERO,
        }
    }

    /// Backoff before retry number `attempt` (1-based), without jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1u32 << exp)
    }

    /// Uniform in `0..=max_jitter`.
    fn jitter(&self) -> Duration {
        let max_ms = self.max_jitter.as_millis() as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
    }

    /// Sleep before retry `attempt`. Returns false, without sleeping, when the
    /// wait would run past the request deadline.
    pub fn wait_before(&self, attempt: u32, request: &FetchRequest) -> bool {
        let delay = self.backoff(attempt) + self.jitter();
        if delay >= request.remaining() {
            return false;
        }
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        true
    }
}
