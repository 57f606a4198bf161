//! Circuit breaker for one provider host, shared by all of its requests.
//!
//! HTTP 403 trips it immediately (the provider has blocked us); repeated
//! transient failures trip it after `failure_threshold` in a row. While open,
//! providers refuse requests so the remaining targets fail fast instead of
//! each burning its whole timeout budget.

use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Whether the breaker currently lets requests through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Requests go out normally.
    Closed,
    /// Requests are refused until the cooldown after `tripped_at` has passed.
    Open { tripped_at: Instant },
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    inner: Mutex<Inner>,
    cooldown: Duration,
    failure_threshold: u32,
}

impl CircuitBreaker {
    /// Breaker that stays open for `cooldown` once tripped. A threshold of 0
    /// is treated as 1.
    pub fn new(cooldown: Duration, failure_threshold: u32) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
            }),
            cooldown,
            failure_threshold: failure_threshold.max(1),
        }
    }

    /// 10-minute cooldown, trips after 5 consecutive failures.
    ///
    /// A scheduled run is over long before the cooldown ends, so in practice
    /// a trip means "stop asking for the rest of this run".
    pub fn for_scheduled_run() -> Self {
        Self::new(Duration::from_secs(10 * 60), 5)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Poison is ignored: the guarded state is two plain values.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Check if a request may go out. An open breaker whose cooldown has
    /// expired closes here and allows it.
    pub fn is_allowed(&self) -> bool {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open { tripped_at } => {
                if tripped_at.elapsed() >= self.cooldown {
                    inner.state = BreakerState::Closed;
                    inner.consecutive_failures = 0;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a request that got an answer; resets the failure count.
    pub fn record_success(&self) {
        self.lock().consecutive_failures = 0;
    }

    /// Record a transient failure (network error, 429, 5xx). Trips the
    /// breaker once `failure_threshold` of them have come in a row.
    pub fn record_failure(&self) {
        let mut inner = self.lock();
        inner.consecutive_failures += 1;
        if inner.consecutive_failures >= self.failure_threshold {
            inner.state = BreakerState::Open {
                tripped_at: Instant::now(),
            };
        }
    }

    /// Open immediately, for a 403 or other sign of a ban.
    pub fn trip(&self) {
        self.lock().state = BreakerState::Open {
            tripped_at: Instant::now(),
        };
    }

    /// Current state, without the cooldown check `is_allowed` does.
    pub fn state(&self) -> BreakerState {
        self.lock().state
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::for_scheduled_run()
    }
}
