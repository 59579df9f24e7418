//! Reconnect backoff and timeout utilities.
//!
//! The helpers in this module are transport-agnostic. [`Backoff`] is the
//! stateful counterpart of [`BackoffPolicy`] that a reconnect loop owns.

use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::debug;

const MAX_TRACKED_ATTEMPT: usize = 64;

/// Policy controlling exponential backoff between reconnect attempts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay used before the first reconnect after a failure.
    pub initial_backoff: Duration,
    /// Upper bound for exponential backoff delay growth.
    pub max_backoff: Duration,
    /// Maximum random jitter added to each delay. Zero disables jitter.
    pub jitter: Duration,
}

impl BackoffPolicy {
    /// Returns the policy used by table streams: 1s doubling up to 5 minutes.
    pub fn reconnect() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(300),
            jitter: Duration::ZERO,
        }
    }

    /// Computes the delay to apply before the given reconnect attempt.
    ///
    /// `attempt` is 1-based: attempt 1 waits `initial_backoff`.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        self.base_delay(attempt) + jitter_duration(self.jitter, attempt)
    }

    fn base_delay(&self, attempt: usize) -> Duration {
        let mut delay = std::cmp::min(self.initial_backoff, self.max_backoff);
        for _ in 1..attempt {
            delay = std::cmp::min(delay.saturating_mul(2), self.max_backoff);
        }
        delay
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::reconnect()
    }
}

/// Running backoff state for one reconnect loop.
#[derive(Clone, Debug)]
pub struct Backoff {
    policy: BackoffPolicy,
    attempt: usize,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self { policy, attempt: 1 }
    }

    /// Delay the next scheduled reconnect will wait, without consuming it.
    pub fn current(&self) -> Duration {
        self.policy.delay_for_attempt(self.attempt)
    }

    /// Returns the current delay and doubles it for the following failure.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current();
        debug!(
            event = "backoff_advanced",
            attempt = self.attempt,
            delay_ms = delay.as_millis() as u64
        );
        // Growth stops once the cap is reached; the counter only needs to get there.
        if self.attempt < MAX_TRACKED_ATTEMPT
            && self.policy.base_delay(self.attempt) < self.policy.max_backoff
        {
            self.attempt += 1;
        }
        delay
    }

    /// Resets the delay to the policy's initial value.
    pub fn reset(&mut self) {
        self.attempt = 1;
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }
}

/// Applies a timeout to an async computation.
pub async fn with_timeout<T, Fut>(
    timeout: Duration,
    future: Fut,
) -> Result<T, tokio::time::error::Elapsed>
where
    Fut: Future<Output = T>,
{
    tokio::time::timeout(timeout, future).await
}

fn jitter_duration(max_jitter: Duration, attempt: usize) -> Duration {
    if max_jitter.is_zero() {
        return Duration::ZERO;
    }

    let limit_nanos = max_jitter.as_nanos().min(u64::MAX as u128) as u64;
    if limit_nanos == 0 {
        return Duration::ZERO;
    }

    let now_nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos() as u64;
    let mixed = now_nanos ^ ((attempt as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15));
    Duration::from_nanos(mixed % (limit_nanos + 1))
}
