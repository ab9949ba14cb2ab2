//! Backoff and retry utilities.
//!
//! `ReconnectPolicy` and `ReconnectState` drive the stream client's automatic
//! reconnect sequence. `RetryPolicy` and [`retry_async`] cover short-lived
//! REST calls that are retried in place.

use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::debug;

/// Bounded exponential backoff for automatic reconnects.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Consecutive failures after which automatic reconnects stop.
    pub max_attempts: u32,
    /// Delay before the first retry. Doubles for every further retry.
    pub base_delay: Duration,
}

impl ReconnectPolicy {
    /// Delay before retry `attempt` (1-based): `base_delay * 2^(attempt - 1)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay.saturating_mul(1u32 << exponent)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(1000),
        }
    }
}

/// What to do after a connection failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// Schedule retry number `attempt` after `delay`.
    Retry { attempt: u32, delay: Duration },
    /// Budget exhausted after `attempts` consecutive failures.
    GiveUp { attempts: u32 },
}

/// Consecutive-failure counter for the automatic reconnect sequence.
#[derive(Clone, Debug, Default)]
pub struct ReconnectState {
    failures: u32,
}

impl ReconnectState {
    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn is_exhausted(&self, policy: &ReconnectPolicy) -> bool {
        self.failures >= policy.max_attempts
    }

    /// Records one failed connection and decides on the next step.
    ///
    /// Once exhausted the counter stays pinned at `max_attempts`.
    pub fn record_failure(&mut self, policy: &ReconnectPolicy) -> ReconnectDecision {
        if self.is_exhausted(policy) {
            return ReconnectDecision::GiveUp {
                attempts: self.failures,
            };
        }

        self.failures += 1;
        if self.failures >= policy.max_attempts {
            return ReconnectDecision::GiveUp {
                attempts: self.failures,
            };
        }

        ReconnectDecision::Retry {
            attempt: self.failures,
            delay: policy.delay_for_attempt(self.failures),
        }
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }
}

/// Retry policy for in-place request retries.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Maximum number of attempts including the first attempt.
    pub max_attempts: usize,
    /// Delay used before the first retry.
    pub initial_backoff: Duration,
    /// Upper bound for backoff growth.
    pub max_backoff: Duration,
    /// Maximum random jitter added to each retry delay.
    pub jitter: Duration,
}

impl RetryPolicy {
    /// A short policy for interactive requests such as login.
    pub fn interactive() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(400),
            jitter: Duration::from_millis(50),
        }
    }

    /// Delay before the retry that follows `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31) as u32;
        let delay = self
            .initial_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff);
        delay + jitter_duration(self.jitter)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::interactive()
    }
}

/// Runs `op` until it succeeds, `should_retry` rejects the error, or the
/// policy runs out of attempts.
///
/// `op` receives the 1-based attempt number.
pub async fn retry_async<T, E, Op, Fut, ShouldRetry>(
    policy: &RetryPolicy,
    mut op: Op,
    mut should_retry: ShouldRetry,
) -> Result<T, E>
where
    Op: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    ShouldRetry: FnMut(&E) -> bool,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        let error = match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };
        if attempt >= max_attempts || !should_retry(&error) {
            return Err(error);
        }

        let delay = policy.delay_for_attempt(attempt);
        debug!(
            event = "request_retry_scheduled",
            attempt,
            max_attempts,
            delay_ms = delay.as_millis() as u64
        );
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        attempt += 1;
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

fn jitter_duration(max_jitter: Duration) -> Duration {
    let limit_micros = max_jitter.as_micros().min(u64::MAX as u128) as u64;
    if limit_micros == 0 {
        return Duration::ZERO;
    }

    let seed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos() as u64;
    Duration::from_micros(seed.wrapping_mul(0x9E37_79B9_7F4A_7C15) % (limit_micros + 1))
}
