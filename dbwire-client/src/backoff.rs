//! Retry classification and delay curves for transient server errors.
//!
//! Each retryable error code owns its own algorithm instance and retry
//! counter. The policy is reset at the start of every logical operation.

use crate::config::{ConnectionConfig, DEFAULT_MAX_RETRIES, DEFAULT_MAX_RETRY_DELAY};
use crate::error::ClientError;
use dbwire_protocol::ErrorCode;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::time::Duration;

/// Exponential delay curve: the n-th call yields `(2^n - 1) / 2` seconds.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffAlgorithm {
    max_retries: u32,
    max_delay: Duration,
    /// Counter increment per call.
    step: u32,
    /// Added to any delay shorter than itself.
    padding: Option<Duration>,
    counter: u32,
}

impl BackoffAlgorithm {
    pub fn new(max_retries: u32, max_delay: Duration) -> Self {
        Self {
            max_retries,
            max_delay,
            step: 1,
            padding: None,
            counter: 0,
        }
    }

    /// Advances the counter by `step` per call instead of one.
    pub fn with_step(mut self, step: u32) -> Self {
        self.step = step.max(1);
        self
    }

    /// Adds `padding` to delays shorter than it.
    pub fn with_padding(mut self, padding: Duration) -> Self {
        self.padding = Some(padding);
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    /// Returns the next delay, or `None` once the retry budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.counter = self.counter.saturating_add(self.step);
        if self.counter > self.max_retries {
            return None;
        }

        // 2^64 seconds is far past any cap.
        let mut delay = if self.counter >= 64 {
            self.max_delay
        } else {
            let secs = (2f64.powi(self.counter as i32) - 1.0) / 2.0;
            Duration::try_from_secs_f64(secs)
                .map_or(self.max_delay, |d| d.min(self.max_delay))
        };
        if let Some(padding) = self.padding {
            if delay < padding {
                delay += padding;
            }
        }
        Some(delay)
    }

    pub fn reset(&mut self) {
        self.counter = 0;
    }
}

impl Default for BackoffAlgorithm {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETRIES, DEFAULT_MAX_RETRY_DELAY)
    }
}

/// A user-supplied delay curve.
pub trait BackoffStrategy: Send {
    fn next_delay(&mut self) -> Option<Duration>;

    fn reset(&mut self);
}

/// The delay curve for one error code.
pub enum Backoff {
    Exponential(BackoffAlgorithm),
    Custom(Box<dyn BackoffStrategy>),
}

impl Backoff {
    pub fn custom(strategy: impl BackoffStrategy + 'static) -> Self {
        Backoff::Custom(Box::new(strategy))
    }

    fn next_delay(&mut self) -> Option<Duration> {
        match self {
            Backoff::Exponential(a) => a.next_delay(),
            Backoff::Custom(s) => s.next_delay(),
        }
    }

    fn reset(&mut self) {
        match self {
            Backoff::Exponential(a) => a.reset(),
            Backoff::Custom(s) => s.reset(),
        }
    }
}

impl fmt::Debug for Backoff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backoff::Exponential(a) => f.debug_tuple("Exponential").field(a).finish(),
            Backoff::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Counters for the current logical operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryStats {
    /// Number of times the operation ran.
    pub attempts: u32,
    /// Number of `next_delay` calls.
    pub delay_requests: u32,
    /// Sum of all delays handed out.
    pub total_delay: Duration,
}

/// Per-error-code retry policy.
#[derive(Debug)]
pub struct BackoffPolicy {
    algorithms: HashMap<ErrorCode, Backoff>,
    stats: RetryStats,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::with_limits(DEFAULT_MAX_RETRIES, DEFAULT_MAX_RETRY_DELAY)
    }
}

impl BackoffPolicy {
    /// Builds the standard table from a base retry count and delay cap.
    ///
    /// Lock waits and deadlocks get twice the retries; "too many
    /// connections" also doubles its step and may wait up to 100 s; a lost
    /// connection never waits less than 10 s.
    pub fn with_limits(max_retries: u32, max_delay: Duration) -> Self {
        let base = BackoffAlgorithm::new(max_retries, max_delay);
        let doubled = BackoffAlgorithm::new(max_retries.saturating_mul(2), max_delay);

        let mut algorithms = HashMap::new();
        algorithms.insert(
            ErrorCode::TOO_MANY_CONNECTIONS,
            Backoff::Exponential(
                BackoffAlgorithm::new(max_retries.saturating_mul(2), Duration::from_secs(100))
                    .with_step(2),
            ),
        );
        algorithms.insert(ErrorCode::LOCK_WAIT_TIMEOUT, Backoff::Exponential(doubled.clone()));
        algorithms.insert(ErrorCode::DEADLOCK, Backoff::Exponential(doubled));
        algorithms.insert(ErrorCode::XA_DEADLOCK, Backoff::Exponential(base.clone()));
        algorithms.insert(ErrorCode::SERVER_GONE_AWAY, Backoff::Exponential(base.clone()));
        algorithms.insert(
            ErrorCode::LOST_CONNECTION,
            Backoff::Exponential(base.with_padding(Duration::from_secs(10))),
        );

        Self {
            algorithms,
            stats: RetryStats::default(),
        }
    }

    pub fn from_config(config: &ConnectionConfig) -> Self {
        Self::with_limits(config.max_retries, config.max_retry_delay)
    }

    /// Replaces (or adds) the curve for `code`, making it retryable.
    pub fn with_algorithm(mut self, code: impl Into<ErrorCode>, backoff: Backoff) -> Self {
        self.algorithms.insert(code.into(), backoff);
        self
    }

    /// Returns whether `error` is a server error with a retry curve.
    pub fn should_retry(&self, error: &ClientError) -> bool {
        error
            .server_code()
            .is_some_and(|code| self.algorithms.contains_key(&code))
    }

    /// Advances the curve for `error`'s code and returns the delay, or
    /// `None` to stop.
    pub fn next_delay(&mut self, error: &ClientError) -> Option<Duration> {
        self.stats.delay_requests += 1;
        let backoff = self.algorithms.get_mut(&error.server_code()?)?;
        let delay = backoff.next_delay()?;
        self.stats.total_delay += delay;
        Some(delay)
    }

    /// Resets every curve and the statistics.
    pub fn reset(&mut self) {
        for backoff in self.algorithms.values_mut() {
            backoff.reset();
        }
        self.stats = RetryStats::default();
    }

    pub fn stats(&self) -> RetryStats {
        self.stats
    }

    pub(crate) fn record_attempt(&mut self) {
        self.stats.attempts += 1;
    }

    /// Sleeps before the next attempt. Returns `false` when `error` must be
    /// surfaced instead.
    pub(crate) async fn wait_for_retry(&mut self, error: &ClientError) -> bool {
        if !self.should_retry(error) {
            return false;
        }
        match self.next_delay(error) {
            Some(delay) => {
                tracing::warn!(
                    error = %error,
                    attempt = self.stats.attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Transient error, retrying"
                );
                tokio::time::sleep(delay).await;
                true
            }
            None => {
                tracing::warn!(error = %error, attempts = self.stats.attempts, "Retry budget exhausted");
                false
            }
        }
    }

    /// Runs `op` until it succeeds, fails permanently, or the retry budget
    /// for its error code runs out.
    pub async fn run<T, F, Fut>(&mut self, mut op: F) -> Result<T, ClientError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ClientError>>,
    {
        self.reset();
        loop {
            self.record_attempt();
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if !self.wait_for_retry(&err).await {
                        return Err(err);
                    }
                }
            }
        }
    }
}
