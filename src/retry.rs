//! Retry utilities: the shared backoff policy and its backon builders.
//!
//! One `RetryPolicy` instance is built from config and reused by the outbox
//! publisher (attempt scheduling) and the stream bridge (reconnect schedule),
//! so backoff behavior is tuned in exactly one place.

use std::time::Duration;

use backon::ExponentialBuilder;
use serde::Deserialize;

/// Exponential backoff parameters shared across the crate.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Attempt ceiling; exceeding it dead-letters an outbox record.
    pub max_attempts: u32,
    /// First retry delay.
    pub base_delay: Duration,
    /// Cap applied to every computed delay.
    pub max_delay: Duration,
    /// Randomize sleeps to avoid thundering herds.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Bounded backoff builder for operations with an attempt ceiling.
    pub fn backoff(&self) -> ExponentialBuilder {
        let builder = ExponentialBuilder::default()
            .with_min_delay(self.base_delay)
            .with_max_delay(self.max_delay)
            .with_max_times(self.max_attempts as usize);
        if self.jitter {
            builder.with_jitter()
        } else {
            builder
        }
    }

    /// Reconnect schedule for loops that must survive backend restarts.
    ///
    /// Callers iterate the built schedule and fall back to `max_delay` once
    /// it runs out; reset the iterator after a healthy cycle.
    pub fn reconnect(&self) -> ExponentialBuilder {
        self.backoff()
    }

    /// Deterministic delay for a given zero-based attempt number.
    ///
    /// Used to compute `next_attempt_at` for persisted outbox retries, where
    /// the value must be stable enough to reason about in tests. Replica
    /// de-synchronization comes from the claim itself (`SKIP LOCKED`), not
    /// from jitter here.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = self.base_delay.saturating_mul(1u32 << attempt.min(20));
        delay.min(self.max_delay)
    }

    /// Whether `retry_count` failures exhaust this policy.
    pub fn exhausted(&self, retry_count: u32) -> bool {
        retry_count >= self.max_attempts
    }
}

/// Serde-facing shape of the policy, delays in milliseconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            base_delay_ms: policy.base_delay.as_millis() as u64,
            max_delay_ms: policy.max_delay.as_millis() as u64,
            jitter: policy.jitter,
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter: config.jitter,
        }
    }
}
