//! Exponential backoff state for export retries.

use std::time::Duration;

use crate::config::PipelineConfig;

/// Retry limits taken from [`PipelineConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// total attempts, first attempt included
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_attempts,
            initial_backoff,
            max_backoff,
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(
            config.max_retry_attempts,
            config.initial_backoff,
            config.max_backoff,
        )
    }

    pub fn backoff(&self) -> Backoff {
        Backoff {
            policy: *self,
            attempt: 0,
            next_delay: self.initial_backoff,
        }
    }
}

/// Progress of one retry loop.
///
/// The delay doubles after every failed attempt and is capped at
/// `max_backoff`; there is no jitter so the schedule is reproducible.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    attempt: u32,
    next_delay: Duration,
}

impl Backoff {
    /// Attempts started so far.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Count the start of an attempt; `false` once the budget is spent.
    pub fn start_attempt(&mut self) -> bool {
        if self.attempt >= self.policy.max_attempts {
            return false;
        }
        self.attempt += 1;
        true
    }

    /// Delay to wait before the next attempt, or `None` when no attempt is left.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.policy.max_attempts {
            return None;
        }
        let delay = self.next_delay;
        self.next_delay = std::cmp::min(delay.saturating_mul(2), self.policy.max_backoff);
        Some(delay)
    }
}
