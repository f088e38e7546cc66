/// Retry controller for transient stream errors.
///
/// Only errors classified transient (rate limit, 5xx, network) are eligible;
/// cancellation and permanent errors give up immediately. Backoff doubles
/// from `base_delay` up to `max_delay`, honoring an explicit retry-after
/// hint when the provider sent one.
use std::time::Duration;

use crate::error::AgentError;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { attempt: u32, delay: Duration },
    GiveUp,
}

/// Per-turn retry state. Reset when a stream attempt succeeds.
#[derive(Debug)]
pub struct RetryController {
    config: RetryConfig,
    attempt: u32,
}

impl RetryController {
    pub fn new(config: RetryConfig) -> Self {
        Self { config, attempt: 0 }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Classify an error and decide whether to retry.
    pub fn decide(&mut self, error: &AgentError) -> RetryDecision {
        if !error.is_retryable() || self.attempt >= self.config.max_retries {
            return RetryDecision::GiveUp;
        }
        self.attempt += 1;
        RetryDecision::Retry {
            attempt: self.attempt,
            delay: self.delay_for(self.attempt, error),
        }
    }

    /// A successful attempt resets the budget for the rest of the turn.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    fn delay_for(&self, attempt: u32, error: &AgentError) -> Duration {
        if let Some(hint) = error.retry_after() {
            return hint.min(self.config.max_delay);
        }
        let base = self.config.base_delay.as_millis() as f64;
        let delay = base * self.config.multiplier.powi(attempt.saturating_sub(1) as i32);
        Duration::from_millis(delay as u64).min(self.config.max_delay)
    }
}
