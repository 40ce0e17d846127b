//! Connection retry budget and backoff.

use std::time::Duration;
use thiserror::Error;

/// Errors raised by [`RetryPolicy`].
#[derive(Debug, Error)]
pub enum RetryError {
    /// The backoff multiplier was not a finite non-negative number.
    #[error("backoff multiplier must be finite and at least 0 (got {0})")]
    InvalidBackoffMultiplier(f64),
    /// `retry` was called with no attempts remaining.
    #[error("maximum number of retries has been exceeded")]
    Exhausted,
}

/// Tracks how often and how soon a failed connection attempt may be retried.
///
/// Owned by exactly one connection attempt at a time; a configuration holds
/// a template and each attempt clones its own instance. The delay for the
/// first retry is the initial delay; every retry after that multiplies the
/// previous delay by the backoff multiplier.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_retries: u32,
    attempts_used: u32,
    current_delay: Duration,
    backoff_multiplier: f64,
}

impl RetryPolicy {
    /// Create a policy allowing `max_retries` retries after the initial
    /// attempt, starting at `initial_delay` between attempts.
    pub fn new(
        max_retries: u32,
        initial_delay: Duration,
        backoff_multiplier: f64,
    ) -> Result<Self, RetryError> {
        if !backoff_multiplier.is_finite() || backoff_multiplier < 0.0 {
            return Err(RetryError::InvalidBackoffMultiplier(backoff_multiplier));
        }
        Ok(Self {
            max_retries,
            attempts_used: 0,
            current_delay: initial_delay,
            backoff_multiplier,
        })
    }

    /// Whether another retry may still be attempted.
    pub fn has_attempt_remaining(&self) -> bool {
        self.attempts_used < self.max_retries
    }

    /// How many retries remain.
    pub fn remaining_count(&self) -> u32 {
        self.max_retries - self.attempts_used
    }

    /// How many retries have been consumed so far.
    pub fn attempts_used(&self) -> u32 {
        self.attempts_used
    }

    /// The delay to wait before the next attempt.
    pub fn current_delay(&self) -> Duration {
        self.current_delay
    }

    /// Consume one retry, advancing the backoff.
    ///
    /// The multiplier is applied starting from the second retry, so the
    /// first retry waits exactly the initial delay.
    pub fn retry(&mut self) -> Result<(), RetryError> {
        if !self.has_attempt_remaining() {
            return Err(RetryError::Exhausted);
        }
        if self.attempts_used > 0 {
            self.current_delay = self.current_delay.mul_f64(self.backoff_multiplier);
        }
        self.attempts_used += 1;
        Ok(())
    }
}
