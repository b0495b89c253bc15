// SPDX-License-Identifier: MIT

//! Retry policy for failed step attempts
//!
//! A failure is retried when it is classified retryable and the step still
//! has attempts left. The delay before attempt `k + 1` grows exponentially
//! from `base_delay`, is capped at `max_delay`, and carries random jitter so
//! steps that fail together do not retry in lockstep.

use std::time::Duration;

use crate::sdk::step::StepError;

/// Exponential backoff retry policy. Attempts are 1-based and always bounded.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    multiplier: f64,
    max_delay: Duration,
    jitter: f64,
    retry_timeouts: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_secs(5),
            jitter: 0.25,
            retry_timeouts: true,
        }
    }
}

impl RetryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total attempts including the first; clamped to at least one
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Growth factor per attempt; values below 1.0 are raised to 1.0
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = if multiplier.is_finite() {
            multiplier.max(1.0)
        } else {
            1.0
        };
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Jitter as a fraction of the nominal delay, clamped to `[0, 1]`
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = if jitter.is_finite() {
            jitter.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self
    }

    pub fn with_retry_timeouts(mut self, retry_timeouts: bool) -> Self {
        self.retry_timeouts = retry_timeouts;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn retry_timeouts(&self) -> bool {
        self.retry_timeouts
    }

    /// Whether a failure on `attempt` should be followed by another attempt
    pub fn should_retry(&self, error: &StepError, attempt: u32) -> bool {
        self.should_retry_within(error, attempt, self.max_attempts)
    }

    /// Same as `should_retry` with a step-specific attempt budget
    pub fn should_retry_within(&self, error: &StepError, attempt: u32, max_attempts: u32) -> bool {
        error.is_retryable(self.retry_timeouts) && attempt < max_attempts.max(1)
    }

    /// Delay before retrying after failed `attempt`, without jitter.
    /// Non-decreasing in `attempt` and never above `max_delay`.
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let factor = self.multiplier.powi(exponent);
        let secs = self.base_delay.as_secs_f64() * factor;
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// Delay before retrying after failed `attempt`, with jitter in
    /// `[0, jitter * nominal]` added and the result capped at `max_delay`
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let nominal = self.nominal_delay(attempt);
        if self.jitter == 0.0 {
            return nominal;
        }
        let spread = nominal.as_secs_f64() * self.jitter * rand::random::<f64>();
        (nominal + Duration::from_secs_f64(spread)).min(self.max_delay)
    }
}
