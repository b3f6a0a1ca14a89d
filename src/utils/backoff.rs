use std::time::Duration;

/// Bounded-attempt exponential backoff. Pure: the delay is a function of
/// the attempt number, so stages can be tested without sleeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Ceiling for the computed delay
    pub max_delay: Duration,
    /// Attempts after which a job transitions to `Failed`
    pub max_attempts: u64,
}

impl BackoffPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration, max_attempts: u64) -> Self {
        Self { base_delay, max_delay, max_attempts }
    }

    /// Whether another attempt is allowed after `attempts` have been consumed.
    pub fn allows_retry(&self, attempts: u64) -> bool {
        attempts < self.max_attempts
    }

    /// Delay to wait before retry number `attempt` (1-based). Doubles per
    /// attempt, saturating at `max_delay`.
    pub fn delay_for(&self, attempt: u64) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as u32;
        let factor = 1u64 << exponent;
        let delay = self.base_delay.saturating_mul(factor as u32);
        delay.min(self.max_delay)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self { base_delay: Duration::from_secs(30), max_delay: Duration::from_secs(1800), max_attempts: 3 }
    }
}
