//! Reconnect policy with capped exponential backoff.

use std::time::Duration;

use crate::types::TimingConfig;

/// Tracks consecutive reconnect attempts for one session.
///
/// The counter is only reset by a successful authentication (or an explicit
/// teardown), never by a bare socket open.
#[derive(Debug, Clone)]
pub(crate) struct ReconnectPolicy {
    base_delay: Duration,
    max_delay: Duration,
    max_attempts: u32,
    attempts: u32,
}

impl ReconnectPolicy {
    pub(crate) fn new(timing: &TimingConfig) -> Self {
        Self {
            base_delay: timing.reconnect_base_delay,
            max_delay: timing.reconnect_max_delay,
            max_attempts: timing.max_reconnect_attempts,
            attempts: 0,
        }
    }

    pub(crate) fn attempts(&self) -> u32 {
        self.attempts
    }

    pub(crate) fn is_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    /// Delay for a given attempt number: `min(base * 2^attempt, max)`.
    pub(crate) fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Count one more attempt and return its delay, or `None` once the
    /// ceiling has been reached.
    pub(crate) fn next_delay(&mut self) -> Option<Duration> {
        if self.is_exhausted() {
            return None;
        }
        self.attempts += 1;
        Some(self.delay_for_attempt(self.attempts))
    }

    pub(crate) fn reset(&mut self) {
        self.attempts = 0;
    }
}
