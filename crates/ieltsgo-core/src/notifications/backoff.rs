//! Reconnect backoff for the notification stream
//!
//! Exponential: `min(base * 2^failures, max)`. Any liveness signal from the
//! server (connected, heartbeat, a parsed notification) resets it.

use std::time::Duration;

use crate::config::StreamSettings;

#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    base: Duration,
    max: Duration,
    failures: u32,
}

impl ReconnectPolicy {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: 0,
        }
    }

    pub fn from_settings(settings: &StreamSettings) -> Self {
        Self::new(settings.backoff_base(), settings.backoff_max())
    }

    /// Delay before the next retry, given the failures seen so far
    pub fn current_delay(&self) -> Duration {
        // 2^31 * base already overflows any sane cap
        let factor = 1u32 << self.failures.min(31);
        self.base.saturating_mul(factor).min(self.max)
    }

    /// Record a failed attempt and return how long to wait before retrying
    pub fn record_failure(&mut self) -> Duration {
        let delay = self.current_delay();
        self.failures = self.failures.saturating_add(1);
        delay
    }

    /// The link proved healthy
    pub fn reset(&mut self) {
        self.failures = 0;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from_settings(&StreamSettings::default())
    }
}
