use std::time::Duration;

use authrpc_core::AmqpConfig;

/// Bounded exponential backoff for the initial broker connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl ReconnectPolicy {
    #[must_use]
    pub fn from_config(config: &AmqpConfig) -> Self {
        Self {
            max_attempts: config.connect_attempts.max(1),
            initial_backoff: Duration::from_millis(config.connect_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }

    /// Delay after the `attempt`-th failure (1-based), doubling each time.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.initial_backoff
            .saturating_mul(1 << exponent)
            .min(self.max_backoff)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from_config(&AmqpConfig::new("", "", ""))
    }
}
