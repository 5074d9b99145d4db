//! Transaction configuration.

use std::time::Duration;

/// Retry and timeout settings applied to every transaction handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionConfig {
    /// First delay after a retriable commit or abort failure.
    pub initial_retry_delay: Duration,

    /// Upper bound of the doubling retry delay.
    pub max_retry_delay: Duration,

    /// Timeout used by [`Transaction::commit`](crate::Transaction::commit).
    pub default_commit_timeout: Duration,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            initial_retry_delay: Duration::from_millis(32),
            max_retry_delay: Duration::from_millis(4096),
            default_commit_timeout: Duration::from_secs(4),
        }
    }
}

impl TransactionConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the first retry delay.
    #[must_use]
    pub const fn initial_retry_delay(mut self, delay: Duration) -> Self {
        self.initial_retry_delay = delay;
        self
    }

    /// Sets the retry delay cap.
    #[must_use]
    pub const fn max_retry_delay(mut self, delay: Duration) -> Self {
        self.max_retry_delay = delay;
        self
    }

    /// Sets the default commit timeout.
    #[must_use]
    pub const fn default_commit_timeout(mut self, timeout: Duration) -> Self {
        self.default_commit_timeout = timeout;
        self
    }

    /// Delay to use after `current`: doubled, capped at `max_retry_delay`.
    #[must_use]
    pub fn next_retry_delay(&self, current: Duration) -> Duration {
        current.saturating_mul(2).min(self.max_retry_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = TransactionConfig::default();
        assert_eq!(config.initial_retry_delay, Duration::from_millis(32));
        assert_eq!(config.max_retry_delay, Duration::from_millis(4096));
        assert_eq!(config.default_commit_timeout, Duration::from_secs(4));
    }

    #[test]
    fn builder_pattern() {
        let config = TransactionConfig::new()
            .initial_retry_delay(Duration::from_millis(5))
            .max_retry_delay(Duration::from_millis(50))
            .default_commit_timeout(Duration::from_secs(1));

        assert_eq!(config.initial_retry_delay, Duration::from_millis(5));
        assert_eq!(config.max_retry_delay, Duration::from_millis(50));
        assert_eq!(config.default_commit_timeout, Duration::from_secs(1));
    }

    #[test]
    fn backoff_doubles_until_capped() {
        let config = TransactionConfig::default();
        let mut delay = config.initial_retry_delay;
        let mut observed = vec![delay.as_millis()];
        for _ in 0..10 {
            delay = config.next_retry_delay(delay);
            observed.push(delay.as_millis());
        }
        assert_eq!(
            observed,
            vec![32, 64, 128, 256, 512, 1024, 2048, 4096, 4096, 4096, 4096]
        );
    }
}
