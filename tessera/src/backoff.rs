//! Retry pacing for transient refresh failures

use std::time::Duration;

/// Configuration for how quickly to retry after transient failures
#[derive(Clone, Copy, Debug)]
pub struct BackoffConfig {
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: u32,
}

impl Default for BackoffConfig {
    /// Default backoff configuration
    ///
    /// Starts at 100 ms, doubling on each consecutive failure, capped at
    /// 15 seconds.
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(15),
            multiplier: 2,
        }
    }
}

impl BackoffConfig {
    /// Constructs a new configuration
    ///
    /// The first failure waits `initial_delay`; each consecutive failure
    /// multiplies the wait by `multiplier`, capped at `max_delay`.
    pub fn new(initial_delay: Duration, max_delay: Duration, multiplier: u32) -> Self {
        Self {
            initial_delay,
            max_delay,
            multiplier,
        }
    }
}

/// Tracks consecutive failures and yields the next retry delay
#[derive(Debug)]
pub struct RetryBackoff {
    config: BackoffConfig,
    current: Option<Duration>,
}

impl RetryBackoff {
    /// Constructs a fresh tracker from a configuration
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            current: None,
        }
    }

    /// Forgets any accumulated failures
    pub fn reset(&mut self) {
        self.current = None;
    }

    /// Records another failure and returns how long to wait before retrying
    pub fn advance(&mut self) -> Duration {
        let next = match self.current {
            None => self.config.initial_delay,
            Some(last) => (last * self.config.multiplier).min(self.config.max_delay),
        };
        self.current = Some(next);
        next
    }
}

impl From<BackoffConfig> for RetryBackoff {
    fn from(config: BackoffConfig) -> Self {
        Self::new(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_grow_until_the_cap() {
        let mut backoff = RetryBackoff::new(BackoffConfig::new(
            Duration::from_millis(100),
            Duration::from_millis(350),
            2,
        ));

        assert_eq!(backoff.advance(), Duration::from_millis(100));
        assert_eq!(backoff.advance(), Duration::from_millis(200));
        assert_eq!(backoff.advance(), Duration::from_millis(350));
        assert_eq!(backoff.advance(), Duration::from_millis(350));
    }

    #[test]
    fn reset_starts_the_ladder_over() {
        let mut backoff = RetryBackoff::new(BackoffConfig::default());

        backoff.advance();
        backoff.advance();
        backoff.reset();

        assert_eq!(backoff.advance(), Duration::from_millis(100));
    }
}
