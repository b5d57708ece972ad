//! Configuration types for the driftq reader

use std::time::Duration;

/// Reader configuration
///
/// The defaults are conservative: one message in flight, linear requeue
/// backoff capped at fifteen minutes, and a read deadline comfortably above
/// the broker's heartbeat cadence.
#[derive(Debug, Clone)]
pub struct ReaderConfig {
    /// Global ceiling on unacknowledged messages across all connections
    pub max_in_flight: i64,
    /// Attempts after which a failing message is given up on (0 disables)
    pub max_attempt_count: u16,
    /// Seconds between lookup directory polls (jittered by up to 10%)
    pub lookup_poll_interval: Duration,
    /// Base requeue delay; scaled linearly by the attempt count
    pub default_requeue_delay: Duration,
    /// Upper bound on any single requeue delay
    pub max_requeue_delay: Duration,
    /// Deadline for establishing a TCP connection
    pub dial_timeout: Duration,
    /// Deadline applied to every socket read; must exceed the broker's
    /// heartbeat interval
    pub read_timeout: Duration,
    /// Deadline applied to every socket write
    pub write_timeout: Duration,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 1,
            max_attempt_count: 5,
            lookup_poll_interval: Duration::from_secs(120),
            default_requeue_delay: Duration::from_secs(90),
            max_requeue_delay: Duration::from_secs(15 * 60),
            dial_timeout: Duration::from_secs(1),
            read_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(1),
        }
    }
}

impl ReaderConfig {
    pub fn builder() -> ReaderConfigBuilder {
        ReaderConfigBuilder::new()
    }
}

/// Builder for [`ReaderConfig`]
#[derive(Debug, Default)]
pub struct ReaderConfigBuilder {
    config: ReaderConfig,
}

impl ReaderConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_in_flight(mut self, max_in_flight: i64) -> Self {
        self.config.max_in_flight = max_in_flight;
        self
    }

    pub fn max_attempt_count(mut self, attempts: u16) -> Self {
        self.config.max_attempt_count = attempts;
        self
    }

    pub fn lookup_poll_interval(mut self, interval: Duration) -> Self {
        self.config.lookup_poll_interval = interval;
        self
    }

    pub fn default_requeue_delay(mut self, delay: Duration) -> Self {
        self.config.default_requeue_delay = delay;
        self
    }

    pub fn max_requeue_delay(mut self, delay: Duration) -> Self {
        self.config.max_requeue_delay = delay;
        self
    }

    pub fn dial_timeout(mut self, timeout: Duration) -> Self {
        self.config.dial_timeout = timeout;
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.config.read_timeout = timeout;
        self
    }

    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.config.write_timeout = timeout;
        self
    }

    pub fn build(self) -> ReaderConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ReaderConfig::default();
        assert_eq!(config.max_in_flight, 1);
        assert_eq!(config.max_attempt_count, 5);
        assert_eq!(config.lookup_poll_interval, Duration::from_secs(120));
        assert!(config.read_timeout > Duration::from_secs(30));
    }

    #[test]
    fn test_builder() {
        let config = ReaderConfig::builder()
            .max_in_flight(200)
            .max_attempt_count(3)
            .default_requeue_delay(Duration::from_secs(1))
            .build();

        assert_eq!(config.max_in_flight, 200);
        assert_eq!(config.max_attempt_count, 3);
        assert_eq!(config.default_requeue_delay, Duration::from_secs(1));
    }
}
