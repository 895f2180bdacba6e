//! Event service configuration

use std::time::Duration;

use chatpipe_stream::RecordDefaults;

use crate::error::{Error, Result};

/// Configuration for [`crate::EventService`]
#[derive(Debug, Clone)]
pub struct EventServiceConfig {
    /// URL of the server's event endpoint
    pub events_url: String,
    /// Reconnects tried after a lost connection before giving up
    pub max_reconnect_attempts: u32,
    /// Reconnect `n` waits `n * reconnect_delay`
    pub reconnect_delay: Duration,
    /// Idle time with no connection reasons before the service closes
    pub idle_timeout: Duration,
    /// Defaults for records rebuilt from `completion` events
    pub defaults: RecordDefaults,
}

impl Default for EventServiceConfig {
    fn default() -> Self {
        Self {
            events_url: "http://localhost:8080/events".to_string(),
            max_reconnect_attempts: 3,
            reconnect_delay: Duration::from_secs(1),
            idle_timeout: Duration::from_secs(60),
            defaults: RecordDefaults::default(),
        }
    }
}

impl EventServiceConfig {
    pub fn new(events_url: impl Into<String>) -> Self {
        Self {
            events_url: events_url.into(),
            ..Default::default()
        }
    }

    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Delay before reconnect number `attempt` (1-based)
    pub fn reconnect_delay_for(&self, attempt: u32) -> Duration {
        self.reconnect_delay.saturating_mul(attempt)
    }

    pub fn validate(&self) -> Result<()> {
        if self.events_url.trim().is_empty() {
            return Err(Error::InvalidConfig("events_url is empty".to_string()));
        }
        if self.idle_timeout.is_zero() {
            return Err(Error::InvalidConfig("idle_timeout must be greater than zero".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_reconnect_delay() {
        let config = EventServiceConfig::default();
        assert_eq!(config.reconnect_delay_for(1), Duration::from_secs(1));
        assert_eq!(config.reconnect_delay_for(3), Duration::from_secs(3));
        assert_eq!(config.max_reconnect_attempts, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate() {
        assert!(EventServiceConfig::new("").validate().is_err());
        let config = EventServiceConfig::default().with_idle_timeout(Duration::ZERO);
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }
}
