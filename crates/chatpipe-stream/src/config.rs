//! Client configuration

use std::time::Duration;

use crate::{
    error::{Error, Result},
    monitor::HeartbeatConfig,
    retry::RetryConfig,
};

/// Defaults applied to records when the server omits a field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordDefaults {
    pub model: String,
    pub version: String,
}

impl Default for RecordDefaults {
    fn default() -> Self {
        Self {
            model: "DiModel".to_string(),
            version: "1.0.0".to_string(),
        }
    }
}

/// Configuration for [`crate::ChatClient`]
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server base URL, e.g. `http://localhost:8080`
    pub base_url: String,
    /// Path of the chat endpoint
    pub chat_path: String,
    /// Limit for receiving response headers
    pub request_timeout: Duration,
    /// Limit for a single body read
    pub read_timeout: Duration,
    /// Whether a timed-out read refreshes the read loop's activity clock.
    /// Heartbeats and stalls are always measured from the last received bytes.
    pub read_timeout_counts_as_activity: bool,
    pub heartbeat: HeartbeatConfig,
    pub retry: RetryConfig,
    pub defaults: RecordDefaults,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            chat_path: "/api/chat".to_string(),
            request_timeout: Duration::from_secs(5 * 60),
            read_timeout: Duration::from_secs(60),
            read_timeout_counts_as_activity: true,
            heartbeat: HeartbeatConfig::default(),
            retry: RetryConfig::default(),
            defaults: RecordDefaults::default(),
        }
    }
}

impl ClientConfig {
    /// Default configuration pointed at `base_url`
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Default::default()
        }
    }

    pub fn with_chat_path(mut self, path: impl Into<String>) -> Self {
        self.chat_path = path.into();
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_read_timeout_counts_as_activity(mut self, counts: bool) -> Self {
        self.read_timeout_counts_as_activity = counts;
        self
    }

    pub fn with_heartbeat(mut self, heartbeat: HeartbeatConfig) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    pub fn with_retry_config(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_defaults(mut self, defaults: RecordDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    /// Full URL of the chat endpoint
    pub fn chat_url(&self) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            self.chat_path.trim_start_matches('/')
        )
    }

    /// Reject configurations the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.base_url.trim().is_empty() {
            return Err(Error::InvalidConfig("base_url is empty".to_string()));
        }
        let zero = [
            ("request_timeout", self.request_timeout),
            ("read_timeout", self.read_timeout),
            ("heartbeat.interval", self.heartbeat.interval),
            ("heartbeat.max_inactive", self.heartbeat.max_inactive),
        ]
        .into_iter()
        .find(|(_, d)| d.is_zero());
        if let Some((name, _)) = zero {
            return Err(Error::InvalidConfig(format!("{name} must be greater than zero")));
        }
        Ok(())
    }
}
