//! Configuration file support

use chatpipe_session::EventServiceConfig;
use chatpipe_stream::{ClientConfig, HeartbeatConfig, RecordDefaults, RetryConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for chatpipe. Durations are in milliseconds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server base URL
    pub server: Option<String>,
    /// Path of the chat endpoint
    pub chat_path: Option<String>,
    /// Path of the event endpoint
    pub events_path: Option<String>,
    /// Model version sent with each prompt
    pub version: Option<String>,
    /// Model name used when the server omits one
    pub model: Option<String>,
    #[serde(default)]
    pub timeouts: Timeouts,
    #[serde(default)]
    pub retry: Retry,
    #[serde(default)]
    pub events: Events,
}

/// Stream timing
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    pub request_ms: Option<u64>,
    pub read_ms: Option<u64>,
    pub heartbeat_interval_ms: Option<u64>,
    pub progress_cooldown_ms: Option<u64>,
    pub max_inactive_ms: Option<u64>,
}

/// Request retries
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Retry {
    pub max_retries: Option<u32>,
    pub initial_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
}

/// Event service
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Events {
    pub max_reconnect_attempts: Option<u32>,
    pub reconnect_delay_ms: Option<u64>,
    pub idle_timeout_ms: Option<u64>,
}

fn millis(value: Option<u64>, default: Duration) -> Duration {
    value.map(Duration::from_millis).unwrap_or(default)
}

impl Config {
    /// Get the config directory
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("chatpipe")
    }

    /// Get the config file path
    pub fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var("CHATPIPE_CONFIG_PATH") {
            return PathBuf::from(path);
        }
        Self::config_dir().join("config.toml")
    }

    /// Load config from file
    pub fn load() -> Self {
        let path = Self::config_path();
        if !path.exists() {
            return Self::default();
        }

        match fs::read_to_string(&path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("Warning: Failed to parse config file: {}", e);
                    Self::default()
                }
            },
            Err(e) => {
                eprintln!("Warning: Failed to read config file: {}", e);
                Self::default()
            }
        }
    }

    /// Save config to file
    pub fn save(&self) -> std::io::Result<()> {
        let path = Self::config_path();
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }

        let content = toml::to_string_pretty(self).map_err(std::io::Error::other)?;
        fs::write(path, content)
    }

    /// Create a default config file if it doesn't exist
    pub fn init() -> std::io::Result<PathBuf> {
        let path = Self::config_path();
        if path.exists() {
            return Ok(path);
        }

        let default_config = Config {
            server: Some("http://localhost:8080".to_string()),
            version: Some("1.0.0".to_string()),
            ..Default::default()
        };

        default_config.save()?;
        Ok(path)
    }

    /// Server URL: flag, then `CHATPIPE_SERVER`, then file, then default
    pub fn server(&self, flag: Option<&str>) -> String {
        flag.map(str::to_string)
            .or_else(|| std::env::var("CHATPIPE_SERVER").ok().filter(|s| !s.is_empty()))
            .or_else(|| self.server.clone())
            .unwrap_or_else(|| ClientConfig::default().base_url)
    }

    /// Model version: flag, then file, then the record default
    pub fn version(&self, flag: Option<&str>) -> String {
        flag.map(str::to_string)
            .or_else(|| self.version.clone())
            .unwrap_or_else(|| RecordDefaults::default().version)
    }

    /// Pipeline configuration against `server`
    pub fn client_config(&self, server: &str) -> ClientConfig {
        let base = ClientConfig::default();
        let heartbeat = HeartbeatConfig {
            interval: millis(self.timeouts.heartbeat_interval_ms, base.heartbeat.interval),
            max_inactive: millis(self.timeouts.max_inactive_ms, base.heartbeat.max_inactive),
            progress_cooldown: millis(
                self.timeouts.progress_cooldown_ms,
                base.heartbeat.progress_cooldown,
            ),
        };
        let retry = RetryConfig {
            max_retries: self.retry.max_retries.unwrap_or(base.retry.max_retries),
            initial_delay: millis(self.retry.initial_delay_ms, base.retry.initial_delay),
            max_delay: millis(self.retry.max_delay_ms, base.retry.max_delay),
            ..base.retry.clone()
        };
        let mut defaults = base.defaults.clone();
        if let Some(model) = &self.model {
            defaults.model = model.clone();
        }

        ClientConfig::new(server)
            .with_chat_path(self.chat_path.clone().unwrap_or(base.chat_path))
            .with_request_timeout(millis(self.timeouts.request_ms, base.request_timeout))
            .with_read_timeout(millis(self.timeouts.read_ms, base.read_timeout))
            .with_heartbeat(heartbeat)
            .with_retry_config(retry)
            .with_defaults(defaults)
    }

    /// Event service configuration against `server`
    pub fn event_config(&self, server: &str) -> EventServiceConfig {
        let base = EventServiceConfig::default();
        let path = self.events_path.as_deref().unwrap_or("/events");
        let mut config = EventServiceConfig::new(format!(
            "{}/{}",
            server.trim_end_matches('/'),
            path.trim_start_matches('/')
        ))
        .with_max_reconnect_attempts(
            self.events
                .max_reconnect_attempts
                .unwrap_or(base.max_reconnect_attempts),
        )
        .with_reconnect_delay(millis(self.events.reconnect_delay_ms, base.reconnect_delay))
        .with_idle_timeout(millis(self.events.idle_timeout_ms, base.idle_timeout));
        if let Some(model) = &self.model {
            config.defaults.model = model.clone();
        }
        config
    }
}

/// Generate example config content
pub fn example_config() -> &'static str {
    r#"# chatpipe configuration file
# Place at ~/.config/chatpipe/config.toml (Linux/Mac) or %APPDATA%\chatpipe\config.toml (Windows)
# or point CHATPIPE_CONFIG_PATH at it. All durations are in milliseconds.

# Server base URL (CHATPIPE_SERVER overrides)
server = "http://localhost:8080"

# Model version sent with each prompt
version = "1.0.0"

# chat_path = "/api/chat"
# events_path = "/events"
# model = "DiModel"

[timeouts]
# request_ms = 300000
# read_ms = 60000
# heartbeat_interval_ms = 30000
# progress_cooldown_ms = 15000
# max_inactive_ms = 600000

[retry]
# max_retries = 2
# initial_delay_ms = 2000
# max_delay_ms = 60000

[events]
# max_reconnect_attempts = 3
# reconnect_delay_ms = 1000
# idle_timeout_ms = 60000
"#
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_example_config_parses() {
        let config: Config = toml::from_str(example_config()).unwrap();
        assert_eq!(config.server.as_deref(), Some("http://localhost:8080"));
        assert_eq!(config.version(Some("2.0.0")), "2.0.0");
        assert_eq!(config.version(None), "1.0.0");
    }

    #[test]
    fn test_durations_in_millis() {
        let config: Config = toml::from_str(
            r#"
            chat_path = "/v2/chat"
            model = "Other"

            [timeouts]
            read_ms = 1500
            max_inactive_ms = 90000

            [retry]
            max_retries = 5

            [events]
            idle_timeout_ms = 5000
            "#,
        )
        .unwrap();

        let client = config.client_config("http://srv:1");
        assert_eq!(client.chat_url(), "http://srv:1/v2/chat");
        assert_eq!(client.read_timeout, Duration::from_millis(1500));
        assert_eq!(client.heartbeat.max_inactive, Duration::from_secs(90));
        assert_eq!(client.heartbeat.interval, Duration::from_secs(30));
        assert_eq!(client.retry.max_retries, 5);
        assert_eq!(client.retry.initial_delay, Duration::from_secs(2));
        assert_eq!(client.defaults.model, "Other");

        let events = config.event_config("http://srv:1/");
        assert_eq!(events.events_url, "http://srv:1/events");
        assert_eq!(events.idle_timeout, Duration::from_secs(5));
        assert_eq!(events.max_reconnect_attempts, 3);
    }

    #[test]
    fn test_server_flag_wins() {
        let config = Config {
            server: Some("http://from-file".into()),
            ..Default::default()
        };
        assert_eq!(config.server(Some("http://flag")), "http://flag");
    }
}
