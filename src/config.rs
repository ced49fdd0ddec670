use std::time::Duration;
use thiserror::Error;
use url::Url;

pub const DEFAULT_URL: &str = "ws://localhost:3001";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("relay URL must use the ws scheme, got {0:?}")]
    UnsupportedScheme(String),

    #[error("max message size must be greater than 0")]
    InvalidMaxMessageSize,

    #[error("ping interval and ping timeout must be greater than 0")]
    InvalidKeepalive,
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub url: Url,

    // Timing
    pub retry_delay: Duration,
    pub open_timeout: Duration,
    pub close_timeout: Duration,
    pub ping_interval: Duration,
    pub ping_timeout: Duration,

    // Messages
    pub max_message_size: usize,
}

impl RelayConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.url.scheme() != "ws" {
            return Err(ConfigError::UnsupportedScheme(self.url.scheme().into()));
        }

        if self.max_message_size == 0 {
            return Err(ConfigError::InvalidMaxMessageSize);
        }

        if self.ping_interval.is_zero() || self.ping_timeout.is_zero() {
            return Err(ConfigError::InvalidKeepalive);
        }

        Ok(())
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            retry_delay: default_retry_delay(),
            open_timeout: default_open_timeout(),
            close_timeout: default_close_timeout(),
            ping_interval: default_ping_interval(),
            ping_timeout: default_ping_timeout(),
            max_message_size: default_max_message_size(),
        }
    }
}

fn default_url() -> Url {
    Url::parse(DEFAULT_URL).expect("DEFAULT_URL is a valid URL")
}

fn default_retry_delay() -> Duration {
    Duration::from_secs(5)
}

fn default_open_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_close_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_ping_interval() -> Duration {
    Duration::from_secs(20)
}

fn default_ping_timeout() -> Duration {
    Duration::from_secs(20)
}

fn default_max_message_size() -> usize {
    1024 * 1024
}
