//! Configuration management for the server.

use std::env;
use std::time::Duration;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host address
    pub host: String,
    /// Server port
    pub port: u16,
    /// How often delta logs are compacted
    pub compaction_interval: Duration,
    /// Deltas younger than this are never folded
    pub compaction_retention: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());

        let port = env::var("PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidPort)?;

        let compaction_interval = seconds_var("COMPACTION_INTERVAL_SECS", 300)?;
        let compaction_retention = seconds_var("COMPACTION_RETENTION_SECS", 86_400)?;

        Ok(Self {
            host,
            port,
            compaction_interval,
            compaction_retention,
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            compaction_interval: Duration::from_secs(300),
            compaction_retention: Duration::from_secs(86_400),
        }
    }
}

fn seconds_var(name: &'static str, default: u64) -> Result<Duration, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw
            .parse()
            .map(Duration::from_secs)
            .map_err(|_| ConfigError::InvalidNumber(name)),
        Err(_) => Ok(Duration::from_secs(default)),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid PORT value")]
    InvalidPort,

    #[error("{0} must be a whole number of seconds")]
    InvalidNumber(&'static str),
}
