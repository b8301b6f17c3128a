//! Client configuration.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Sync endpoint, without query string.
    pub url: String,
    /// Identifies this device to the server; sent as `sessionId`.
    pub session_id: String,
    /// Quiet period before local changes are pushed.
    pub debounce: Duration,
    /// First reconnect delay after a failed attempt.
    pub initial_backoff: Duration,
    /// Multiplier applied to the delay after each failed attempt.
    pub backoff_factor: f64,
    /// How long a leadership lease stays valid without renewal.
    pub lease_ttl: Duration,
    /// Lease renewal / leadership check interval.
    pub heartbeat: Duration,
}

impl ClientConfig {
    pub fn new(url: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            session_id: session_id.into(),
            ..Self::default()
        }
    }

    /// URL the transport connects to.
    pub fn sync_url(&self) -> String {
        let separator = if self.url.contains('?') { '&' } else { '?' };
        format!("{}{}sessionId={}", self.url, separator, self.session_id)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:3000/sync".to_string(),
            session_id: String::new(),
            debounce: Duration::from_millis(50),
            initial_backoff: Duration::from_millis(500),
            backoff_factor: 1.5,
            lease_ttl: Duration::from_secs(5),
            heartbeat: Duration::from_secs(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_url_carries_session() {
        let config = ClientConfig::new("ws://example.test/sync", "abc");
        assert_eq!(config.sync_url(), "ws://example.test/sync?sessionId=abc");

        let config = ClientConfig::new("ws://example.test/sync?v=1", "abc");
        assert_eq!(config.sync_url(), "ws://example.test/sync?v=1&sessionId=abc");
    }

    #[test]
    fn defaults_match_reconnect_policy() {
        let config = ClientConfig::default();
        assert_eq!(config.initial_backoff, Duration::from_millis(500));
        assert_eq!(config.backoff_factor, 1.5);
        assert!(config.lease_ttl > config.heartbeat);
    }
}
