//! Tunables for the request supervisor and the change listener.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Deadline armed for every non-replication exchange.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(20);
/// Pause between the end of a change feed and the next connect.
pub const DEFAULT_RESTART_DELAY: Duration = Duration::from_millis(500);
pub const DEFAULT_HEARTBEAT_MS: u64 = 10_000;
pub const DEFAULT_FEED_TIMEOUT_MS: u64 = 60_000;
pub const DEFAULT_DOCUMENT_FILTER: &str = "app/docFilter";

/// Configuration shared by one `CouchDb` instance and its listeners.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Per-request deadline. Expiry triggers a silent resubmission.
    #[serde(with = "millis")]
    pub request_timeout: Duration,
    /// Delay before a change listener reconnects.
    #[serde(with = "millis")]
    pub listener_restart_delay: Duration,
    /// `heartbeat` query parameter of the change feed.
    pub heartbeat_ms: u64,
    /// `timeout` query parameter of the change feed.
    pub feed_timeout_ms: u64,
    /// Filter function used when a listener tracks a single document.
    pub document_filter: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            listener_restart_delay: DEFAULT_RESTART_DELAY,
            heartbeat_ms: DEFAULT_HEARTBEAT_MS,
            feed_timeout_ms: DEFAULT_FEED_TIMEOUT_MS,
            document_filter: DEFAULT_DOCUMENT_FILTER.to_string(),
        }
    }
}

impl ClientConfig {
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_listener_restart_delay(mut self, delay: Duration) -> Self {
        self.listener_restart_delay = delay;
        self
    }

    pub fn with_heartbeat_ms(mut self, heartbeat_ms: u64) -> Self {
        self.heartbeat_ms = heartbeat_ms;
        self
    }

    pub fn with_feed_timeout_ms(mut self, feed_timeout_ms: u64) -> Self {
        self.feed_timeout_ms = feed_timeout_ms;
        self
    }

    pub fn with_document_filter(mut self, filter: impl Into<String>) -> Self {
        self.document_filter = filter.into();
        self
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_timings() {
        let config = ClientConfig::default();
        assert_eq!(config.request_timeout, Duration::from_secs(20));
        assert_eq!(config.listener_restart_delay, Duration::from_millis(500));
        assert_eq!(config.heartbeat_ms, 10_000);
        assert_eq!(config.document_filter, "app/docFilter");
    }

    #[test]
    fn builder_overrides() {
        let config = ClientConfig::default()
            .with_request_timeout(Duration::from_secs(5))
            .with_listener_restart_delay(Duration::from_millis(50))
            .with_document_filter("_doc_ids");
        assert_eq!(config.request_timeout, Duration::from_secs(5));
        assert_eq!(config.listener_restart_delay, Duration::from_millis(50));
        assert_eq!(config.document_filter, "_doc_ids");
    }

    #[test]
    fn deserializes_durations_as_millis() {
        let config: ClientConfig =
            serde_json::from_str(r#"{"request_timeout":1500,"heartbeat_ms":2000}"#).unwrap();
        assert_eq!(config.request_timeout, Duration::from_millis(1500));
        assert_eq!(config.heartbeat_ms, 2000);
        assert_eq!(config.listener_restart_delay, DEFAULT_RESTART_DELAY);
    }
}
