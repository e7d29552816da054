//! Environment-driven configuration for the relay binary

use std::time::Duration;

use crate::client::SessionOptions;
use crate::types::{Endpoint, EndpointError};

pub const DEFAULT_ENDPOINT: &str = "ws://localhost:8080/logs/websocket";
pub const DEFAULT_TOPIC: &str = "/api/topics/logs";
pub const DEFAULT_DESTINATION: &str = "/app/logTopic";

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Raw endpoint URL, validated by `endpoint()`
    pub endpoint: String,
    /// Topic to subscribe to
    pub topic: String,
    /// Destination user input is published to
    pub destination: String,
    /// STOMP `host` header override
    pub host: Option<String>,
    pub connect_timeout: Duration,
    pub disconnect_timeout: Duration,
    pub heartbeat_out_ms: u64,
    pub heartbeat_in_ms: u64,
    /// Localization dictionary URL (None = no dictionary)
    pub i18n_url: Option<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        let session = SessionOptions::default();
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            topic: DEFAULT_TOPIC.to_string(),
            destination: DEFAULT_DESTINATION.to_string(),
            host: None,
            connect_timeout: session.connect_timeout,
            disconnect_timeout: session.disconnect_timeout,
            heartbeat_out_ms: session.heartbeat.0,
            heartbeat_in_ms: session.heartbeat.1,
            i18n_url: None,
        }
    }
}

/// Trimmed, non-empty env var
fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    })
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = env_string(name)?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!("Ignoring {}={:?}: not a valid number", name, raw);
            None
        }
    }
}

impl RelayConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let config = Self {
            endpoint: env_string("RELAY_ENDPOINT").unwrap_or(defaults.endpoint),
            topic: env_string("RELAY_TOPIC").unwrap_or(defaults.topic),
            destination: env_string("RELAY_DESTINATION").unwrap_or(defaults.destination),
            host: env_string("RELAY_HOST"),
            connect_timeout: env_parse("RELAY_CONNECT_TIMEOUT")
                .map(Duration::from_secs)
                .unwrap_or(defaults.connect_timeout),
            disconnect_timeout: env_parse("RELAY_DISCONNECT_TIMEOUT")
                .map(Duration::from_secs)
                .unwrap_or(defaults.disconnect_timeout),
            heartbeat_out_ms: env_parse("RELAY_HEARTBEAT_OUT_MS")
                .unwrap_or(defaults.heartbeat_out_ms),
            heartbeat_in_ms: env_parse("RELAY_HEARTBEAT_IN_MS").unwrap_or(defaults.heartbeat_in_ms),
            i18n_url: env_string("I18N_URL"),
        };

        tracing::info!(
            endpoint = %config.endpoint,
            topic = %config.topic,
            destination = %config.destination,
            i18n = config.i18n_url.is_some(),
            "Relay config loaded"
        );

        config
    }

    pub fn endpoint(&self) -> Result<Endpoint, EndpointError> {
        Endpoint::parse(&self.endpoint)
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            host: self.host.clone(),
            connect_timeout: self.connect_timeout,
            disconnect_timeout: self.disconnect_timeout,
            heartbeat: (self.heartbeat_out_ms, self.heartbeat_in_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: &[&str] = &[
        "RELAY_ENDPOINT",
        "RELAY_TOPIC",
        "RELAY_DESTINATION",
        "RELAY_HOST",
        "RELAY_CONNECT_TIMEOUT",
        "RELAY_DISCONNECT_TIMEOUT",
        "RELAY_HEARTBEAT_OUT_MS",
        "RELAY_HEARTBEAT_IN_MS",
        "I18N_URL",
    ];

    fn clear_env() {
        for var in VARS {
            std::env::remove_var(var);
        }
    }

    #[test]
    fn test_default_config() {
        let config = RelayConfig::default();
        assert_eq!(config.endpoint, DEFAULT_ENDPOINT);
        assert_eq!(config.topic, "/api/topics/logs");
        assert_eq!(config.destination, "/app/logTopic");
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert!(config.i18n_url.is_none());
        assert_eq!(config.endpoint().unwrap().host(), "localhost");
    }

    #[test]
    #[serial]
    fn test_from_env_defaults_when_unset() {
        clear_env();
        let config = RelayConfig::from_env();
        assert_eq!(config.endpoint, DEFAULT_ENDPOINT);
        assert_eq!(config.heartbeat_out_ms, 10_000);
        assert!(config.host.is_none());
    }

    #[test]
    #[serial]
    fn test_from_env_overrides() {
        clear_env();
        std::env::set_var("RELAY_ENDPOINT", "  wss://relay.example.org/guestbook/websocket ");
        std::env::set_var("RELAY_TOPIC", "/topic/entries");
        std::env::set_var("RELAY_DESTINATION", "/app/guestbook");
        std::env::set_var("RELAY_HOST", "vhost");
        std::env::set_var("RELAY_CONNECT_TIMEOUT", "3");
        std::env::set_var("RELAY_HEARTBEAT_IN_MS", "0");
        std::env::set_var("I18N_URL", "http://localhost:8080/JSON/translate/i18n");

        let config = RelayConfig::from_env();
        clear_env();

        assert_eq!(
            config.endpoint,
            "wss://relay.example.org/guestbook/websocket"
        );
        assert_eq!(config.topic, "/topic/entries");
        assert_eq!(config.destination, "/app/guestbook");
        assert_eq!(config.connect_timeout, Duration::from_secs(3));

        let options = config.session_options();
        assert_eq!(options.host.as_deref(), Some("vhost"));
        assert_eq!(options.heartbeat, (10_000, 0));
        assert_eq!(
            config.i18n_url.as_deref(),
            Some("http://localhost:8080/JSON/translate/i18n")
        );
    }

    #[test]
    #[serial]
    fn test_from_env_ignores_blank_and_invalid() {
        clear_env();
        std::env::set_var("RELAY_TOPIC", "   ");
        std::env::set_var("RELAY_CONNECT_TIMEOUT", "soon");

        let config = RelayConfig::from_env();
        clear_env();

        assert_eq!(config.topic, DEFAULT_TOPIC);
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
    }
}
