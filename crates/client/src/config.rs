//! Client configuration from environment variables.

use std::str::FromStr;
use std::time::Duration;

/// Runtime configuration for a chat session.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    /// Base URL of the REST backend, e.g. `http://localhost:8000`.
    pub api_url: String,
    /// WebSocket endpoint speaking STOMP.
    pub ws_url: String,
    /// Fixed delay between connection attempts.
    pub reconnect_delay: Duration,
    /// Interval between presence heartbeats while connected.
    pub heartbeat_interval: Duration,
    /// Inactivity window after which a typing burst ends.
    pub typing_timeout: Duration,
    /// Page size for message history and conversation lists.
    pub page_size: u32,
    /// Sent with presence announcements and heartbeats.
    pub device_info: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:8000".to_string(),
            ws_url: "ws://localhost:8000/ws/chat/websocket".to_string(),
            reconnect_delay: Duration::from_millis(5000),
            heartbeat_interval: Duration::from_secs(30),
            typing_timeout: Duration::from_millis(3000),
            page_size: 50,
            device_info: "desktop".to_string(),
        }
    }
}

impl ClientConfig {
    /// Parse configuration from environment variables.
    ///
    /// Environment variables:
    /// - `CHATSYNC_API_URL`: REST base URL (default: "http://localhost:8000")
    /// - `CHATSYNC_WS_URL`: STOMP WebSocket URL (default: "ws://localhost:8000/ws/chat/websocket")
    /// - `CHATSYNC_RECONNECT_DELAY_MS`: reconnect backoff (default: 5000)
    /// - `CHATSYNC_HEARTBEAT_SECS`: heartbeat interval (default: 30)
    /// - `CHATSYNC_TYPING_TIMEOUT_MS`: typing inactivity window (default: 3000)
    /// - `CHATSYNC_PAGE_SIZE`: history page size (default: 50)
    /// - `CHATSYNC_DEVICE_INFO`: device label for presence (default: "desktop")
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            api_url: lookup("CHATSYNC_API_URL").unwrap_or(defaults.api_url),
            ws_url: lookup("CHATSYNC_WS_URL").unwrap_or(defaults.ws_url),
            reconnect_delay: Duration::from_millis(parse_or(
                &lookup,
                "CHATSYNC_RECONNECT_DELAY_MS",
                5000u64,
            )),
            heartbeat_interval: Duration::from_secs(parse_or(
                &lookup,
                "CHATSYNC_HEARTBEAT_SECS",
                30u64,
            )),
            typing_timeout: Duration::from_millis(parse_or(
                &lookup,
                "CHATSYNC_TYPING_TIMEOUT_MS",
                3000u64,
            )),
            page_size: parse_or(&lookup, "CHATSYNC_PAGE_SIZE", defaults.page_size),
            device_info: lookup("CHATSYNC_DEVICE_INFO")
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(defaults.device_info),
        }
    }
}

/// Parse a positive number, falling back to `default` (with a warning) when
/// the value is present but unusable.
fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T: FromStr + PartialOrd + Default,
{
    let Some(raw) = lookup(key) else {
        return default;
    };
    match raw.trim().parse::<T>() {
        Ok(value) if value > T::default() => value,
        _ => {
            crate::log_warn!("ignoring invalid {}={:?}, using default", key, raw);
            default
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn empty_environment_gives_defaults() {
        assert_eq!(ClientConfig::from_lookup(lookup(&[])), ClientConfig::default());
    }

    #[test]
    fn overrides_are_applied() {
        let config = ClientConfig::from_lookup(lookup(&[
            ("CHATSYNC_WS_URL", "wss://chat.example.com/ws/chat/websocket"),
            ("CHATSYNC_RECONNECT_DELAY_MS", "250"),
            ("CHATSYNC_HEARTBEAT_SECS", "10"),
            ("CHATSYNC_PAGE_SIZE", "20"),
            ("CHATSYNC_DEVICE_INFO", "web"),
        ]));
        assert_eq!(config.ws_url, "wss://chat.example.com/ws/chat/websocket");
        assert_eq!(config.reconnect_delay, Duration::from_millis(250));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(10));
        assert_eq!(config.page_size, 20);
        assert_eq!(config.device_info, "web");
    }

    #[test]
    fn invalid_numbers_fall_back() {
        let config = ClientConfig::from_lookup(lookup(&[
            ("CHATSYNC_TYPING_TIMEOUT_MS", "soon"),
            ("CHATSYNC_HEARTBEAT_SECS", "0"),
            ("CHATSYNC_DEVICE_INFO", "  "),
        ]));
        assert_eq!(config.typing_timeout, Duration::from_millis(3000));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.device_info, "desktop");
    }
}
