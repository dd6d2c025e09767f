//! Server configuration
//!
//! Defaults overridden by `CHAT_RELAY_*` environment variables.

use std::collections::HashMap;
use std::time::Duration;

use thiserror::Error;

/// Default server address
pub const DEFAULT_ADDR: &str = "127.0.0.1:8080";

/// Outbound queue size per connection
pub const DEFAULT_OUTBOUND_BUFFER: usize = 32;

const DEFAULT_SEND_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_DRAIN_TIMEOUT_MS: u64 = 2_000;
const DEFAULT_SHUTDOWN_NOTICE: &str = "Server is shutting down";
const DEFAULT_CONVERSATIONS: [&str; 3] = ["Welcome", "Tech", "Jokes"];

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

/// Relay configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the TCP listener binds to
    pub addr: String,
    /// Outbound event queue size per connection
    pub outbound_buffer: usize,
    /// Upper bound on one socket write and on closing a connection
    pub send_timeout: Duration,
    /// Pause between the shutdown notice and closing connections
    pub drain_timeout: Duration,
    /// Notice sent to every connection on shutdown
    pub shutdown_notice: String,
    /// Conversations registered at startup
    pub default_conversations: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: DEFAULT_ADDR.to_string(),
            outbound_buffer: DEFAULT_OUTBOUND_BUFFER,
            send_timeout: Duration::from_millis(DEFAULT_SEND_TIMEOUT_MS),
            drain_timeout: Duration::from_millis(DEFAULT_DRAIN_TIMEOUT_MS),
            shutdown_notice: DEFAULT_SHUTDOWN_NOTICE.to_string(),
            default_conversations: DEFAULT_CONVERSATIONS.iter().map(|c| c.to_string()).collect(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(std::env::vars().collect())
    }

    /// Build configuration from a set of variables
    ///
    /// Unset variables keep their defaults.
    pub fn from_vars(vars: HashMap<String, String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(addr) = vars.get("CHAT_RELAY_ADDR") {
            config.addr = addr.clone();
        }
        if let Some(value) = vars.get("CHAT_RELAY_OUTBOUND_BUFFER") {
            config.outbound_buffer = match value.parse::<usize>() {
                Ok(n) if n > 0 => n,
                _ => return Err(invalid("CHAT_RELAY_OUTBOUND_BUFFER", value)),
            };
        }
        if let Some(value) = vars.get("CHAT_RELAY_SEND_TIMEOUT_MS") {
            config.send_timeout = parse_millis("CHAT_RELAY_SEND_TIMEOUT_MS", value)?;
        }
        if let Some(value) = vars.get("CHAT_RELAY_DRAIN_TIMEOUT_MS") {
            config.drain_timeout = parse_millis("CHAT_RELAY_DRAIN_TIMEOUT_MS", value)?;
        }
        if let Some(notice) = vars.get("CHAT_RELAY_SHUTDOWN_NOTICE") {
            config.shutdown_notice = notice.clone();
        }
        if let Some(value) = vars.get("CHAT_RELAY_CONVERSATIONS") {
            config.default_conversations = value
                .split(',')
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(str::to_string)
                .collect();
        }

        Ok(config)
    }
}

fn parse_millis(key: &'static str, value: &str) -> Result<Duration, ConfigError> {
    value
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|_| invalid(key, value))
}

fn invalid(key: &'static str, value: &str) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_defaults() {
        let config = ServerConfig::from_vars(HashMap::new()).unwrap();
        assert_eq!(config.addr, DEFAULT_ADDR);
        assert_eq!(config.outbound_buffer, 32);
        assert_eq!(config.send_timeout, Duration::from_secs(5));
        assert_eq!(config.drain_timeout, Duration::from_secs(2));
        assert_eq!(config.default_conversations, vec!["Welcome", "Tech", "Jokes"]);
    }

    #[test]
    fn test_overrides() {
        let config = ServerConfig::from_vars(vars(&[
            ("CHAT_RELAY_ADDR", "0.0.0.0:9000"),
            ("CHAT_RELAY_DRAIN_TIMEOUT_MS", "0"),
            ("CHAT_RELAY_CONVERSATIONS", "general, random,,"),
        ]))
        .unwrap();

        assert_eq!(config.addr, "0.0.0.0:9000");
        assert!(config.drain_timeout.is_zero());
        assert_eq!(config.default_conversations, vec!["general", "random"]);
    }

    #[test]
    fn test_invalid_number() {
        let err = ServerConfig::from_vars(vars(&[("CHAT_RELAY_SEND_TIMEOUT_MS", "soon")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "CHAT_RELAY_SEND_TIMEOUT_MS", .. }));
    }

    #[test]
    fn test_zero_buffer_rejected() {
        assert!(ServerConfig::from_vars(vars(&[("CHAT_RELAY_OUTBOUND_BUFFER", "0")])).is_err());
    }
}
