//! Server configuration
//!
//! Defaults cover a local run. A JSON file can override any subset of the
//! fields, and the binary's command line overrides the file.

use crate::error::ServerError;
use serde::{Deserialize, Serialize};
use shared::framing::{DEFAULT_MAX_FRAME_LEN, LENGTH_PREFIX};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Interface to bind both sockets on
    pub host: String,
    /// Shared TCP/UDP port; 0 lets the OS pick one
    pub port: u16,
    /// Number of client slots, ids 1..=max_players
    pub max_players: u32,
    /// Simulation ticks per second
    pub tick_rate: u32,
    /// Largest frame length a stream peer may declare
    pub max_frame_len: usize,
    /// Seconds a stream may stay silent before it is dropped; 0 disables
    pub idle_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: shared::DEFAULT_PORT,
            max_players: 50,
            tick_rate: 30,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            idle_timeout_secs: 30,
        }
    }
}

impl ServerConfig {
    /// Loads a config from a JSON file; missing fields take their defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ServerError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text)
            .map_err(|e| ServerError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn validate(&self) -> Result<(), ServerError> {
        if self.max_players == 0 || self.max_players > i32::MAX as u32 {
            return Err(ServerError::Config(format!(
                "max_players must be between 1 and {}, got {}",
                i32::MAX,
                self.max_players
            )));
        }
        if self.tick_rate == 0 {
            return Err(ServerError::Config("tick_rate must be at least 1".into()));
        }
        if self.max_frame_len < 2 * LENGTH_PREFIX {
            return Err(ServerError::Config(format!(
                "max_frame_len must be at least {} bytes",
                2 * LENGTH_PREFIX
            )));
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_default_config_is_valid() {
        let config = ServerConfig::default();
        assert_ok!(config.validate());
        assert_eq!(config.port, 26950);
        assert_eq!(config.bind_addr(), "0.0.0.0:26950");
        assert_eq!(config.idle_timeout(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let mut config = ServerConfig {
            max_players: 0,
            ..ServerConfig::default()
        };
        assert_err!(config.validate());

        config.max_players = 4;
        config.tick_rate = 0;
        assert_err!(config.validate());

        config.tick_rate = 30;
        config.max_frame_len = 4;
        assert_err!(config.validate());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: ServerConfig =
            serde_json::from_str(r#"{ "port": 7777, "idle_timeout_secs": 0 }"#).unwrap();
        assert_eq!(config.port, 7777);
        assert_eq!(config.max_players, 50);
        assert_eq!(config.idle_timeout(), None);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = ServerConfig::from_file("/nonexistent/server.json").unwrap_err();
        assert!(matches!(err, ServerError::Io(_)));
    }
}
