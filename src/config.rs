//! Bridge configuration
//!
//! Loaded from TOML (every field defaulted) with `NATIVE_BRIDGE_*`
//! environment overrides applied on top.

use crate::error::BridgeError;
use crate::logging::LogConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub logging: LogConfig,

    #[serde(default)]
    pub event_loop: EventLoopConfig,

    #[serde(default)]
    pub shutdown: ShutdownConfig,

    #[serde(default)]
    pub loopback: LoopbackConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventLoopConfig {
    /// Native worker threads delivering callbacks
    #[serde(default = "default_threads")]
    pub threads: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShutdownConfig {
    /// Upper bound for `join_all_threads` when the caller gives none
    #[serde(default = "default_join_timeout_ms")]
    pub join_timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopbackConfig {
    /// Size of each response body chunk delivered to `on_body`
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Largest request body a loopback stream accepts
    #[serde(default = "default_max_body")]
    pub max_body_size: usize,
}

fn default_threads() -> usize {
    2
}

fn default_join_timeout_ms() -> u64 {
    5_000
}

fn default_chunk_size() -> usize {
    16 * 1024
}

fn default_max_body() -> usize {
    8 * 1024 * 1024
}

impl Default for EventLoopConfig {
    fn default() -> Self {
        Self {
            threads: default_threads(),
        }
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            join_timeout_ms: default_join_timeout_ms(),
        }
    }
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            max_body_size: default_max_body(),
        }
    }
}

impl ShutdownConfig {
    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }
}

impl BridgeConfig {
    /// Load from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, BridgeError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|e| BridgeError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, BridgeError> {
        let config: Self =
            toml::from_str(content).map_err(|e| BridgeError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides
    pub fn from_env() -> Result<Self, BridgeError> {
        Self::default().with_env_overrides()
    }

    pub fn with_env_overrides(mut self) -> Result<Self, BridgeError> {
        self.logging = self.logging.with_env_overrides();

        if let Ok(threads) = std::env::var("NATIVE_BRIDGE_THREADS") {
            self.event_loop.threads = threads
                .parse()
                .map_err(|_| BridgeError::Config(format!("NATIVE_BRIDGE_THREADS={threads}")))?;
        }

        if let Ok(ms) = std::env::var("NATIVE_BRIDGE_JOIN_TIMEOUT_MS") {
            self.shutdown.join_timeout_ms = ms
                .parse()
                .map_err(|_| BridgeError::Config(format!("NATIVE_BRIDGE_JOIN_TIMEOUT_MS={ms}")))?;
        }

        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), BridgeError> {
        if self.event_loop.threads == 0 {
            return Err(BridgeError::Config("event_loop.threads must be at least 1".into()));
        }
        if self.loopback.chunk_size == 0 {
            return Err(BridgeError::Config("loopback.chunk_size must be at least 1".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_toml_gives_defaults() {
        let config = BridgeConfig::from_toml_str("").unwrap();
        assert_eq!(config, BridgeConfig::default());
        assert_eq!(config.event_loop.threads, 2);
        assert_eq!(config.shutdown.join_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_partial_sections() {
        let config = BridgeConfig::from_toml_str(
            r#"
            [event_loop]
            threads = 4

            [loopback]
            chunk_size = 3

            [logging]
            level = "debug"
            format = "json"
            "#,
        )
        .unwrap();

        assert_eq!(config.event_loop.threads, 4);
        assert_eq!(config.loopback.chunk_size, 3);
        assert_eq!(config.loopback.max_body_size, 8 * 1024 * 1024);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, crate::logging::LogFormat::Json);
    }

    #[test]
    fn test_zero_threads_rejected() {
        let err = BridgeConfig::from_toml_str("[event_loop]\nthreads = 0\n").unwrap_err();
        assert!(matches!(err, BridgeError::Config(_)));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[shutdown]\njoin_timeout_ms = 250").unwrap();

        let config = BridgeConfig::from_file(file.path()).unwrap();
        assert_eq!(config.shutdown.join_timeout(), Duration::from_millis(250));
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let err = BridgeConfig::from_file("/definitely/not/here.toml").unwrap_err();
        assert!(matches!(err, BridgeError::Config(_)));
    }
}
