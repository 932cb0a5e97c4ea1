//! Application configuration.
//!
//! Every field has a default, so an empty TOML document is a valid config:
//!
//! ```toml
//! host = "0.0.0.0"
//! port = 8080
//! health_path = "/health"
//! health_interval_ms = 30000
//! handler_timeout_ms = 30000
//! max_request_bytes = 8388608
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Default cap on a buffered request (head plus body), 8 MiB.
pub const DEFAULT_MAX_REQUEST_BYTES: usize = 8 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    /// Path answered with `200 {"ok":true}`; prefixed with `/` if missing.
    pub health_path: String,
    /// Period of the listener's self-check against `health_path`. Unset
    /// means no self-check.
    pub health_interval_ms: Option<u64>,
    /// Deadline for a handler to produce its response. Unset means no limit.
    pub handler_timeout_ms: Option<u64>,
    pub max_request_bytes: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            health_path: "/health".to_string(),
            health_interval_ms: None,
            handler_timeout_ms: None,
            max_request_bytes: DEFAULT_MAX_REQUEST_BYTES,
        }
    }
}

impl AppConfig {
    /// Parses and validates a TOML document.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Parse`] for malformed TOML or unknown keys,
    /// [`ConfigError::Invalid`] for values that parse but make no sense.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let mut config: Self = toml::from_str(source)?;
        config.validate()?;
        if !config.health_path.starts_with('/') {
            config.health_path.insert(0, '/');
        }
        Ok(config)
    }

    /// Reads and parses a TOML file.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Read`] if the file cannot be read, otherwise as
    /// [`from_toml_str`](Self::from_toml_str).
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&source)
    }

    /// `host:port` for the listener.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn handler_timeout(&self) -> Option<Duration> {
        self.handler_timeout_ms.map(Duration::from_millis)
    }

    pub fn health_interval(&self) -> Option<Duration> {
        self.health_interval_ms.map(Duration::from_millis)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::Invalid("host must not be empty".into()));
        }
        if self.handler_timeout_ms == Some(0) {
            return Err(ConfigError::Invalid(
                "handler_timeout_ms must be positive; omit it to disable".into(),
            ));
        }
        if self.health_interval_ms == Some(0) {
            return Err(ConfigError::Invalid(
                "health_interval_ms must be positive; omit it to disable".into(),
            ));
        }
        if self.max_request_bytes == 0 {
            return Err(ConfigError::Invalid("max_request_bytes must be positive".into()));
        }
        Ok(())
    }
}
