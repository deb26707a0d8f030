//! Router configuration management

use std::path::{Path, PathBuf};
use std::time::Duration;

use linerpc_core::LogLevel;
use serde::{Deserialize, Serialize};

/// Default timeout for outgoing requests (milliseconds).
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;

/// Default maximum inbound line size (10MB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// Default number of outgoing requests allowed in flight.
pub const DEFAULT_MAX_PENDING_REQUESTS: usize = 64;

/// Default time a stopping router waits for the peer to read queued lines
/// (milliseconds).
pub const DEFAULT_FLUSH_TIMEOUT_MS: u64 = 2_000;

/// Default `logger` field of logging notifications.
pub const DEFAULT_LOGGER_NAME: &str = "linerpc";

/// Environment prefix for configuration overrides.
pub const ENV_PREFIX: &str = "LINERPC";

/// Router configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Timeout applied by `send_request` when none is given (milliseconds)
    pub request_timeout_ms: u64,
    /// Name placed in the `logger` field of logging notifications
    pub logger_name: String,
    /// Minimum level of logging notifications sent to the peer
    pub log_level: LogLevel,
    /// Inbound lines longer than this are rejected unparsed
    pub max_message_size: usize,
    /// Outgoing requests allowed to await a response at once
    pub max_pending_requests: usize,
    /// How long stopping waits for queued lines to be written before
    /// dropping them (milliseconds)
    pub flush_timeout_ms: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            logger_name: DEFAULT_LOGGER_NAME.to_string(),
            log_level: LogLevel::Debug,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            max_pending_requests: DEFAULT_MAX_PENDING_REQUESTS,
            flush_timeout_ms: DEFAULT_FLUSH_TIMEOUT_MS,
        }
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Config file not found
    #[error("Configuration file not found: {0}")]
    FileNotFound(PathBuf),

    /// Unsupported file format
    #[error("Unsupported configuration file format. Use .toml, .yaml, .yml, or .json")]
    UnsupportedFormat,

    /// Configuration parsing error
    #[error("Failed to parse configuration: {0}")]
    ParseError(#[from] config::ConfigError),

    /// A value parsed but makes no sense
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl RouterConfig {
    /// Create a builder for router configuration.
    #[must_use]
    pub fn builder() -> RouterConfigBuilder {
        RouterConfigBuilder::default()
    }

    /// Default timeout for outgoing requests.
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Grace period for flushing queued lines on stop.
    #[must_use]
    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }

    /// Load configuration from a file (TOML, YAML, or JSON).
    ///
    /// Environment variables with the `LINERPC__` prefix override file
    /// settings, e.g. `LINERPC__REQUEST_TIMEOUT_MS=5000`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing, has an unknown extension, or
    /// contains invalid configuration.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        use config::{Config, File, FileFormat};

        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.to_path_buf()));
        }

        let format = match path.extension().and_then(|s| s.to_str()) {
            Some("toml") => FileFormat::Toml,
            Some("yaml" | "yml") => FileFormat::Yaml,
            Some("json") => FileFormat::Json,
            _ => return Err(ConfigError::UnsupportedFormat),
        };
        let path_str = path.to_str().ok_or(ConfigError::UnsupportedFormat)?;

        let config = Config::builder()
            .add_source(File::new(path_str, format))
            .add_source(environment())
            .build()?;

        let loaded: Self = config.try_deserialize()?;
        loaded.validate()
    }

    /// Load configuration from `LINERPC__*` environment variables only.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable holds a value of the wrong type.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = config::Config::builder().add_source(environment()).build()?;
        let loaded: Self = config.try_deserialize()?;
        loaded.validate()
    }

    fn validate(self) -> Result<Self, ConfigError> {
        if self.max_pending_requests == 0 {
            return Err(ConfigError::Invalid(
                "max_pending_requests must be at least 1".to_string(),
            ));
        }
        if self.max_message_size == 0 {
            return Err(ConfigError::Invalid(
                "max_message_size must be at least 1".to_string(),
            ));
        }
        Ok(self)
    }
}

fn environment() -> config::Environment {
    config::Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("__")
        .separator("__")
        .try_parsing(true)
}

/// Builder for router configuration.
#[derive(Debug, Clone, Default)]
pub struct RouterConfigBuilder {
    config: RouterConfig,
}

impl RouterConfigBuilder {
    /// Set the default request timeout.
    #[must_use]
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Set the `logger` name used in logging notifications.
    #[must_use]
    pub fn logger_name(mut self, name: impl Into<String>) -> Self {
        self.config.logger_name = name.into();
        self
    }

    /// Set the initial minimum log level.
    #[must_use]
    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.config.log_level = level;
        self
    }

    /// Set the maximum inbound line size in bytes.
    #[must_use]
    pub fn max_message_size(mut self, size: usize) -> Self {
        self.config.max_message_size = size.max(1);
        self
    }

    /// Set the number of outgoing requests allowed in flight.
    #[must_use]
    pub fn max_pending_requests(mut self, limit: usize) -> Self {
        self.config.max_pending_requests = limit.max(1);
        self
    }

    /// Set the grace period for flushing queued lines on stop.
    #[must_use]
    pub fn flush_timeout(mut self, timeout: Duration) -> Self {
        self.config.flush_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Build the configuration.
    #[must_use]
    pub fn build(self) -> RouterConfig {
        self.config
    }
}
